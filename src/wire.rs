//! JSON wire-format helpers shared by the HTTP and WebSocket surfaces.

use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use sirannon_pool::Params;

use crate::api_error::ApiError;

/// JSON params as received over the wire: a positional array or a named
/// object, mirroring [`Params`]'s two variants.
pub fn params_from_json(value: Option<JsonValue>) -> Result<Params, ApiError> {
   match value {
      None | Some(JsonValue::Null) => Ok(Params::none()),
      Some(JsonValue::Array(items)) => Ok(Params::Positional(items)),
      Some(JsonValue::Object(map)) => {
         let mut named = IndexMap::new();
         for (k, v) in map {
            named.insert(k, v);
         }
         Ok(Params::Named(named))
      }
      Some(_) => Err(ApiError::invalid_request("params must be an array or object")),
   }
}

/// Render an `i64` row id as a JSON number, or a string when it would lose
/// precision in a JS `number` (outside `[-(2^53-1), 2^53-1]`).
pub fn last_insert_row_id_json(value: i64) -> JsonValue {
   const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991;
   if value.abs() <= MAX_SAFE_INTEGER {
      JsonValue::from(value)
   } else {
      JsonValue::String(value.to_string())
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn params_from_json_array_is_positional() {
      let params = params_from_json(Some(serde_json::json!([1, "a"]))).unwrap();
      assert!(matches!(params, Params::Positional(v) if v.len() == 2));
   }

   #[test]
   fn params_from_json_object_is_named() {
      let params = params_from_json(Some(serde_json::json!({"a": 1}))).unwrap();
      assert!(matches!(params, Params::Named(m) if m.len() == 1));
   }

   #[test]
   fn params_from_json_rejects_scalars() {
      assert!(params_from_json(Some(serde_json::json!(5))).is_err());
   }

   #[test]
   fn last_insert_row_id_json_stringifies_beyond_safe_integer() {
      assert_eq!(last_insert_row_id_json(42), serde_json::json!(42));
      assert_eq!(last_insert_row_id_json(9_007_199_254_740_992), serde_json::json!("9007199254740992"));
   }
}

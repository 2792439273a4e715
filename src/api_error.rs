//! Network-surface error type: wraps a machine-readable code and message,
//! and maps it onto an HTTP status via an explicit table (never by deriving
//! the status from the error type itself).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::json;

/// A single network-surface error, ready to be serialized as either an HTTP
/// JSON body or a WebSocket `error` frame payload.
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
   pub code: &'static str,
   pub message: String,
   #[serde(skip_serializing_if = "Option::is_none")]
   pub sql: Option<String>,
   #[serde(skip_serializing_if = "Option::is_none")]
   pub version: Option<i64>,
}

impl ApiError {
   pub fn new(code: &'static str, message: impl Into<String>) -> Self {
      Self { code, message: message.into(), sql: None, version: None }
   }

   pub fn invalid_request(message: impl Into<String>) -> Self {
      Self::new("INVALID_REQUEST", message)
   }

   pub fn invalid_json(message: impl Into<String>) -> Self {
      Self::new("INVALID_JSON", message)
   }

   pub fn empty_body() -> Self {
      Self::new("EMPTY_BODY", "request body must not be empty")
   }

   pub fn not_found(message: impl Into<String>) -> Self {
      Self::new("NOT_FOUND", message)
   }

   pub fn hook_error(message: impl Into<String>) -> Self {
      Self::new("HOOK_ERROR", message)
   }

   pub fn status(&self) -> StatusCode {
      status_for_code(self.code)
   }
}

impl From<&sirannon_core::Error> for ApiError {
   fn from(err: &sirannon_core::Error) -> Self {
      let code = err.code();
      // `code()` always returns a value from the fixed error-code set, so this
      // lookup never falls through to the generic leak branch below.
      let code: &'static str = ALL_CODES.iter().find(|c| **c == code).copied().unwrap_or("INTERNAL_ERROR");
      Self {
         code,
         message: err.to_string(),
         sql: err.sql().map(str::to_string),
         version: match err {
            sirannon_core::Error::Migration { version, .. } => Some(*version),
            _ => None,
         },
      }
   }
}

impl From<sirannon_core::Error> for ApiError {
   fn from(err: sirannon_core::Error) -> Self {
      ApiError::from(&err)
   }
}

impl IntoResponse for ApiError {
   fn into_response(self) -> Response {
      let status = self.status();
      (status, axum::Json(json!({ "error": self }))).into_response()
   }
}

const ALL_CODES: &[&str] = &[
   "DATABASE_NOT_FOUND",
   "DATABASE_ALREADY_EXISTS",
   "DATABASE_CLOSED",
   "DATABASE_OPEN_FAILED",
   "READ_ONLY",
   "QUERY_ERROR",
   "TRANSACTION_ERROR",
   "MIGRATION_ERROR",
   "HOOK_DENIED",
   "CDC_ERROR",
   "CDC_UNSUPPORTED",
   "BACKUP_ERROR",
   "CONNECTION_POOL_ERROR",
   "MAX_DATABASES",
   "EXTENSION_ERROR",
   "SHUTDOWN",
   "SHUTDOWN_ERROR",
   "LIFECYCLE_DISPOSED",
];

/// The error-code → HTTP status mapping. Background loops and transaction
/// rollbacks never go through this; it is consulted only at the HTTP/WS
/// boundary.
pub fn status_for_code(code: &str) -> StatusCode {
   match code {
      "DATABASE_NOT_FOUND" | "NOT_FOUND" => StatusCode::NOT_FOUND,

      "READ_ONLY" | "HOOK_DENIED" | "UNAUTHORIZED" => StatusCode::FORBIDDEN,

      "QUERY_ERROR" | "TRANSACTION_ERROR" | "MIGRATION_ERROR" | "INVALID_REQUEST" | "INVALID_JSON" | "EMPTY_BODY"
      | "UNKNOWN_TYPE" | "INVALID_MESSAGE" | "DUPLICATE_SUBSCRIPTION" | "SUBSCRIPTION_NOT_FOUND" | "CDC_ERROR"
      | "CDC_UNSUPPORTED" => StatusCode::BAD_REQUEST,

      "DATABASE_ALREADY_EXISTS" => StatusCode::CONFLICT,

      "PAYLOAD_TOO_LARGE" => StatusCode::PAYLOAD_TOO_LARGE,

      "DATABASE_CLOSED" | "MAX_DATABASES" | "SHUTDOWN" | "LIFECYCLE_DISPOSED" | "CONNECTION_POOL_ERROR" => {
         StatusCode::SERVICE_UNAVAILABLE
      }

      // BACKUP_ERROR, EXTENSION_ERROR, SHUTDOWN_ERROR, HOOK_ERROR, DATABASE_OPEN_FAILED,
      // INTERNAL_ERROR and anything unrecognized.
      _ => StatusCode::INTERNAL_SERVER_ERROR,
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn database_not_found_maps_to_404() {
      let err = sirannon_core::Error::DatabaseNotFound("x".to_string());
      let api_err: ApiError = (&err).into();
      assert_eq!(api_err.code, "DATABASE_NOT_FOUND");
      assert_eq!(api_err.status(), StatusCode::NOT_FOUND);
   }

   #[test]
   fn read_only_maps_to_403() {
      let api_err: ApiError = (&sirannon_core::Error::ReadOnly).into();
      assert_eq!(api_err.status(), StatusCode::FORBIDDEN);
   }

   #[test]
   fn migration_error_carries_version() {
      let err = sirannon_core::Error::Migration { version: 3, message: "boom".to_string() };
      let api_err: ApiError = (&err).into();
      assert_eq!(api_err.code, "MIGRATION_ERROR");
      assert_eq!(api_err.version, Some(3));
      assert_eq!(api_err.status(), StatusCode::BAD_REQUEST);
   }

   #[test]
   fn shutdown_maps_to_503() {
      let api_err: ApiError = (&sirannon_core::Error::Shutdown).into();
      assert_eq!(api_err.status(), StatusCode::SERVICE_UNAVAILABLE);
   }
}

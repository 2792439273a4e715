//! Identifier validation and quoting for generated DDL.
//!
//! Table and column names come from caller-supplied strings (`watch(table)`)
//! and must never be interpolated into DDL unchecked: this is the boundary
//! that keeps CDC trigger generation from being a SQL-injection vector.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

static IDENTIFIER_RE: LazyLock<Regex> =
   LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Reject any identifier not matching `^[A-Za-z_][A-Za-z0-9_]*$`.
pub fn validate(identifier: &str) -> Result<()> {
   if IDENTIFIER_RE.is_match(identifier) {
      Ok(())
   } else {
      Err(Error::InvalidIdentifier(identifier.to_string()))
   }
}

/// Double-quote an already-validated identifier for use in DDL.
pub fn quote(identifier: &str) -> String {
   format!("\"{identifier}\"")
}

/// Double any single quotes in a string destined for a SQL string literal.
pub fn quote_literal(value: &str) -> String {
   value.replace('\'', "''")
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn accepts_valid_identifiers() {
      assert!(validate("users").is_ok());
      assert!(validate("_internal").is_ok());
      assert!(validate("col_1").is_ok());
   }

   #[test]
   fn rejects_invalid_identifiers() {
      assert!(validate("1col").is_err());
      assert!(validate("users; DROP TABLE x").is_err());
      assert!(validate("").is_err());
      assert!(validate("a-b").is_err());
   }

   #[test]
   fn quote_literal_doubles_single_quotes() {
      assert_eq!(quote_literal("O'Brien"), "O''Brien");
   }
}

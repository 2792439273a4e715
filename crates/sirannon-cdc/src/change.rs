//! The change event delivered to poll callers and subscribers.

use indexmap::IndexMap;
use serde_json::Value as JsonValue;

/// A query result row: column name to JSON value, in column order.
pub type Row = IndexMap<String, JsonValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeOperation {
   Insert,
   Update,
   Delete,
}

impl ChangeOperation {
   pub fn as_str(&self) -> &'static str {
      match self {
         ChangeOperation::Insert => "INSERT",
         ChangeOperation::Update => "UPDATE",
         ChangeOperation::Delete => "DELETE",
      }
   }

   pub fn parse(s: &str) -> Option<Self> {
      match s {
         "INSERT" => Some(ChangeOperation::Insert),
         "UPDATE" => Some(ChangeOperation::Update),
         "DELETE" => Some(ChangeOperation::Delete),
         _ => None,
      }
   }
}

/// One row mutation, as delivered to poll callers and subscribers.
///
/// For INSERT, `old_row` is absent. For DELETE, `row` is empty and
/// `old_row` holds the prior state. For UPDATE both are present.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
   pub operation: ChangeOperation,
   pub table: String,
   pub row: Row,
   pub old_row: Option<Row>,
   /// Monotone log sequence number; strictly increasing across polls.
   pub seq: u64,
   /// Fractional seconds since epoch, as stored in the change log.
   pub timestamp: f64,
}

//! Stateless prepare/bind/iterate helper shared by readers, the writer, and
//! [`Transaction`](crate::Transaction).

use std::sync::Mutex;

use indexmap::IndexMap;
use lru::LruCache;
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteArguments, SqliteValueRef};
use sqlx::{Executor, Row as SqlxRow, Sqlite, TypeInfo, Value, ValueRef};

use crate::error::{Error, Result};

/// Default capacity of the per-connection prepared-statement cache.
pub const DEFAULT_STATEMENT_CACHE_CAPACITY: usize = 128;

/// A query result row: column name to JSON value, in column order.
pub type Row = IndexMap<String, JsonValue>;

/// Bound parameters for a query: either an ordered positional sequence or a
/// named map matched against `:name`/`@name`/`$name` placeholders in the SQL
/// text, in the order those placeholders appear.
#[derive(Debug, Clone)]
pub enum Params {
   Positional(Vec<JsonValue>),
   Named(IndexMap<String, JsonValue>),
}

impl Default for Params {
   fn default() -> Self {
      Params::Positional(Vec::new())
   }
}

impl Params {
   /// No parameters.
   pub fn none() -> Self {
      Self::default()
   }
}

impl From<Vec<JsonValue>> for Params {
   fn from(values: Vec<JsonValue>) -> Self {
      Params::Positional(values)
   }
}

impl From<IndexMap<String, JsonValue>> for Params {
   fn from(values: IndexMap<String, JsonValue>) -> Self {
      Params::Named(values)
   }
}

/// Outcome of a mutation: rows affected and the last inserted rowid.
///
/// `last_insert_rowid` is a full `i64` so callers at the network boundary can
/// decide when a value needs to be transmitted as a string to survive JSON's
/// 2^53-1 safe-integer limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteResult {
   pub changes: u64,
   pub last_insert_rowid: i64,
}

/// Per-connection bounded LRU of SQL strings deciding which statements sqlx
/// should prepare persistently.
///
/// SQLite statements are not thread-safe and sqlx already owns the actual
/// prepared handles inside the connection; this cache only decides the
/// policy (hot vs. cold SQL text) so the ≈128-entry/LRU-eviction contract is
/// directly testable without a live connection.
#[derive(Debug)]
struct StatementCache {
   inner: Mutex<LruCache<String, ()>>,
}

impl StatementCache {
   fn new(capacity: usize) -> Self {
      let capacity = std::num::NonZeroUsize::new(capacity.max(1)).expect("capacity >= 1");
      Self {
         inner: Mutex::new(LruCache::new(capacity)),
      }
   }

   /// Record use of `sql`, returning whether it should be prepared
   /// persistently (cached) for this call.
   fn touch(&self, sql: &str) -> bool {
      let mut cache = self.inner.lock().expect("statement cache poisoned");
      if cache.contains(sql) {
         cache.promote(sql);
         true
      } else {
         cache.put(sql.to_string(), ());
         true
      }
   }

   #[cfg(test)]
   fn len(&self) -> usize {
      self.inner.lock().expect("statement cache poisoned").len()
   }
}

/// Stateless prepare/bind/iterate helper over a single SQLite connection.
///
/// One `QueryExecutor` is shared by all readers and the writer of a
/// [`ConnectionPool`](crate::ConnectionPool); its cache tracks SQL text, not
/// connection identity, since the same queries tend to recur across readers.
#[derive(Debug)]
pub struct QueryExecutor {
   cache: StatementCache,
}

impl Default for QueryExecutor {
   fn default() -> Self {
      Self::new()
   }
}

impl QueryExecutor {
   pub fn new() -> Self {
      Self::with_capacity(DEFAULT_STATEMENT_CACHE_CAPACITY)
   }

   pub fn with_capacity(capacity: usize) -> Self {
      Self {
         cache: StatementCache::new(capacity),
      }
   }

   /// Run `sql` against `executor`, returning every matching row.
   pub async fn query<'e, E>(&self, executor: E, sql: &str, params: &Params) -> Result<Vec<Row>>
   where
      E: Executor<'e, Database = Sqlite>,
   {
      let persistent = self.cache.touch(sql);
      let query = self.bind(sql, params)?.persistent(persistent);
      let rows = query
         .fetch_all(executor)
         .await
         .map_err(|e| query_error(sql, e))?;
      rows.iter().map(row_to_record).collect()
   }

   /// Run `sql`, returning the first row if any.
   pub async fn query_one<'e, E>(
      &self,
      executor: E,
      sql: &str,
      params: &Params,
   ) -> Result<Option<Row>>
   where
      E: Executor<'e, Database = Sqlite>,
   {
      let persistent = self.cache.touch(sql);
      let query = self.bind(sql, params)?.persistent(persistent);
      let row = query
         .fetch_optional(executor)
         .await
         .map_err(|e| query_error(sql, e))?;
      row.as_ref().map(row_to_record).transpose()
   }

   /// Run a mutating statement, returning rows changed and the last rowid.
   pub async fn execute<'e, E>(
      &self,
      executor: E,
      sql: &str,
      params: &Params,
   ) -> Result<ExecuteResult>
   where
      E: Executor<'e, Database = Sqlite>,
   {
      let persistent = self.cache.touch(sql);
      let query = self.bind(sql, params)?.persistent(persistent);
      let result = query
         .execute(executor)
         .await
         .map_err(|e| query_error(sql, e))?;
      Ok(ExecuteResult {
         changes: result.rows_affected(),
         last_insert_rowid: result.last_insert_rowid(),
      })
   }

   /// Prepare `sql` once and run it once per entry of `params_batch` against
   /// the same connection, in order. An empty batch returns an empty vec.
   pub async fn execute_batch(
      &self,
      conn: &mut sqlx::SqliteConnection,
      sql: &str,
      params_batch: &[Params],
   ) -> Result<Vec<ExecuteResult>> {
      let persistent = self.cache.touch(sql);
      let mut results = Vec::with_capacity(params_batch.len());
      for params in params_batch {
         let query = self.bind(sql, params)?.persistent(persistent);
         let result = query
            .execute(&mut *conn)
            .await
            .map_err(|e| query_error(sql, e))?;
         results.push(ExecuteResult {
            changes: result.rows_affected(),
            last_insert_rowid: result.last_insert_rowid(),
         });
      }
      Ok(results)
   }

   fn bind<'q>(
      &self,
      sql: &'q str,
      params: &Params,
   ) -> Result<sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>> {
      let mut query = sqlx::query(sql);
      match params {
         Params::Positional(values) => {
            for value in values {
               query = bind_value(query, value.clone());
            }
         }
         Params::Named(map) => {
            for name in named_placeholders(sql) {
               let value = map.get(&name).cloned().ok_or_else(|| Error::Query {
                  sql: sql.to_string(),
                  message: format!("missing named parameter :{name}"),
               })?;
               query = bind_value(query, value);
            }
         }
      }
      Ok(query)
   }
}

fn query_error(sql: &str, err: sqlx::Error) -> Error {
   Error::Query {
      sql: sql.to_string(),
      message: err.to_string(),
   }
}

/// Bind a JSON value to a query, preserving integer precision where possible.
fn bind_value<'q>(
   query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
   value: JsonValue,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
   if value.is_null() {
      query.bind(None::<JsonValue>)
   } else if let Some(s) = value.as_str() {
      query.bind(s.to_owned())
   } else if let Some(b) = value.as_bool() {
      query.bind(b)
   } else if let Some(number) = value.as_number() {
      if let Some(int_val) = number.as_i64() {
         query.bind(int_val)
      } else if let Some(uint_val) = number.as_u64() {
         if uint_val <= i64::MAX as u64 {
            query.bind(uint_val as i64)
         } else {
            query.bind(uint_val as f64)
         }
      } else {
         query.bind(number.as_f64().unwrap_or_default())
      }
   } else {
      query.bind(value)
   }
}

/// Scan `sql` for `:name`/`@name`/`$name` placeholders in the order they
/// appear, skipping single-quoted strings, double-quoted identifiers, and
/// `--`/`/* */` comments.
fn named_placeholders(sql: &str) -> Vec<String> {
   let bytes = sql.as_bytes();
   let n = bytes.len();
   let mut result = Vec::new();
   let mut i = 0;

   while i < n {
      match bytes[i] {
         b'\'' => {
            i += 1;
            while i < n {
               if bytes[i] == b'\'' {
                  if i + 1 < n && bytes[i + 1] == b'\'' {
                     i += 2;
                     continue;
                  }
                  i += 1;
                  break;
               }
               i += 1;
            }
         }
         b'"' => {
            i += 1;
            while i < n && bytes[i] != b'"' {
               i += 1;
            }
            i += 1;
         }
         b'-' if i + 1 < n && bytes[i + 1] == b'-' => {
            while i < n && bytes[i] != b'\n' {
               i += 1;
            }
         }
         b'/' if i + 1 < n && bytes[i + 1] == b'*' => {
            i += 2;
            while i + 1 < n && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
               i += 1;
            }
            i = (i + 2).min(n);
         }
         b':' | b'@' | b'$' => {
            let start = i + 1;
            let mut j = start;
            while j < n && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_') {
               j += 1;
            }
            if j > start {
               result.push(sql[start..j].to_string());
               i = j;
            } else {
               i += 1;
            }
         }
         _ => i += 1,
      }
   }

   result
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<Row> {
   let mut record = Row::new();
   for (i, column) in row.columns().iter().enumerate() {
      let raw = row.try_get_raw(i).map_err(|e| Error::Query {
         sql: String::new(),
         message: e.to_string(),
      })?;
      record.insert(column.name().to_string(), to_json(raw)?);
   }
   Ok(record)
}

/// Convert a raw SQLite value to its JSON representation.
///
/// BLOB columns are base64-encoded since JSON has no binary type; integers
/// are preserved as `i64` where they fit so large rowids round-trip exactly.
fn to_json(value: SqliteValueRef) -> Result<JsonValue> {
   if value.is_null() {
      return Ok(JsonValue::Null);
   }

   let type_name = value.type_info().name().to_string();

   let result = match type_name.as_str() {
      "TEXT" | "DATE" | "TIME" => match value.to_owned().try_decode::<String>() {
         Ok(v) => JsonValue::String(v),
         Err(_) => JsonValue::Null,
      },
      "DATETIME" => match value.to_owned().try_decode::<time::PrimitiveDateTime>() {
         Ok(dt) => JsonValue::String(dt.to_string()),
         Err(_) => match value.to_owned().try_decode::<String>() {
            Ok(v) => JsonValue::String(v),
            Err(_) => JsonValue::Null,
         },
      },
      "REAL" => match value.to_owned().try_decode::<f64>() {
         Ok(v) => JsonValue::from(v),
         Err(_) => JsonValue::Null,
      },
      "INTEGER" | "NUMERIC" => match value.to_owned().try_decode::<i64>() {
         Ok(v) => JsonValue::Number(v.into()),
         Err(_) => JsonValue::Null,
      },
      "BOOLEAN" => match value.to_owned().try_decode::<bool>() {
         Ok(v) => JsonValue::Bool(v),
         Err(_) => JsonValue::Null,
      },
      "BLOB" => match value.to_owned().try_decode::<Vec<u8>>() {
         Ok(blob) => JsonValue::String(base64_encode(&blob)),
         Err(_) => JsonValue::Null,
      },
      "NULL" => JsonValue::Null,
      other => match value.to_owned().try_decode::<String>() {
         Ok(text) => JsonValue::String(text),
         Err(_) => {
            return Err(Error::Query {
               sql: String::new(),
               message: format!("unsupported SQLite column type: {other}"),
            });
         }
      },
   };

   Ok(result)
}

fn base64_encode(data: &[u8]) -> String {
   use base64::Engine;
   base64::engine::general_purpose::STANDARD.encode(data)
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn named_placeholders_skips_strings_and_comments() {
      let sql = "SELECT * FROM t WHERE name = :name AND note = 'not :fake' -- :ignored\n AND id = @id";
      assert_eq!(named_placeholders(sql), vec!["name", "id"]);
   }

   #[test]
   fn named_placeholders_handles_block_comments() {
      let sql = "SELECT 1 /* :skip_me */ WHERE x = $val";
      assert_eq!(named_placeholders(sql), vec!["val"]);
   }

   #[test]
   fn named_placeholders_handles_doubled_quotes() {
      let sql = "SELECT 'it''s :not_a_param' WHERE a = :a";
      assert_eq!(named_placeholders(sql), vec!["a"]);
   }

   #[test]
   fn statement_cache_evicts_oldest_beyond_capacity() {
      let cache = StatementCache::new(2);
      cache.touch("a");
      cache.touch("b");
      assert_eq!(cache.len(), 2);
      cache.touch("c");
      assert_eq!(cache.len(), 2);
      // "a" should have been evicted; re-touching it recreates the entry
      // without growing past capacity.
      cache.touch("a");
      assert_eq!(cache.len(), 2);
   }

   #[test]
   fn base64_encode_roundtrips() {
      assert_eq!(base64_encode(b"hello"), "aGVsbG8=");
      assert_eq!(base64_encode(&[]), "");
   }
}

//! Trigger-based Change Data Capture: installs per-table triggers that
//! append to a change log, and exposes a poll-and-advance cursor over it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value as JsonValue;
use sqlx::{Row as SqlxRow, SqliteConnection};
use tracing::debug;

use crate::change::{ChangeEvent, ChangeOperation, Row};
use crate::config::TrackerConfig;
use crate::error::{Error, Result};
use crate::identifier::{quote, validate};
use crate::schema::{TableDescriptor, introspect};

/// Julian-day-to-Unix-epoch offset, used to compute fractional seconds
/// since epoch directly in SQL (`changed_at`).
const JULIAN_EPOCH_SQL: &str = "(julianday('now') - 2440587.5) * 86400.0";

/// Installs/removes CDC triggers and maintains a poll cursor over the
/// change log. One tracker owns exactly one cursor; a second tracker
/// pointed at the same log maintains an independent cursor over the same
/// rows.
pub struct ChangeTracker {
   config: TrackerConfig,
   watched: Mutex<HashMap<String, TableDescriptor>>,
   cursor: AtomicU64,
}

impl ChangeTracker {
   pub fn new(config: TrackerConfig) -> Self {
      Self {
         config,
         watched: Mutex::new(HashMap::new()),
         cursor: AtomicU64::new(0),
      }
   }

   pub fn config(&self) -> &TrackerConfig {
      &self.config
   }

   pub fn current_cursor(&self) -> u64 {
      self.cursor.load(Ordering::SeqCst)
   }

   pub fn watched_tables(&self) -> Vec<String> {
      self.watched.lock().expect("watched lock poisoned").keys().cloned().collect()
   }

   pub fn is_watching(&self, table: &str) -> bool {
      self.watched.lock().expect("watched lock poisoned").contains_key(table)
   }

   /// Create the change log table and its `changed_at` index if missing.
   pub async fn ensure_log_table(&self, conn: &mut SqliteConnection) -> Result<()> {
      let log_table = quote(&self.config.log_table);
      let ddl = format!(
         "CREATE TABLE IF NOT EXISTS {log_table} (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            table_name TEXT NOT NULL,
            operation TEXT NOT NULL,
            row_id TEXT NOT NULL,
            changed_at REAL NOT NULL,
            old_data TEXT,
            new_data TEXT
         )"
      );
      sqlx::query(&ddl).execute(&mut *conn).await?;

      let index_name = quote(&format!("{}_changed_at", self.config.log_table));
      let index_ddl =
         format!("CREATE INDEX IF NOT EXISTS {index_name} ON {log_table} (changed_at)");
      sqlx::query(&index_ddl).execute(&mut *conn).await?;

      Ok(())
   }

   /// Install (or reinstall, on schema drift) CDC triggers for `table`.
   ///
   /// Idempotent when the table's column list is unchanged since the last
   /// watch. All identifiers are validated before any DDL runs.
   pub async fn watch(&self, conn: &mut SqliteConnection, table: &str) -> Result<()> {
      validate(table)?;
      self.ensure_log_table(conn).await?;

      let descriptor = introspect(conn, table)
         .await?
         .ok_or_else(|| Error::UnknownTable(table.to_string()))?;
      for column in &descriptor.columns {
         validate(column)?;
      }

      let previous = {
         let watched = self.watched.lock().expect("watched lock poisoned");
         watched.get(table).cloned()
      };

      if previous.as_ref() == Some(&descriptor) {
         debug!(table, "watch is a no-op, schema unchanged");
         return Ok(());
      }

      if previous.is_some() {
         self.drop_triggers(conn, table).await?;
      }
      self.install_triggers(conn, table, &descriptor).await?;

      self
         .watched
         .lock()
         .expect("watched lock poisoned")
         .insert(table.to_string(), descriptor);

      Ok(())
   }

   /// Drop CDC triggers for `table` and stop tracking it. No-op if not watched.
   pub async fn unwatch(&self, conn: &mut SqliteConnection, table: &str) -> Result<()> {
      validate(table)?;
      let was_watched = self
         .watched
         .lock()
         .expect("watched lock poisoned")
         .remove(table)
         .is_some();
      if was_watched {
         self.drop_triggers(conn, table).await?;
      }
      Ok(())
   }

   async fn install_triggers(
      &self,
      conn: &mut SqliteConnection,
      table: &str,
      descriptor: &TableDescriptor,
   ) -> Result<()> {
      let log_table = quote(&self.config.log_table);
      let quoted_table = quote(table);
      let new_json = json_object_expr(descriptor, "NEW");
      let old_json = json_object_expr(descriptor, "OLD");
      let new_key = descriptor.row_key_expr("NEW");
      let old_key = descriptor.row_key_expr("OLD");

      let insert_trigger = format!(
         "CREATE TRIGGER {} AFTER INSERT ON {quoted_table} BEGIN
            INSERT INTO {log_table} (table_name, operation, row_id, changed_at, old_data, new_data)
            VALUES ('{table}', 'INSERT', {new_key}, {JULIAN_EPOCH_SQL}, NULL, {new_json});
         END",
         quote(&trigger_name(table, "insert")),
      );

      let update_trigger = format!(
         "CREATE TRIGGER {} AFTER UPDATE ON {quoted_table} BEGIN
            INSERT INTO {log_table} (table_name, operation, row_id, changed_at, old_data, new_data)
            VALUES ('{table}', 'UPDATE', {new_key}, {JULIAN_EPOCH_SQL}, {old_json}, {new_json});
         END",
         quote(&trigger_name(table, "update")),
      );

      let delete_trigger = format!(
         "CREATE TRIGGER {} AFTER DELETE ON {quoted_table} BEGIN
            INSERT INTO {log_table} (table_name, operation, row_id, changed_at, old_data, new_data)
            VALUES ('{table}', 'DELETE', {old_key}, {JULIAN_EPOCH_SQL}, {old_json}, NULL);
         END",
         quote(&trigger_name(table, "delete")),
      );

      sqlx::query("BEGIN").execute(&mut *conn).await?;
      for ddl in [&insert_trigger, &update_trigger, &delete_trigger] {
         if let Err(e) = sqlx::query(ddl).execute(&mut *conn).await {
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            return Err(Error::Sqlx(e));
         }
      }
      sqlx::query("COMMIT").execute(&mut *conn).await?;

      debug!(table, "installed CDC triggers");
      Ok(())
   }

   async fn drop_triggers(&self, conn: &mut SqliteConnection, table: &str) -> Result<()> {
      for kind in ["insert", "update", "delete"] {
         let ddl = format!("DROP TRIGGER IF EXISTS {}", quote(&trigger_name(table, kind)));
         sqlx::query(&ddl).execute(&mut *conn).await?;
      }
      debug!(table, "dropped CDC triggers");
      Ok(())
   }

   /// Select log rows past the cursor, ordered ascending, advance the
   /// cursor to the max `seq` seen, and return the parsed events.
   pub async fn poll(&self, conn: &mut SqliteConnection) -> Result<Vec<ChangeEvent>> {
      let cursor = self.current_cursor();
      let log_table = quote(&self.config.log_table);
      let sql = format!(
         "SELECT seq, table_name, operation, changed_at, old_data, new_data
            FROM {log_table}
            WHERE seq > ?
            ORDER BY seq ASC
            LIMIT ?"
      );

      let rows = sqlx::query(&sql)
         .bind(cursor as i64)
         .bind(self.config.poll_batch_size as i64)
         .fetch_all(&mut *conn)
         .await?;

      let mut events = Vec::with_capacity(rows.len());
      let mut max_seq = cursor;

      for row in &rows {
         let seq: i64 = row.try_get("seq")?;
         let table: String = row.try_get("table_name")?;
         let operation: String = row.try_get("operation")?;
         let changed_at: f64 = row.try_get("changed_at")?;
         let old_data: Option<String> = row.try_get("old_data")?;
         let new_data: Option<String> = row.try_get("new_data")?;

         let operation = ChangeOperation::parse(&operation)
            .ok_or_else(|| Error::Cdc(format!("unknown operation '{operation}' in change log")))?;

         let (row_value, old_row) = match operation {
            ChangeOperation::Insert => (parse_row(new_data.as_deref())?, None),
            ChangeOperation::Update => (
               parse_row(new_data.as_deref())?,
               Some(parse_row(old_data.as_deref())?),
            ),
            ChangeOperation::Delete => (Row::new(), Some(parse_row(old_data.as_deref())?)),
         };

         max_seq = max_seq.max(seq as u64);
         events.push(ChangeEvent {
            operation,
            table,
            row: row_value,
            old_row,
            seq: seq as u64,
            timestamp: changed_at,
         });
      }

      self.cursor.store(max_seq, Ordering::SeqCst);
      Ok(events)
   }

   /// Delete log rows that are both older than the retention window and
   /// already polled past (`seq <= cursor`). Never touches un-polled rows.
   pub async fn cleanup(&self, conn: &mut SqliteConnection) -> Result<u64> {
      let cursor = self.current_cursor();
      let log_table = quote(&self.config.log_table);
      let sql = format!(
         "DELETE FROM {log_table} WHERE changed_at < {JULIAN_EPOCH_SQL} - ? AND seq <= ?"
      );
      let result = sqlx::query(&sql)
         .bind(self.config.retention.as_secs_f64())
         .bind(cursor as i64)
         .execute(&mut *conn)
         .await?;
      Ok(result.rows_affected())
   }
}

fn trigger_name(table: &str, kind: &str) -> String {
   format!("_sirannon_cdc_{table}_{kind}")
}

fn json_object_expr(descriptor: &TableDescriptor, alias: &str) -> String {
   let pairs: Vec<String> = descriptor
      .columns
      .iter()
      .map(|c| format!("'{c}', {alias}.\"{c}\""))
      .collect();
   format!("json_object({})", pairs.join(", "))
}

fn parse_row(data: Option<&str>) -> Result<Row> {
   let Some(data) = data else {
      return Ok(Row::new());
   };
   let value: JsonValue =
      serde_json::from_str(data).map_err(|e| Error::Cdc(format!("malformed change log JSON: {e}")))?;
   match value {
      JsonValue::Object(map) => Ok(map.into_iter().collect()),
      _ => Err(Error::Cdc("change log JSON was not an object".to_string())),
   }
}

//! Table schema introspection used to build CDC trigger bodies.

use sqlx::{Row, SqliteConnection};

use crate::error::{Error, Result};

/// A watched table's column list and primary key, at the moment of watch.
///
/// Re-watching a table re-derives this and compares it against the cached
/// descriptor; a mismatch means the schema drifted and triggers must be
/// dropped and reinstalled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
   pub columns: Vec<String>,
   pub primary_key: Vec<String>,
}

impl TableDescriptor {
   /// The SQL expression identifying a row: `rowid` with no PK, the sole PK
   /// column with one, or `-`-joined PK columns with a composite key.
   pub fn row_key_expr(&self, prefix: &str) -> String {
      if self.primary_key.is_empty() {
         format!("{prefix}.\"rowid\"")
      } else if self.primary_key.len() == 1 {
         format!("{prefix}.\"{}\"", self.primary_key[0])
      } else {
         self
            .primary_key
            .iter()
            .map(|c| format!("{prefix}.\"{c}\""))
            .collect::<Vec<_>>()
            .join(" || '-' || ")
      }
   }
}

/// Look up `table`'s columns and primary key via `PRAGMA table_info`.
///
/// Returns `Ok(None)` if the table does not exist. `table` must already be a
/// validated identifier; this function does not re-check it since it quotes
/// the table name itself and `PRAGMA table_info` does not accept bind
/// parameters.
pub async fn introspect(
   conn: &mut SqliteConnection,
   table: &str,
) -> Result<Option<TableDescriptor>> {
   let sql = format!("PRAGMA table_info(\"{table}\")");
   let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;

   if rows.is_empty() {
      return Ok(None);
   }

   let mut columns = Vec::with_capacity(rows.len());
   let mut pk_positions: Vec<(i64, String)> = Vec::new();

   for row in &rows {
      let name: String = row.try_get("name")?;
      let pk: i64 = row.try_get("pk")?;
      if pk > 0 {
         pk_positions.push((pk, name.clone()));
      }
      columns.push(name);
   }

   pk_positions.sort_by_key(|(pk, _)| *pk);
   let primary_key = pk_positions.into_iter().map(|(_, name)| name).collect();

   Ok(Some(TableDescriptor {
      columns,
      primary_key,
   }))
}

//! Ordered, transactional, idempotent migration runner.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use sqlx::Row as SqlxRow;
use tracing::info;

use crate::error::{Error, Result};

static MIGRATION_FILE_RE: LazyLock<Regex> =
   LazyLock::new(|| Regex::new(r"^(\d+)_([^.]+)\.sql$").unwrap());

/// Name of the internal table tracking applied migrations.
pub const MIGRATIONS_TABLE: &str = "_sirannon_migrations";

/// One applied migration, as recorded in `_sirannon_migrations`.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationRecord {
   pub version: i64,
   pub name: String,
   pub applied_at: f64,
}

/// Outcome of a [`migrate`] call.
#[derive(Debug, Clone, Default)]
pub struct MigrateReport {
   /// Newly applied migrations this call, in ascending version order.
   pub applied: Vec<MigrationRecord>,
   /// Number of on-disk migrations that were already applied previously.
   pub skipped: usize,
}

struct Candidate {
   version: i64,
   name: String,
   sql: String,
}

/// Discover candidate migration files in `dir`: regular files named
/// `<version>_<name>.sql`, ordered ascending by integer version (so `10`
/// follows `2`, not lexicographically).
fn discover(dir: &Path) -> Result<Vec<Candidate>> {
   let mut candidates = Vec::new();
   let mut seen_versions = std::collections::HashSet::new();

   let entries = std::fs::read_dir(dir)
      .map_err(|e| Error::Migration { version: 0, message: format!("cannot read {}: {e}", dir.display()) })?;

   for entry in entries {
      let entry = entry.map_err(|e| Error::Migration { version: 0, message: e.to_string() })?;
      let path = entry.path();
      if !path.is_file() {
         continue;
      }
      let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
         continue;
      };
      let Some(captures) = MIGRATION_FILE_RE.captures(filename) else {
         continue;
      };
      let version: i64 = captures[1].parse().map_err(|_| Error::Migration {
         version: 0,
         message: format!("unparseable version in migration filename '{filename}'"),
      })?;
      let name = captures[2].to_string();

      if !seen_versions.insert(version) {
         return Err(Error::Migration {
            version,
            message: format!("duplicate migration version {version}"),
         });
      }

      let sql = std::fs::read_to_string(&path)
         .map_err(|e| Error::Migration { version, message: format!("cannot read {filename}: {e}") })?;
      if sql.trim().is_empty() {
         return Err(Error::Migration {
            version,
            message: format!("migration {filename} is empty or whitespace-only"),
         });
      }

      candidates.push(Candidate { version, name, sql });
   }

   candidates.sort_by_key(|c| c.version);
   Ok(candidates)
}

/// Apply every not-yet-applied migration in `dir` against `conn`, in a
/// single transaction. Re-invocations against the same directory apply zero
/// migrations on the second call.
pub async fn migrate(conn: &mut sqlx::SqliteConnection, dir: &Path) -> Result<MigrateReport> {
   let candidates = discover(dir)?;

   sqlx::query(&format!(
      "CREATE TABLE IF NOT EXISTS \"{MIGRATIONS_TABLE}\" (
         version INTEGER PRIMARY KEY,
         name TEXT NOT NULL,
         applied_at REAL NOT NULL
      )"
   ))
   .execute(&mut *conn)
   .await
   .map_err(|e| Error::Migration { version: 0, message: e.to_string() })?;

   sqlx::query("BEGIN").execute(&mut *conn).await.map_err(|e| Error::Migration { version: 0, message: e.to_string() })?;

   let result = run_candidates(conn, &candidates).await;

   match result {
      Ok(report) => {
         sqlx::query("COMMIT").execute(&mut *conn).await.map_err(|e| Error::Migration { version: 0, message: e.to_string() })?;
         Ok(report)
      }
      Err(err) => {
         let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
         Err(err)
      }
   }
}

async fn run_candidates(conn: &mut sqlx::SqliteConnection, candidates: &[Candidate]) -> Result<MigrateReport> {
   let applied_versions: std::collections::HashSet<i64> =
      sqlx::query(&format!("SELECT version FROM \"{MIGRATIONS_TABLE}\""))
         .fetch_all(&mut *conn)
         .await
         .map_err(|e| Error::Migration { version: 0, message: e.to_string() })?
         .iter()
         .map(|row| row.get::<i64, _>("version"))
         .collect();

   let mut report = MigrateReport::default();

   for candidate in candidates {
      if applied_versions.contains(&candidate.version) {
         report.skipped += 1;
         continue;
      }

      sqlx::raw_sql(&candidate.sql).execute(&mut *conn).await.map_err(|e| Error::Migration {
         version: candidate.version,
         message: e.to_string(),
      })?;

      let applied_at = now_epoch_seconds();
      sqlx::query(&format!(
         "INSERT INTO \"{MIGRATIONS_TABLE}\" (version, name, applied_at) VALUES (?, ?, ?)"
      ))
      .bind(candidate.version)
      .bind(&candidate.name)
      .bind(applied_at)
      .execute(&mut *conn)
      .await
      .map_err(|e| Error::Migration { version: candidate.version, message: e.to_string() })?;

      info!(version = candidate.version, name = %candidate.name, "applied migration");
      report.applied.push(MigrationRecord {
         version: candidate.version,
         name: candidate.name.clone(),
         applied_at,
      });
   }

   Ok(report)
}

fn now_epoch_seconds() -> f64 {
   std::time::SystemTime::now()
      .duration_since(std::time::UNIX_EPOCH)
      .unwrap_or_default()
      .as_secs_f64()
}

#[cfg(test)]
mod tests {
   use super::*;
   use sqlx::sqlite::SqliteConnectOptions;
   use sqlx::{ConnectOptions, Connection};

   async fn memory_conn() -> sqlx::SqliteConnection {
      SqliteConnectOptions::new().filename(":memory:").connect().await.unwrap()
   }

   #[tokio::test]
   async fn applies_in_ascending_numeric_not_lexicographic_order() {
      let dir = tempfile::tempdir().unwrap();
      std::fs::write(dir.path().join("1_a.sql"), "CREATE TABLE a (id INTEGER);").unwrap();
      std::fs::write(dir.path().join("2_b.sql"), "CREATE TABLE b (id INTEGER);").unwrap();
      std::fs::write(dir.path().join("10_c.sql"), "CREATE TABLE c (id INTEGER);").unwrap();

      let mut conn = memory_conn().await;
      let report = migrate(&mut conn, dir.path()).await.unwrap();
      assert_eq!(report.applied.iter().map(|m| m.version).collect::<Vec<_>>(), vec![1, 2, 10]);
   }

   #[tokio::test]
   async fn second_run_applies_zero() {
      let dir = tempfile::tempdir().unwrap();
      std::fs::write(dir.path().join("1_a.sql"), "CREATE TABLE a (id INTEGER);").unwrap();

      let mut conn = memory_conn().await;
      migrate(&mut conn, dir.path()).await.unwrap();
      let second = migrate(&mut conn, dir.path()).await.unwrap();
      assert!(second.applied.is_empty());
      assert_eq!(second.skipped, 1);
   }

   #[tokio::test]
   async fn duplicate_version_is_rejected() {
      let dir = tempfile::tempdir().unwrap();
      std::fs::write(dir.path().join("1_a.sql"), "CREATE TABLE a (id INTEGER);").unwrap();
      std::fs::write(dir.path().join("1_b.sql"), "CREATE TABLE b (id INTEGER);").unwrap();

      let mut conn = memory_conn().await;
      let err = migrate(&mut conn, dir.path()).await.unwrap_err();
      assert!(matches!(err, Error::Migration { version: 1, .. }));
   }

   #[tokio::test]
   async fn failing_migration_leaves_schema_and_tracking_unchanged() {
      let dir = tempfile::tempdir().unwrap();
      std::fs::write(dir.path().join("1_good.sql"), "CREATE TABLE ok (id INTEGER);").unwrap();
      std::fs::write(dir.path().join("2_bad.sql"), "NOT VALID SQL;").unwrap();

      let mut conn = memory_conn().await;
      let err = migrate(&mut conn, dir.path()).await.unwrap_err();
      assert!(matches!(err, Error::Migration { version: 2, .. }));

      // The whole call rolled back: migration 1 must not have stuck either.
      let tables: Vec<String> = sqlx::query("SELECT name FROM sqlite_master WHERE type='table'")
         .fetch_all(&mut conn)
         .await
         .unwrap()
         .iter()
         .map(|r| r.get::<String, _>("name"))
         .collect();
      assert!(!tables.contains(&"ok".to_string()));
   }

   #[tokio::test]
   async fn rejects_empty_migration_file() {
      let dir = tempfile::tempdir().unwrap();
      std::fs::write(dir.path().join("1_empty.sql"), "   \n").unwrap();
      let mut conn = memory_conn().await;
      let err = migrate(&mut conn, dir.path()).await.unwrap_err();
      assert!(matches!(err, Error::Migration { version: 1, .. }));
   }
}

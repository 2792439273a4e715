//! Online snapshot backup and cron-driven rotation.
//!
//! The online copy is done with `VACUUM INTO`, which
//! SQLite implements via the same backup machinery as the C
//! `sqlite3_backup_*` API: it walks the source database under a read
//! transaction and writes a consistent snapshot to a brand-new file without
//! blocking concurrent readers or the writer for longer than one statement.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sirannon_pool::ConnectionPool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Generate a rotation-friendly filename: `backup-<ISO8601>.db`, with the
/// timestamp's colons and dots replaced by hyphens so it is a valid
/// filename on every platform.
pub fn generate_filename() -> String {
   let now = time::OffsetDateTime::now_utc();
   let iso = now
      .format(&time::format_description::well_known::Iso8601::DEFAULT)
      .unwrap_or_else(|_| now.unix_timestamp().to_string());
   let sanitized = iso.replace(':', "-").replace('.', "-");
   format!("backup-{sanitized}.db")
}

/// Online-copy the database behind `pool`'s writer connection to `dest`.
///
/// Refuses if `dest` already exists or resolves to the same path as the
/// source. Creates `dest`'s parent directories if missing. Deletes a
/// partially written `dest` if the copy fails partway through.
pub async fn backup(pool: &ConnectionPool, dest: &Path) -> Result<()> {
   if dest == pool.path() {
      return Err(Error::Backup("backup destination must not equal the source path".to_string()));
   }
   if dest.exists() {
      return Err(Error::Backup(format!("backup destination already exists: {}", dest.display())));
   }
   if let Some(parent) = dest.parent() {
      if !parent.as_os_str().is_empty() {
         std::fs::create_dir_all(parent).map_err(|e| Error::Backup(format!("cannot create {}: {e}", parent.display())))?;
      }
   }

   let mut guard = pool.acquire_writer().await.map_err(Error::Query)?;
   let dest_literal = dest.to_string_lossy().replace('\'', "''");
   let sql = format!("VACUUM INTO '{dest_literal}'");

   if let Err(err) = sqlx::query(&sql).execute(&mut *guard).await {
      let _ = std::fs::remove_file(dest);
      return Err(Error::Backup(err.to_string()));
   }

   debug!(dest = %dest.display(), "backup complete");
   Ok(())
}

/// Delete backup files in `dir` beyond the `max_files` most recently
/// modified, matching `^backup-.+\.db$`. A no-op when `max_files <= 0`,
/// `dir` doesn't exist, or the matching count is already `<= max_files`.
/// Never touches files that don't match the backup filename pattern.
pub fn rotate(dir: &Path, max_files: i64) -> Result<()> {
   if max_files <= 0 || !dir.exists() {
      return Ok(());
   }

   let mut candidates: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
   let entries = std::fs::read_dir(dir).map_err(|e| Error::Backup(e.to_string()))?;
   for entry in entries {
      let entry = entry.map_err(|e| Error::Backup(e.to_string()))?;
      let path = entry.path();
      let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
         continue;
      };
      if !is_backup_filename(name) {
         continue;
      }
      let modified = entry.metadata().and_then(|m| m.modified()).unwrap_or(std::time::UNIX_EPOCH);
      candidates.push((path, modified));
   }

   if candidates.len() as i64 <= max_files {
      return Ok(());
   }

   candidates.sort_by(|a, b| b.1.cmp(&a.1));
   for (path, _) in candidates.into_iter().skip(max_files as usize) {
      if let Err(e) = std::fs::remove_file(&path) {
         warn!(path = %path.display(), error = %e, "failed to remove rotated backup");
      }
   }
   Ok(())
}

fn is_backup_filename(name: &str) -> bool {
   name.starts_with("backup-") && name.ends_with(".db") && name.len() > "backup-.db".len()
}

/// Options for [`BackupScheduler::schedule`].
#[derive(Clone)]
pub struct BackupScheduleOptions {
   pub cron: String,
   pub dest_dir: PathBuf,
   pub max_files: i64,
   pub on_error: Option<Arc<dyn Fn(&Error) + Send + Sync>>,
}

impl BackupScheduleOptions {
   pub fn new(cron: impl Into<String>, dest_dir: impl Into<PathBuf>) -> Self {
      Self {
         cron: cron.into(),
         dest_dir: dest_dir.into(),
         max_files: 5,
         on_error: None,
      }
   }

   pub fn with_max_files(mut self, max_files: i64) -> Self {
      self.max_files = max_files;
      self
   }

   pub fn with_on_error(mut self, on_error: Arc<dyn Fn(&Error) + Send + Sync>) -> Self {
      self.on_error = Some(on_error);
      self
   }
}

/// A cancel handle for a scheduled recurring backup. Dropping it does not
/// stop the schedule; call [`cancel`](ScheduledBackup::cancel) explicitly.
pub struct ScheduledBackup {
   scheduler: Arc<Mutex<Option<JobScheduler>>>,
}

impl ScheduledBackup {
   /// Stop future ticks. Idempotent.
   pub async fn cancel(&self) {
      let scheduler = self.scheduler.lock().expect("scheduler lock poisoned").take();
      if let Some(scheduler) = scheduler {
         let _ = scheduler.shutdown().await;
      }
   }
}

/// Cron-driven recurrence of [`backup`] + [`rotate`] against `pool`.
pub struct BackupScheduler;

impl BackupScheduler {
   /// Start a recurring job on `options.cron`. Raises synchronously with
   /// `Error::Backup` for an invalid cron string; otherwise returns a
   /// cancel handle immediately, with the job running in the background.
   pub async fn schedule(pool: Arc<ConnectionPool>, options: BackupScheduleOptions) -> Result<ScheduledBackup> {
      let scheduler = JobScheduler::new().await.map_err(|e| Error::Backup(e.to_string()))?;

      let dest_dir = options.dest_dir.clone();
      let max_files = options.max_files;
      let on_error = options.on_error.clone();

      let job = Job::new_async(options.cron.as_str(), move |_uuid, _l| {
         let pool = Arc::clone(&pool);
         let dest_dir = dest_dir.clone();
         let on_error = on_error.clone();
         Box::pin(async move {
            let dest = dest_dir.join(generate_filename());
            if let Err(err) = backup(&pool, &dest).await {
               warn!(error = %err, "scheduled backup failed");
               if let Some(on_error) = &on_error {
                  on_error(&err);
               }
               return;
            }
            if let Err(err) = rotate(&dest_dir, max_files) {
               warn!(error = %err, "scheduled backup rotation failed");
               if let Some(on_error) = &on_error {
                  on_error(&err);
               }
            }
         })
      })
      .map_err(|e| Error::Backup(format!("invalid cron expression: {e}")))?;

      scheduler.add(job).await.map_err(|e| Error::Backup(e.to_string()))?;
      scheduler.start().await.map_err(|e| Error::Backup(e.to_string()))?;

      Ok(ScheduledBackup {
         scheduler: Arc::new(Mutex::new(Some(scheduler))),
      })
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use sirannon_pool::PoolConfig;

   #[test]
   fn generate_filename_has_no_colons_or_dots_before_extension() {
      let name = generate_filename();
      assert!(name.starts_with("backup-"));
      assert!(name.ends_with(".db"));
      let body = &name["backup-".len()..name.len() - ".db".len()];
      assert!(!body.contains(':'));
      assert!(!body.contains('.'));
   }

   #[tokio::test]
   async fn backup_refuses_existing_destination() {
      let dir = tempfile::tempdir().unwrap();
      let src = dir.path().join("src.db");
      let pool = ConnectionPool::open(PoolConfig::new(&src)).await.unwrap();

      let dest = dir.path().join("dest.db");
      std::fs::write(&dest, b"existing").unwrap();

      let err = backup(&pool, &dest).await.unwrap_err();
      assert!(matches!(err, Error::Backup(_)));
   }

   #[tokio::test]
   async fn backup_refuses_same_path_as_source() {
      let dir = tempfile::tempdir().unwrap();
      let src = dir.path().join("src.db");
      let pool = ConnectionPool::open(PoolConfig::new(&src)).await.unwrap();
      let err = backup(&pool, &src).await.unwrap_err();
      assert!(matches!(err, Error::Backup(_)));
   }

   #[tokio::test]
   async fn backup_produces_a_readable_copy() {
      let dir = tempfile::tempdir().unwrap();
      let src_path = dir.path().join("src.db");
      let pool = ConnectionPool::open(PoolConfig::new(&src_path)).await.unwrap();
      {
         let mut guard = pool.acquire_writer().await.unwrap();
         sqlx::query("CREATE TABLE t (v TEXT)").execute(&mut *guard).await.unwrap();
         sqlx::query("INSERT INTO t (v) VALUES ('hello')").execute(&mut *guard).await.unwrap();
      }

      let dest = dir.path().join("dest.db");
      backup(&pool, &dest).await.unwrap();
      assert!(dest.exists());

      let dest_pool = ConnectionPool::open(PoolConfig::new(&dest).read_only(true)).await.unwrap();
      let reader = dest_pool.acquire_reader().unwrap();
      let row: (String,) = sqlx::query_as("SELECT v FROM t").fetch_one(reader).await.unwrap();
      assert_eq!(row.0, "hello");
   }

   #[test]
   fn rotate_keeps_only_max_files_most_recent() {
      let dir = tempfile::tempdir().unwrap();
      for i in 0..5 {
         let path = dir.path().join(format!("backup-{i}.db"));
         std::fs::write(&path, b"x").unwrap();
         std::thread::sleep(Duration::from_millis(5));
      }
      std::fs::write(dir.path().join("not-a-backup.txt"), b"keep me").unwrap();

      rotate(dir.path(), 2).unwrap();

      let remaining: Vec<String> = std::fs::read_dir(dir.path())
         .unwrap()
         .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
         .collect();
      assert_eq!(remaining.iter().filter(|n| n.starts_with("backup-")).count(), 2);
      assert!(remaining.contains(&"not-a-backup.txt".to_string()));
   }

   #[test]
   fn rotate_is_noop_below_threshold_or_missing_dir() {
      let dir = tempfile::tempdir().unwrap();
      std::fs::write(dir.path().join("backup-a.db"), b"x").unwrap();
      rotate(dir.path(), 5).unwrap();
      assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

      rotate(&dir.path().join("missing"), 1).unwrap();
   }
}

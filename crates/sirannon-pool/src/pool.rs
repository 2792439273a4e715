//! Owns one writer connection and a fixed-size ring of reader connections
//! for a single SQLite database file.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{ConnectOptions, Pool, Sqlite};
use tracing::debug;

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::write_guard::WriteGuard;

/// Pooled SQLite connections for one database file.
///
/// Readers are `read_pool_size` independent single-connection pools rather
/// than one shared multi-connection pool: `acquire_reader` hands out the
/// next one round-robin via an atomic cursor, so reader selection is
/// deterministic and each reader's connection identity is stable across the
/// pool's lifetime. The writer pool is capped at `max_connections(1)`, so
/// `acquire_writer` serializes all mutation.
#[derive(Debug)]
pub struct ConnectionPool {
   readers: Vec<Pool<Sqlite>>,
   reader_cursor: AtomicUsize,
   writer: Option<Pool<Sqlite>>,
   closed: AtomicBool,
   path: PathBuf,
   read_only: bool,
}

impl ConnectionPool {
   /// Open (creating if missing) the database at `config.path` and build the
   /// reader ring plus, unless `read_only`, the writer pool.
   pub async fn open(config: PoolConfig) -> Result<Self> {
      if config.path.as_os_str().is_empty() {
         return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "database path cannot be empty",
         )));
      }

      let busy_timeout = std::time::Duration::from_secs(config.busy_timeout_secs);

      if !config.path.exists() && !is_memory_database(&config.path) {
         let create_options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .busy_timeout(busy_timeout)
            .read_only(false);
         drop(create_options.connect().await?);
      }

      let mut readers = Vec::with_capacity(config.read_pool_size as usize);
      for _ in 0..config.read_pool_size {
         let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .read_only(true)
            .foreign_keys(true)
            .busy_timeout(busy_timeout);
         let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(0)
            .connect_with(options)
            .await?;
         readers.push(pool);
      }

      let writer = if config.read_only {
         None
      } else {
         let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .read_only(false)
            .foreign_keys(true)
            .busy_timeout(busy_timeout);
         let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(0)
            .connect_with(options)
            .await?;

         if config.wal_mode {
            let mut conn = pool.acquire().await?;
            sqlx::query("PRAGMA journal_mode = WAL")
               .execute(&mut *conn)
               .await?;
            sqlx::query("PRAGMA synchronous = NORMAL")
               .execute(&mut *conn)
               .await?;
         }

         Some(pool)
      };

      Ok(Self {
         readers,
         reader_cursor: AtomicUsize::new(0),
         writer,
         closed: AtomicBool::new(false),
         path: config.path,
         read_only: config.read_only,
      })
   }

   pub fn path(&self) -> &Path {
      &self.path
   }

   pub fn is_read_only(&self) -> bool {
      self.read_only
   }

   pub fn is_closed(&self) -> bool {
      self.closed.load(Ordering::SeqCst)
   }

   /// Whether this pool's path resolves to an in-memory SQLite database
   /// (`:memory:`, `file::memory:`, or a `mode=memory` URI), as opposed to
   /// a file on disk.
   pub fn is_memory(&self) -> bool {
      is_memory_database(&self.path)
   }

   pub fn read_pool_size(&self) -> usize {
      self.readers.len()
   }

   /// Return the next reader in round-robin order.
   ///
   /// Readers are not exclusively checked out: the returned pool reference
   /// can be used directly for a query, relying on WAL snapshot isolation
   /// for concurrency with the writer.
   pub fn acquire_reader(&self) -> Result<&Pool<Sqlite>> {
      if self.is_closed() {
         return Err(Error::PoolClosed);
      }
      let index = self.reader_cursor.fetch_add(1, Ordering::Relaxed) % self.readers.len();
      Ok(&self.readers[index])
   }

   /// Acquire the single writer connection, serializing with any other
   /// in-flight write.
   pub async fn acquire_writer(&self) -> Result<WriteGuard> {
      if self.is_closed() {
         return Err(Error::PoolClosed);
      }
      let writer = self.writer.as_ref().ok_or(Error::ReadOnly)?;
      let conn: PoolConnection<Sqlite> = writer.acquire().await?;
      Ok(WriteGuard::new(conn))
   }

   /// Idempotently close every connection in the pool.
   pub async fn close(&self) -> Result<()> {
      if self.closed.swap(true, Ordering::SeqCst) {
         return Ok(());
      }
      debug!(path = %self.path.display(), "closing connection pool");
      for reader in &self.readers {
         reader.close().await;
      }
      if let Some(writer) = &self.writer {
         if let Ok(mut conn) = writer.acquire().await {
            let _ = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
               .execute(&mut *conn)
               .await;
         }
         writer.close().await;
      }
      Ok(())
   }
}

fn is_memory_database(path: &Path) -> bool {
   let s = path.to_string_lossy();
   s == ":memory:" || s.starts_with("file::memory:") || s.contains("mode=memory")
}

#[cfg(test)]
mod tests {
   use super::*;

   #[tokio::test]
   async fn opens_and_reads_round_robin() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("test.db");
      let config = PoolConfig::new(&path).with_read_pool_size(4);
      let pool = ConnectionPool::open(config).await.unwrap();

      let mut seen = std::collections::HashSet::new();
      for _ in 0..8 {
         let reader = pool.acquire_reader().unwrap();
         seen.insert(reader as *const Pool<Sqlite>);
      }
      assert_eq!(seen.len(), 4, "round robin should visit all 4 readers");
   }

   #[tokio::test]
   async fn read_only_pool_rejects_writer() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("ro.db");
      // Create the file with a writable pool first so the read-only open succeeds.
      ConnectionPool::open(PoolConfig::new(&path)).await.unwrap();

      let config = PoolConfig::new(&path).read_only(true);
      let pool = ConnectionPool::open(config).await.unwrap();
      let err = pool.acquire_writer().await.unwrap_err();
      assert!(matches!(err, Error::ReadOnly));
   }

   #[tokio::test]
   async fn concurrent_reads_across_four_clients_never_lock_error() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("concurrent.db");
      let config = PoolConfig::new(&path).with_read_pool_size(4);
      let pool = std::sync::Arc::new(ConnectionPool::open(config).await.unwrap());

      // Four virtual clients each issuing 25 concurrent `SELECT 1`s, mirroring
      // the 100-concurrent-reader scenario against a WAL-tuned pool.
      let mut tasks = Vec::with_capacity(100);
      for _ in 0..4 {
         for _ in 0..25 {
            let pool = std::sync::Arc::clone(&pool);
            tasks.push(tokio::spawn(async move {
               let reader = pool.acquire_reader().unwrap();
               let row: (i64,) = sqlx::query_as("SELECT 1").fetch_one(reader).await.unwrap();
               row.0
            }));
         }
      }

      for task in tasks {
         assert_eq!(task.await.unwrap(), 1);
      }
   }

   #[tokio::test]
   async fn close_is_idempotent_and_blocks_further_use() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("close.db");
      let pool = ConnectionPool::open(PoolConfig::new(&path)).await.unwrap();

      pool.close().await.unwrap();
      pool.close().await.unwrap();

      assert!(matches!(pool.acquire_reader(), Err(Error::PoolClosed)));
      assert!(matches!(
         pool.acquire_writer().await,
         Err(Error::PoolClosed)
      ));
   }
}

//! Configuration for a [`ConnectionPool`](crate::ConnectionPool).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Construction parameters for a [`ConnectionPool`](crate::ConnectionPool).
///
/// # Examples
///
/// ```
/// use sirannon_pool::PoolConfig;
///
/// let config = PoolConfig::new("tenant.db");
/// assert_eq!(config.read_pool_size, 4);
///
/// let config = PoolConfig::new("tenant.db").with_read_pool_size(1);
/// assert_eq!(config.read_pool_size, 1);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
   /// Path to the SQLite database file.
   pub path: PathBuf,

   /// When true, no writer connection is opened and `acquire_writer` fails.
   pub read_only: bool,

   /// Number of reader connections in the round-robin ring. Clamped to >= 1.
   ///
   /// Default: 4
   pub read_pool_size: u32,

   /// Whether to put the writer connection in WAL journal mode.
   ///
   /// Default: true
   pub wal_mode: bool,

   /// Busy timeout applied to every connection, reader and writer alike.
   ///
   /// Default: 5s
   pub busy_timeout_secs: u64,
}

impl PoolConfig {
   /// New config for `path` with all other fields defaulted.
   pub fn new(path: impl Into<PathBuf>) -> Self {
      Self {
         path: path.into(),
         read_only: false,
         read_pool_size: 4,
         wal_mode: true,
         busy_timeout_secs: 5,
      }
   }

   /// Mark this pool read-only: no writer connection will be opened.
   pub fn read_only(mut self, read_only: bool) -> Self {
      self.read_only = read_only;
      self
   }

   /// Set the reader ring size. Values below 1 are clamped up to 1.
   pub fn with_read_pool_size(mut self, size: u32) -> Self {
      self.read_pool_size = size.max(1);
      self
   }

   /// Enable or disable WAL mode on the writer connection.
   pub fn with_wal_mode(mut self, wal_mode: bool) -> Self {
      self.wal_mode = wal_mode;
      self
   }
}

//! RAII guard for exclusive write access to a database.

use sqlx::Sqlite;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::SqliteConnection;
use std::ops::{Deref, DerefMut};

/// Exclusive access to a pool's single writer connection.
///
/// The writer pool has `max_connections=1`, so only one `WriteGuard` can
/// exist at a time; further `acquire_writer()` calls wait for this guard to
/// drop. Derefs to `SqliteConnection` for use with `sqlx::query`.
#[derive(Debug)]
pub struct WriteGuard {
   conn: PoolConnection<Sqlite>,
}

impl WriteGuard {
   /// Create a new WriteGuard by taking ownership of a pool connection
   pub(crate) fn new(conn: PoolConnection<Sqlite>) -> Self {
      Self { conn }
   }
}

impl Deref for WriteGuard {
   type Target = SqliteConnection;

   fn deref(&self) -> &Self::Target {
      &*self.conn
   }
}

impl DerefMut for WriteGuard {
   fn deref_mut(&mut self) -> &mut Self::Target {
      &mut *self.conn
   }
}

// Drop is automatically implemented - PoolConnection returns itself to the pool

// WriteGuard is automatically Send because PoolConnection<Sqlite> is Send

//! Error types for sirannon-pool.
//!
//! These map directly onto the CONNECTION_POOL_ERROR and QUERY_ERROR codes
//! from the wire protocol; the network surface crate is responsible for that
//! translation, this crate only distinguishes the cases.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
   /// IO error when accessing database files.
   #[error("IO error: {0}")]
   Io(#[from] std::io::Error),

   /// Error from sqlx, not otherwise classified.
   #[error("sqlx error: {0}")]
   Sqlx(#[from] sqlx::Error),

   /// The pool has been closed; acquiring any connection fails this way.
   #[error("connection pool has been closed")]
   PoolClosed,

   /// `acquire_writer` was called on a read-only pool.
   #[error("pool is read-only, no writer connection is available")]
   ReadOnly,

   /// A query failed to prepare or execute; carries the offending SQL.
   #[error("query failed: {message} (sql: {sql})")]
   Query { sql: String, message: String },
}

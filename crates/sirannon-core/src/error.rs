//! Error types for the Database facade, Registry, and LifecycleManager.
//!
//! Every variant here maps 1:1 onto a machine-readable error code; the
//! network surface crate translates these into HTTP statuses and WS error
//! frames via an explicit match, not by deriving from this enum directly.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
   #[error("database not found: {0}")]
   DatabaseNotFound(String),

   #[error("database already exists: {0}")]
   DatabaseAlreadyExists(String),

   #[error("database has been closed")]
   DatabaseClosed,

   #[error("failed to open database: {0}")]
   DatabaseOpenFailed(String),

   #[error("operation not permitted on a read-only database")]
   ReadOnly,

   #[error(transparent)]
   Query(#[from] sirannon_pool::Error),

   #[error("transaction failed: {0}")]
   Transaction(String),

   #[error("migration {version} failed: {message}")]
   Migration { version: i64, message: String },

   #[error("hook denied the operation: {0}")]
   HookDenied(String),

   #[error(transparent)]
   Cdc(#[from] sirannon_cdc::Error),

   #[error("change data capture is not supported on this database")]
   CdcUnsupported,

   #[error("backup failed: {0}")]
   Backup(String),

   #[error("connection pool error: {0}")]
   ConnectionPool(String),

   #[error("maximum number of open databases reached")]
   MaxDatabases,

   #[error("extension load failed: {0}")]
   Extension(String),

   #[error("registry is shutting down")]
   Shutdown,

   #[error("shutdown failed: {0}")]
   ShutdownError(String),

   #[error("lifecycle manager has been disposed")]
   LifecycleDisposed,
}

impl Error {
   /// The machine-readable error code for this variant.
   pub fn code(&self) -> &'static str {
      match self {
         Error::DatabaseNotFound(_) => "DATABASE_NOT_FOUND",
         Error::DatabaseAlreadyExists(_) => "DATABASE_ALREADY_EXISTS",
         Error::DatabaseClosed => "DATABASE_CLOSED",
         Error::DatabaseOpenFailed(_) => "DATABASE_OPEN_FAILED",
         Error::ReadOnly => "READ_ONLY",
         Error::Query(_) => "QUERY_ERROR",
         Error::Transaction(_) => "TRANSACTION_ERROR",
         Error::Migration { .. } => "MIGRATION_ERROR",
         Error::HookDenied(_) => "HOOK_DENIED",
         Error::Cdc(_) => "CDC_ERROR",
         Error::CdcUnsupported => "CDC_UNSUPPORTED",
         Error::Backup(_) => "BACKUP_ERROR",
         Error::ConnectionPool(_) => "CONNECTION_POOL_ERROR",
         Error::MaxDatabases => "MAX_DATABASES",
         Error::Extension(_) => "EXTENSION_ERROR",
         Error::Shutdown => "SHUTDOWN",
         Error::ShutdownError(_) => "SHUTDOWN_ERROR",
         Error::LifecycleDisposed => "LIFECYCLE_DISPOSED",
      }
   }

   /// The SQL text that failed, for [`Error::Query`] variants that carry one.
   pub fn sql(&self) -> Option<&str> {
      match self {
         Error::Query(sirannon_pool::Error::Query { sql, .. }) => Some(sql),
         _ => None,
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn codes_match_spec_names() {
      assert_eq!(Error::DatabaseClosed.code(), "DATABASE_CLOSED");
      assert_eq!(Error::ReadOnly.code(), "READ_ONLY");
      assert_eq!(
         Error::Migration { version: 3, message: "boom".into() }.code(),
         "MIGRATION_ERROR"
      );
   }

   #[test]
   fn query_error_carries_sql() {
      let err = Error::Query(sirannon_pool::Error::Query {
         sql: "SELECT 1".into(),
         message: "oops".into(),
      });
      assert_eq!(err.sql(), Some("SELECT 1"));
      assert_eq!(err.code(), "QUERY_ERROR");
   }
}

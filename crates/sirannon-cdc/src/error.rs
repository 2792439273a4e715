//! Error types for sirannon-cdc.

pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during CDC trigger installation, polling, or
/// subscription dispatch.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// SQLx database error.
   #[error("sqlx error: {0}")]
   Sqlx(#[from] sqlx::Error),

   /// A table or column name failed identifier validation
   /// (`^[A-Za-z_][A-Za-z0-9_]*$`), or the table doesn't exist.
   #[error("invalid identifier '{0}'")]
   InvalidIdentifier(String),

   /// The named table has no schema (not found via `PRAGMA table_info`).
   #[error("table '{0}' not found")]
   UnknownTable(String),

   /// Trigger install/remove or log-append failed for a reason other than
   /// the two above.
   #[error("CDC error: {0}")]
   Cdc(String),
}

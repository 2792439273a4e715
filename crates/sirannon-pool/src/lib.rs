//! # sirannon-pool
//!
//! Connection pooling, statement preparation, and transaction scoping for a
//! single SQLite database file.
//!
//! ## Core Types
//!
//! - **[`ConnectionPool`]**: one writer connection (absent when read-only) plus
//!   a fixed-size ring of reader connections, WAL-tuned.
//! - **[`PoolConfig`]**: pool construction parameters (`path`, `readOnly`,
//!   `readPoolSize`, `walMode`).
//! - **[`WriteGuard`]**: RAII guard around the single writer connection.
//! - **[`QueryExecutor`]**: stateless prepare/bind/iterate helper with a
//!   per-connection bounded statement cache.
//! - **[`Transaction`]**: a scoped writer session with implicit
//!   `BEGIN`/`COMMIT`/`ROLLBACK`.
//! - **[`Error`]**: pool/query error type.
//!
//! ## Architecture
//!
//! - **Connection pooling**: readers are `readPoolSize` independent
//!   single-connection pools, selected round-robin by an atomic cursor
//!   modulo the pool size — not a shared multi-connection sqlx pool — so
//!   reader selection is deterministic and testable.
//! - **WAL mode**: applied eagerly on the writer at open (`journal_mode=WAL`,
//!   `synchronous=NORMAL`); readers are opened read-only and rely on WAL's
//!   snapshot isolation for concurrency.
//! - **Exclusive writes**: the writer pool has `max_connections=1`, so
//!   `acquire_writer` serializes all mutation.
mod config;
mod error;
mod executor;
mod pool;
mod transaction;
mod write_guard;

pub use config::PoolConfig;
pub use error::{Error, Result};
pub use executor::{ExecuteResult, Params, QueryExecutor, Row};
pub use pool::ConnectionPool;
pub use transaction::Transaction;
pub use write_guard::WriteGuard;

//! # sirannon-cdc
//!
//! Trigger-based Change Data Capture for a single SQLite database file.
//!
//! ## Core Types
//!
//! - **[`ChangeTracker`]**: installs/removes per-table triggers, owns the
//!   poll cursor over the change log, and prunes old log rows.
//! - **[`SubscriptionManager`]**: table-indexed subscriptions with equality
//!   filters and isolated fan-out dispatch.
//! - **[`ChangeEvent`]**: one row mutation, as delivered to poll callers and
//!   subscribers.
//! - **[`TrackerConfig`]**: change log table name, poll batch size, retention.
//!
//! ## Architecture
//!
//! Unlike a hook-based observer, this crate never touches SQLite's native
//! preupdate/commit hooks: every watched table gets `AFTER INSERT/UPDATE/
//! DELETE` triggers that append a JSON snapshot row to a single change log
//! table (`_sirannon_changes` by default). A [`ChangeTracker`] then polls
//! that table with a monotonic `seq` cursor, so CDC delivery survives
//! process restarts and works against any SQLite build without special
//! compile flags.

mod change;
mod config;
mod error;
mod identifier;
mod schema;
mod subscription;
mod tracker;

pub use change::{ChangeEvent, ChangeOperation, Row};
pub use config::TrackerConfig;
pub use error::{Error, Result};
pub use schema::TableDescriptor;
pub use subscription::{Callback, Filter, SubscriptionHandle, SubscriptionManager};
pub use tracker::ChangeTracker;

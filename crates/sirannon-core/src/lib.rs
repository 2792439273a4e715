//! High-level Sirannon database engine: per-tenant lifecycle, migrations,
//! backup, hooks, metrics, and change data capture, built on
//! [`sirannon_pool`] and [`sirannon_cdc`].
//!
//! # Example
//!
//! ```no_run
//! use sirannon_core::{Registry, RegistryConfig, DatabaseOptions};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Registry::new(RegistryConfig::default());
//! let db = registry.open("tenant1", "tenant1.db", DatabaseOptions::default()).await?;
//! db.execute("CREATE TABLE IF NOT EXISTS t (id INTEGER PRIMARY KEY)", sirannon_pool::Params::none()).await?;
//! registry.close("tenant1").await?;
//! # Ok(())
//! # }
//! ```

pub mod backup;
pub mod database;
pub mod error;
pub mod hooks;
pub mod lifecycle;
pub mod metrics;
pub mod migrations;
pub mod registry;
pub mod tenant;

pub use backup::{BackupScheduleOptions, BackupScheduler, ScheduledBackup};
pub use database::Database;
pub use error::{Error, Result};
pub use hooks::{HookContext, HookEvent, HookRegistry, Listener};
pub use lifecycle::{LifecycleCallbacks, LifecycleManager, LifecycleManagerConfig};
pub use metrics::{ConnectionEvent, MetricsCollector, QueryMetric};
pub use migrations::{MigrateReport, MigrationRecord};
pub use registry::{DatabaseOptions, Registry, RegistryConfig};
pub use tenant::{TenantOpen, TenantResolver, TenantResolverConfig, create_tenant_resolver, is_valid_tenant_id, tenant_path};

// Re-export the lower-level crates so downstream code doesn't need to
// depend on them directly for common types like `Params` and `ChangeEvent`.
pub use sirannon_cdc;
pub use sirannon_pool;

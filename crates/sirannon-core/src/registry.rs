//! Per-ID database map with open/close lifecycle and hook/metrics
//! propagation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use crate::database::Database;
use crate::error::{Error, Result};
use crate::hooks::{HookContext, HookRegistry};
use crate::lifecycle::{LifecycleCallbacks, LifecycleManager, LifecycleManagerConfig};
use crate::metrics::{ConnectionEvent, MetricsCollector};

/// Per-database construction options, threaded through
/// `Registry::open`/auto-open/the tenant resolver.
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
   pub read_only: bool,
   pub read_pool_size: u32,
   pub wal_mode: bool,
   pub cdc_poll_interval: std::time::Duration,
   pub cdc_log_table: String,
   pub cdc_retention: std::time::Duration,
}

impl Default for DatabaseOptions {
   fn default() -> Self {
      Self {
         read_only: false,
         read_pool_size: 4,
         wal_mode: true,
         cdc_poll_interval: std::time::Duration::from_millis(50),
         cdc_log_table: "_sirannon_changes".to_string(),
         cdc_retention: std::time::Duration::from_secs(3600),
      }
   }
}

/// Construction parameters for a [`Registry`].
#[derive(Default)]
pub struct RegistryConfig {
   pub hooks: Option<HookRegistry>,
   pub metrics: Option<MetricsCollector>,
   pub lifecycle: Option<LifecycleManagerConfig>,
}

struct State {
   databases: Mutex<HashMap<String, Arc<Database>>>,
   shutdown: AtomicBool,
   hooks: HookRegistry,
   metrics: MetricsCollector,
   lifecycle: AsyncMutex<Option<LifecycleManager>>,
}

/// The top-level multi-tenant database map: `id -> Database`, with a
/// close-listener chain so closing a Database removes it here and from
/// lifecycle tracking.
#[derive(Clone)]
pub struct Registry {
   state: Arc<State>,
}

impl Registry {
   pub fn new(config: RegistryConfig) -> Self {
      let hooks = config.hooks.clone().unwrap_or_default();
      let metrics = config.metrics.clone().unwrap_or_default();

      let state = Arc::new_cyclic(|_weak: &Weak<State>| State {
         databases: Mutex::new(HashMap::new()),
         shutdown: AtomicBool::new(false),
         hooks,
         metrics,
         lifecycle: AsyncMutex::new(None),
      });

      if let Some(lifecycle_config) = config.lifecycle {
         let weak_for_open = Arc::downgrade(&state);
         let weak_for_close = Arc::downgrade(&state);
         let weak_for_count = Arc::downgrade(&state);
         let weak_for_has = Arc::downgrade(&state);

         let callbacks = LifecycleCallbacks {
            open: Arc::new(move |id, path, opts| {
               let weak = weak_for_open.clone();
               Box::pin(async move {
                  let Some(state) = weak.upgrade() else {
                     return Err(Error::Shutdown);
                  };
                  open_on(&state, &id, path, opts).await
               })
            }),
            close: Arc::new(move |id| {
               let weak = weak_for_close.clone();
               Box::pin(async move {
                  let Some(state) = weak.upgrade() else {
                     return Ok(());
                  };
                  close_on(&state, &id).await
               })
            }),
            count: Arc::new(move || {
               weak_for_count.upgrade().map(|s| s.databases.lock().expect("db map poisoned").len()).unwrap_or(0)
            }),
            has: Arc::new(move |id| {
               weak_for_has.upgrade().map(|s| s.databases.lock().expect("db map poisoned").contains_key(id)).unwrap_or(false)
            }),
         };

         // Set synchronously: the registry isn't shared yet, so a
         // blocking_lock-free sync assignment via try_lock is safe here.
         *state.lifecycle.try_lock().expect("fresh lock is never contended") = Some(LifecycleManager::new(lifecycle_config, callbacks));
      }

      Self { state }
   }

   pub fn hooks(&self) -> &HookRegistry {
      &self.state.hooks
   }

   pub fn metrics(&self) -> &MetricsCollector {
      &self.state.metrics
   }

   fn ensure_not_shutdown(&self) -> Result<()> {
      if self.state.shutdown.load(Ordering::SeqCst) {
         Err(Error::Shutdown)
      } else {
         Ok(())
      }
   }

   /// Open and register a new database at `path` under `id`.
   pub async fn open(&self, id: &str, path: impl Into<PathBuf>, options: DatabaseOptions) -> Result<Arc<Database>> {
      self.ensure_not_shutdown()?;
      if self.state.databases.lock().expect("db map poisoned").contains_key(id) {
         return Err(Error::DatabaseAlreadyExists(id.to_string()));
      }
      open_on(&self.state, id, path.into(), options).await?;
      Ok(self.state.databases.lock().expect("db map poisoned").get(id).expect("just inserted").clone())
   }

   /// Close and deregister `id`.
   pub async fn close(&self, id: &str) -> Result<()> {
      self.ensure_not_shutdown()?;
      close_on(&self.state, id).await
   }

   /// Return the live database for `id`, auto-opening via the lifecycle
   /// resolver if configured and not currently tracked.
   pub async fn get(&self, id: &str) -> Option<Arc<Database>> {
      if self.state.shutdown.load(Ordering::SeqCst) {
         return None;
      }
      if let Some(db) = self.state.databases.lock().expect("db map poisoned").get(id).cloned() {
         let lifecycle_guard = self.state.lifecycle.lock().await;
         if let Some(lifecycle) = lifecycle_guard.as_ref() {
            lifecycle.mark_active(id);
         }
         return Some(db);
      }

      let lifecycle_guard = self.state.lifecycle.lock().await;
      let Some(lifecycle) = lifecycle_guard.as_ref() else {
         return None;
      };
      let _ = lifecycle.resolve(id).await;
      drop(lifecycle_guard);

      self.state.databases.lock().expect("db map poisoned").get(id).cloned()
   }

   /// Snapshot `(id, closed, read_only)` for every currently tracked
   /// database, for the `/health/ready` endpoint.
   pub async fn snapshot_health(&self) -> Vec<(String, bool, bool)> {
      let databases: Vec<Arc<Database>> = self.state.databases.lock().expect("db map poisoned").values().cloned().collect();
      databases.into_iter().map(|db| (db.id().to_string(), db.is_closed(), db.is_read_only())).collect()
   }

   /// Dispose the lifecycle manager, close every database, and mark the
   /// Registry shut down. Idempotent.
   pub async fn shutdown(&self) -> Result<()> {
      if self.state.shutdown.swap(true, Ordering::SeqCst) {
         return Ok(());
      }

      if let Some(lifecycle) = self.state.lifecycle.lock().await.take() {
         lifecycle.dispose().await;
      }

      let ids: Vec<String> = self.state.databases.lock().expect("db map poisoned").keys().cloned().collect();
      let mut errors = Vec::new();
      for id in ids {
         if let Err(err) = close_on(&self.state, &id).await {
            errors.push(format!("{id}: {err}"));
         }
      }

      if errors.is_empty() {
         Ok(())
      } else {
         Err(Error::ShutdownError(errors.join("; ")))
      }
   }
}

async fn open_on(state: &Arc<State>, id: &str, path: PathBuf, options: DatabaseOptions) -> Result<()> {
   let ctx = HookContext { database_id: Some(id.to_string()), ..Default::default() };
   state.hooks.invoke_before_connect(&ctx)?;

   let database = Database::open(id.to_string(), path, options, Some(state.hooks.clone()), state.metrics.clone())
      .await
      .map_err(|err| match err {
         already @ Error::DatabaseAlreadyExists(_) => already,
         other => Error::DatabaseOpenFailed(other.to_string()),
      })?;

   let database = Arc::new(database);

   // Registers removal-on-close so a direct `db.close()` call (bypassing
   // `Registry::close`) still deregisters the entry and untracks lifecycle,
   // per the close-listener chain in the data model.
   let weak_state = Arc::downgrade(state);
   let listener_id = id.to_string();
   database.add_close_listener(Arc::new(move || {
      let Some(state) = weak_state.upgrade() else { return };
      state.databases.lock().expect("db map poisoned").remove(&listener_id);
      if let Ok(guard) = state.lifecycle.try_lock() {
         if let Some(lifecycle) = guard.as_ref() {
            lifecycle.untrack(&listener_id);
         }
      }
   }));

   state.databases.lock().expect("db map poisoned").insert(id.to_string(), database);

   state.hooks.invoke_database_open(&ctx);
   state.metrics.report_connection(id, ConnectionEvent::Open);

   Ok(())
}

async fn close_on(state: &Arc<State>, id: &str) -> Result<()> {
   let Some(database) = state.databases.lock().expect("db map poisoned").remove(id) else {
      return Err(Error::DatabaseNotFound(id.to_string()));
   };

   if let Some(lifecycle) = state.lifecycle.lock().await.as_ref() {
      lifecycle.untrack(id);
   }

   let ctx = HookContext { database_id: Some(id.to_string()), ..Default::default() };
   let result = database.close().await;
   state.hooks.invoke_database_close(&ctx);
   state.metrics.report_connection(id, ConnectionEvent::Close);

   if let Err(err) = &result {
      warn!(id, error = %err, "database close reported an error after listener chain");
   }
   result
}

#[cfg(test)]
mod tests {
   use super::*;

   #[tokio::test]
   async fn open_rejects_duplicate_id() {
      let dir = tempfile::tempdir().unwrap();
      let registry = Registry::new(RegistryConfig::default());
      registry.open("a", dir.path().join("a.db"), DatabaseOptions::default()).await.unwrap();
      let err = registry.open("a", dir.path().join("a2.db"), DatabaseOptions::default()).await.unwrap_err();
      assert!(matches!(err, Error::DatabaseAlreadyExists(_)));
   }

   #[tokio::test]
   async fn close_then_get_returns_none_without_lifecycle() {
      let dir = tempfile::tempdir().unwrap();
      let registry = Registry::new(RegistryConfig::default());
      registry.open("a", dir.path().join("a.db"), DatabaseOptions::default()).await.unwrap();
      registry.close("a").await.unwrap();
      assert!(registry.get("a").await.is_none());
   }

   #[tokio::test]
   async fn shutdown_then_open_and_close_raise_shutdown() {
      let dir = tempfile::tempdir().unwrap();
      let registry = Registry::new(RegistryConfig::default());
      registry.open("a", dir.path().join("a.db"), DatabaseOptions::default()).await.unwrap();
      registry.shutdown().await.unwrap();

      assert!(matches!(
         registry.open("b", dir.path().join("b.db"), DatabaseOptions::default()).await,
         Err(Error::Shutdown)
      ));
      assert!(matches!(registry.close("a").await, Err(Error::Shutdown)));
      assert!(registry.get("a").await.is_none());
   }

   #[tokio::test]
   async fn direct_close_deregisters_from_registry() {
      let dir = tempfile::tempdir().unwrap();
      let registry = Registry::new(RegistryConfig::default());
      let db = registry.open("a", dir.path().join("a.db"), DatabaseOptions::default()).await.unwrap();

      // Closing the handle directly (not via `Registry::close`) must still
      // remove it from the registry's map.
      db.close().await.unwrap();
      assert!(registry.get("a").await.is_none());
   }

   #[tokio::test]
   async fn shutdown_is_idempotent() {
      let registry = Registry::new(RegistryConfig::default());
      registry.shutdown().await.unwrap();
      registry.shutdown().await.unwrap();
   }

   #[tokio::test]
   async fn resolver_auto_open_evicts_under_max_open() {
      use crate::lifecycle::LifecycleManagerConfig;
      use crate::tenant::{create_tenant_resolver, TenantResolverConfig};

      let dir = tempfile::tempdir().unwrap();
      let resolver = create_tenant_resolver(TenantResolverConfig::new(dir.path()));
      let registry = Registry::new(RegistryConfig {
         lifecycle: Some(LifecycleManagerConfig {
            resolver: Some(resolver),
            idle_timeout: std::time::Duration::ZERO,
            max_open: 2,
         }),
         ..Default::default()
      });

      // Resolve `a`, `b`, `c` in sequence with a strictly increasing access
      // clock between each so eviction has an unambiguous LRU victim.
      assert!(registry.get("a").await.is_some());
      tokio::time::sleep(std::time::Duration::from_millis(5)).await;
      assert!(registry.get("b").await.is_some());
      tokio::time::sleep(std::time::Duration::from_millis(5)).await;
      assert!(registry.get("c").await.is_some());

      // Inspect tracked state directly rather than calling `get` again,
      // since a miss on "a" here would itself trigger another auto-open.
      let has = |id: &str| registry.state.databases.lock().unwrap().contains_key(id);
      assert!(!has("a"), "a should have been evicted to stay within maxOpen=2");
      assert!(has("b"));
      assert!(has("c"));
   }
}

//! Resolver-based auto-open, LRU eviction, and idle-timeout sweeping.
//! The LifecycleManager owns no Databases itself — only timestamps
//! keyed by ID — and delegates the actual open/close/count/has operations
//! back to its owning Registry via [`LifecycleCallbacks`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::tenant::TenantResolver;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Callbacks the LifecycleManager uses to actually open/close/count
/// databases; supplied by the owning Registry.
#[derive(Clone)]
pub struct LifecycleCallbacks {
   pub open: Arc<dyn Fn(String, std::path::PathBuf, crate::registry::DatabaseOptions) -> BoxFuture<'static, Result<()>> + Send + Sync>,
   pub close: Arc<dyn Fn(String) -> BoxFuture<'static, Result<()>> + Send + Sync>,
   pub count: Arc<dyn Fn() -> usize + Send + Sync>,
   pub has: Arc<dyn Fn(&str) -> bool + Send + Sync>,
}

/// Construction parameters for a [`LifecycleManager`].
#[derive(Clone)]
pub struct LifecycleManagerConfig {
   pub resolver: Option<TenantResolver>,
   /// `<= 0` disables the idle sweeper entirely.
   pub idle_timeout: Duration,
   /// Negative means unlimited.
   pub max_open: i64,
}

impl Default for LifecycleManagerConfig {
   fn default() -> Self {
      Self {
         resolver: None,
         idle_timeout: Duration::ZERO,
         max_open: -1,
      }
   }
}

struct Shared {
   last_access: Mutex<HashMap<String, Instant>>,
   callbacks: LifecycleCallbacks,
   config: LifecycleManagerConfig,
   disposed: std::sync::atomic::AtomicBool,
}

/// Tracks `lastAccess` timestamps keyed by database ID and drives
/// resolver-based auto-open, LRU eviction under `maxOpen`, and periodic
/// idle-timeout closing.
pub struct LifecycleManager {
   shared: Arc<Shared>,
   sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl LifecycleManager {
   pub fn new(config: LifecycleManagerConfig, callbacks: LifecycleCallbacks) -> Self {
      let shared = Arc::new(Shared {
         last_access: Mutex::new(HashMap::new()),
         callbacks,
         config: config.clone(),
         disposed: std::sync::atomic::AtomicBool::new(false),
      });

      let sweeper = if config.idle_timeout > Duration::ZERO {
         let period = config.idle_timeout / 2;
         let period = period.clamp(Duration::from_millis(100), Duration::from_secs(60));
         let shared_for_sweep = Arc::clone(&shared);
         Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
               interval.tick().await;
               if shared_for_sweep.disposed.load(std::sync::atomic::Ordering::SeqCst) {
                  break;
               }
               check_idle(&shared_for_sweep).await;
            }
         }))
      } else {
         None
      };

      Self {
         shared,
         sweeper: Mutex::new(sweeper),
      }
   }

   /// Record `id` as just-accessed. Only meaningful while the database is
   /// actually tracked; callers typically call this from `Registry::get`.
   pub fn mark_active(&self, id: &str) {
      self.shared.last_access.lock().expect("lastAccess lock poisoned").insert(id.to_string(), Instant::now());
   }

   pub fn untrack(&self, id: &str) {
      self.shared.last_access.lock().expect("lastAccess lock poisoned").remove(id);
   }

   pub fn tracked_count(&self) -> usize {
      self.shared.last_access.lock().expect("lastAccess lock poisoned").len()
   }

   pub fn is_tracked(&self, id: &str) -> bool {
      self.shared.last_access.lock().expect("lastAccess lock poisoned").contains_key(id)
   }

   /// Auto-open `id` via the configured resolver. Returns `Ok(None)` when
   /// there is no resolver, or the resolver itself declines (unknown
   /// tenant). Evicts under `maxOpen` pressure before opening; raises
   /// `Error::MaxDatabases` if eviction cannot make room.
   pub async fn resolve(&self, id: &str) -> Result<Option<()>> {
      if self.shared.disposed.load(std::sync::atomic::Ordering::SeqCst) {
         return Err(Error::LifecycleDisposed);
      }
      let Some(resolver) = &self.shared.config.resolver else {
         return Ok(None);
      };
      let Some(open_spec) = resolver(id) else {
         return Ok(None);
      };

      if self.shared.config.max_open >= 0 && (self.shared.callbacks.count)() as i64 >= self.shared.config.max_open {
         self.evict().await;
         if (self.shared.callbacks.count)() as i64 >= self.shared.config.max_open {
            return Err(Error::MaxDatabases);
         }
      }

      (self.shared.callbacks.open)(id.to_string(), open_spec.path, open_spec.options).await?;
      self.mark_active(id);
      Ok(Some(()))
   }

   /// Drop tracking for databases that are no longer open, close the
   /// least-recently-used tracked database, and drop its tracking entry.
   pub async fn evict(&self) {
      drop_stale(&self.shared).await;

      let victim = {
         let last_access = self.shared.last_access.lock().expect("lastAccess lock poisoned");
         last_access.iter().min_by_key(|(_, t)| **t).map(|(id, _)| id.clone())
      };
      let Some(id) = victim else {
         return;
      };
      if let Err(err) = (self.shared.callbacks.close)(id.clone()).await {
         warn!(id, error = %err, "eviction close failed");
      }
      self.untrack(&id);
   }

   /// Idempotent: stop the sweeper and drop all tracked state.
   pub async fn dispose(&self) {
      if self.shared.disposed.swap(true, std::sync::atomic::Ordering::SeqCst) {
         return;
      }
      if let Some(handle) = self.sweeper.lock().expect("sweeper lock poisoned").take() {
         handle.abort();
      }
      self.shared.last_access.lock().expect("lastAccess lock poisoned").clear();
   }
}

async fn drop_stale(shared: &Shared) {
   let ids: Vec<String> = shared.last_access.lock().expect("lastAccess lock poisoned").keys().cloned().collect();
   for id in ids {
      if !(shared.callbacks.has)(&id) {
         shared.last_access.lock().expect("lastAccess lock poisoned").remove(&id);
      }
   }
}

async fn check_idle(shared: &Arc<Shared>) {
   drop_stale(shared).await;

   let now = Instant::now();
   let idle: Vec<String> = {
      let last_access = shared.last_access.lock().expect("lastAccess lock poisoned");
      last_access
         .iter()
         .filter(|(_, t)| now.duration_since(**t) >= shared.config.idle_timeout)
         .map(|(id, _)| id.clone())
         .collect()
   };

   for id in idle {
      debug!(id, "idle timeout, closing");
      if let Err(err) = (shared.callbacks.close)(id.clone()).await {
         warn!(id, error = %err, "idle-timeout close failed");
      }
      shared.last_access.lock().expect("lastAccess lock poisoned").remove(&id);
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use std::sync::atomic::{AtomicUsize, Ordering};

   fn noop_callbacks(open_count: Arc<AtomicUsize>, closed: Arc<Mutex<Vec<String>>>) -> LifecycleCallbacks {
      let open_count_for_count = Arc::clone(&open_count);
      LifecycleCallbacks {
         open: Arc::new(move |_id, _path, _opts| {
            open_count.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
         }),
         close: Arc::new(move |id| {
            let closed = Arc::clone(&closed);
            Box::pin(async move {
               closed.lock().unwrap().push(id);
               Ok(())
            })
         }),
         count: Arc::new(move || open_count_for_count.load(Ordering::SeqCst)),
         has: Arc::new(|_id| true),
      }
   }

   #[tokio::test]
   async fn resolve_returns_none_without_resolver() {
      let manager = LifecycleManager::new(
         LifecycleManagerConfig::default(),
         noop_callbacks(Arc::new(AtomicUsize::new(0)), Arc::new(Mutex::new(Vec::new()))),
      );
      assert!(manager.resolve("x").await.unwrap().is_none());
   }

   #[tokio::test]
   async fn mark_active_and_untrack_round_trip() {
      let manager = LifecycleManager::new(
         LifecycleManagerConfig::default(),
         noop_callbacks(Arc::new(AtomicUsize::new(0)), Arc::new(Mutex::new(Vec::new()))),
      );
      manager.mark_active("a");
      assert!(manager.is_tracked("a"));
      manager.untrack("a");
      assert!(!manager.is_tracked("a"));
   }

   #[tokio::test]
   async fn dispose_is_idempotent() {
      let manager = LifecycleManager::new(
         LifecycleManagerConfig::default(),
         noop_callbacks(Arc::new(AtomicUsize::new(0)), Arc::new(Mutex::new(Vec::new()))),
      );
      manager.dispose().await;
      manager.dispose().await;
   }

   #[tokio::test]
   async fn evict_picks_smallest_last_access() {
      let closed = Arc::new(Mutex::new(Vec::new()));
      let manager = LifecycleManager::new(
         LifecycleManagerConfig::default(),
         noop_callbacks(Arc::new(AtomicUsize::new(2)), Arc::clone(&closed)),
      );
      manager.mark_active("old");
      tokio::time::sleep(Duration::from_millis(5)).await;
      manager.mark_active("new");

      manager.evict().await;
      assert_eq!(closed.lock().unwrap().as_slice(), ["old"]);
      assert!(!manager.is_tracked("old"));
      assert!(manager.is_tracked("new"));
   }
}

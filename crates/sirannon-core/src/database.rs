//! The Database facade: composes the connection pool, CDC tracker and
//! subscription manager, migrations, backup, hooks, and metrics behind one
//! per-tenant handle.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sirannon_cdc::{ChangeTracker, Filter, SubscriptionHandle, SubscriptionManager, TrackerConfig};
use sirannon_pool::{ConnectionPool, ExecuteResult, Params, PoolConfig, QueryExecutor, Row};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::backup::{self, BackupScheduleOptions, ScheduledBackup};
use crate::error::{Error, Result};
use crate::hooks::{HookContext, HookRegistry};
use crate::metrics::MetricsCollector;
use crate::migrations::{self, MigrateReport};
use crate::registry::DatabaseOptions;

/// Consecutive CDC poll failures after which the polling loop stops itself,
/// to avoid a hot error spiral. A fresh `watch()` call restarts it.
const MAX_CONSECUTIVE_POLL_FAILURES: u32 = 10;

struct Cdc {
   tracker: Arc<ChangeTracker>,
   subscriptions: Arc<SubscriptionManager>,
   poll_task: Mutex<Option<JoinHandle<()>>>,
}

/// One tenant's live database: pool, CDC state, hooks, metrics, and
/// bookkeeping for scheduled backups and close listeners.
pub struct Database {
   id: String,
   pool: Arc<ConnectionPool>,
   executor: QueryExecutor,
   options: DatabaseOptions,
   parent_hooks: Option<HookRegistry>,
   local_hooks: HookRegistry,
   metrics: MetricsCollector,
   cdc: Mutex<Option<Cdc>>,
   backup_schedules: Mutex<Vec<ScheduledBackup>>,
   close_listeners: Mutex<Vec<Arc<dyn Fn() + Send + Sync>>>,
   closed: AtomicBool,
}

impl Database {
   pub async fn open(
      id: String,
      path: PathBuf,
      options: DatabaseOptions,
      parent_hooks: Option<HookRegistry>,
      metrics: MetricsCollector,
   ) -> Result<Self> {
      let pool_config = PoolConfig::new(path)
         .read_only(options.read_only)
         .with_read_pool_size(options.read_pool_size)
         .with_wal_mode(options.wal_mode);

      let pool = ConnectionPool::open(pool_config).await.map_err(Error::Query)?;

      Ok(Self {
         id,
         pool: Arc::new(pool),
         executor: QueryExecutor::new(),
         options,
         parent_hooks,
         local_hooks: HookRegistry::new(),
         metrics,
         cdc: Mutex::new(None),
         backup_schedules: Mutex::new(Vec::new()),
         close_listeners: Mutex::new(Vec::new()),
         closed: AtomicBool::new(false),
      })
   }

   pub fn id(&self) -> &str {
      &self.id
   }

   pub fn is_read_only(&self) -> bool {
      self.options.read_only
   }

   pub fn is_closed(&self) -> bool {
      self.closed.load(Ordering::SeqCst)
   }

   fn ensure_open(&self) -> Result<()> {
      if self.is_closed() {
         Err(Error::DatabaseClosed)
      } else {
         Ok(())
      }
   }

   fn hook_chain_before(&self, event: crate::hooks::HookEvent, ctx: &HookContext) -> Result<()> {
      HookRegistry::invoke_before_chain(self.parent_hooks.as_ref(), &self.local_hooks, ctx, event)
   }

   fn hook_chain_after(&self, event: crate::hooks::HookEvent, ctx: &HookContext) {
      HookRegistry::invoke_after_chain(self.parent_hooks.as_ref(), &self.local_hooks, ctx, event);
   }

   /// Fire `beforeQuery` (may deny), run `f` inside a metrics timer,
   /// fire `afterQuery` (errors swallowed), and return `f`'s result.
   async fn wrapped<F, Fut, T>(&self, sql: &str, f: F) -> Result<T>
   where
      F: FnOnce() -> Fut,
      Fut: std::future::Future<Output = Result<T>>,
   {
      self.ensure_open()?;
      let before_ctx = HookContext { database_id: Some(self.id.clone()), sql: Some(sql.to_string()), ..Default::default() };
      self.hook_chain_before(crate::hooks::HookEvent::BeforeQuery, &before_ctx)?;

      let result = self.metrics.time_query(&self.id, f).await;

      let after_ctx = HookContext {
         database_id: Some(self.id.clone()),
         sql: Some(sql.to_string()),
         error: result.as_ref().err().map(|e| e.to_string()),
         ..Default::default()
      };
      self.hook_chain_after(crate::hooks::HookEvent::AfterQuery, &after_ctx);

      result
   }

   pub async fn query(&self, sql: &str, params: Params) -> Result<Vec<Row>> {
      self.wrapped(sql, || async {
         let reader = self.pool.acquire_reader().map_err(Error::Query)?;
         self.executor.query(reader, sql, &params).await.map_err(Error::Query)
      })
      .await
   }

   pub async fn query_one(&self, sql: &str, params: Params) -> Result<Option<Row>> {
      self.wrapped(sql, || async {
         let reader = self.pool.acquire_reader().map_err(Error::Query)?;
         self.executor.query_one(reader, sql, &params).await.map_err(Error::Query)
      })
      .await
   }

   pub async fn execute(&self, sql: &str, params: Params) -> Result<ExecuteResult> {
      self.wrapped(sql, || async {
         let mut guard = self.pool.acquire_writer().await.map_err(Error::Query)?;
         self.executor.execute(&mut *guard, sql, &params).await.map_err(Error::Query)
      })
      .await
   }

   pub async fn execute_batch(&self, sql: &str, params_batch: Vec<Params>) -> Result<Vec<ExecuteResult>> {
      self.wrapped(sql, || async {
         let mut guard = self.pool.acquire_writer().await.map_err(Error::Query)?;
         self.executor.execute_batch(&mut guard, sql, &params_batch).await.map_err(Error::Query)
      })
      .await
   }

   /// Run `f` inside an implicit `BEGIN`/`COMMIT`/`ROLLBACK` scope holding
   /// the pool's writer connection for the whole closure.
   pub async fn transaction<F, T>(&self, f: F) -> Result<T>
   where
      F: for<'t> FnOnce(
         &'t mut sirannon_pool::Transaction<'_>,
      ) -> std::pin::Pin<Box<dyn std::future::Future<Output = sirannon_pool::Result<T>> + Send + 't>>,
      T: Send,
   {
      self.ensure_open()?;
      self.pool.transaction(&self.executor, f).await.map_err(|err| match err {
         sirannon_pool::Error::PoolClosed => Error::DatabaseClosed,
         other => Error::Query(other),
      })
   }

   /// Install CDC triggers on `table` and start/keep the polling loop
   /// running. Forbidden on read-only databases and on memory-backed ones
   /// (`CdcUnsupported`), since an in-memory tenant has no durable change
   /// log worth polling.
   pub async fn watch(self: &Arc<Self>, table: &str) -> Result<()> {
      self.ensure_open()?;
      if self.options.read_only {
         return Err(Error::ReadOnly);
      }
      if self.pool.is_memory() {
         return Err(Error::CdcUnsupported);
      }

      let cdc = {
         let mut guard = self.cdc.lock().expect("cdc lock poisoned");
         if guard.is_none() {
            *guard = Some(Cdc {
               tracker: Arc::new(ChangeTracker::new(
                  TrackerConfig::new()
                     .with_log_table(self.options.cdc_log_table.clone())
                     .with_retention(self.options.cdc_retention),
               )),
               subscriptions: Arc::new(SubscriptionManager::new()),
               poll_task: Mutex::new(None),
            });
         }
         let cdc = guard.as_ref().unwrap();
         (Arc::clone(&cdc.tracker), Arc::clone(&cdc.subscriptions))
      };

      {
         let mut conn_guard = self.pool.acquire_writer().await.map_err(Error::Query)?;
         cdc.0.watch(&mut conn_guard, table).await.map_err(Error::Cdc)?;
      }

      self.ensure_poll_loop_running();
      Ok(())
   }

   /// Drop triggers for `table`; stop the polling loop once no tables
   /// remain watched.
   pub async fn unwatch(&self, table: &str) -> Result<()> {
      self.ensure_open()?;
      let tracker = {
         let guard = self.cdc.lock().expect("cdc lock poisoned");
         guard.as_ref().map(|c| Arc::clone(&c.tracker))
      };
      let Some(tracker) = tracker else {
         return Ok(());
      };

      {
         let mut conn_guard = self.pool.acquire_writer().await.map_err(Error::Query)?;
         tracker.unwatch(&mut conn_guard, table).await.map_err(Error::Cdc)?;
      }

      if tracker.watched_tables().is_empty() {
         let mut guard = self.cdc.lock().expect("cdc lock poisoned");
         if let Some(cdc) = guard.as_ref() {
            if let Some(handle) = cdc.poll_task.lock().expect("poll task lock poisoned").take() {
               handle.abort();
            }
         }
         *guard = None;
      }
      Ok(())
   }

   /// Start a new subscription on `table`, optionally filtered. Fails with
   /// `CdcUnsupported` unless `watch(table)` has already been called.
   pub fn on(&self, table: &str, filter: Option<Filter>, callback: sirannon_cdc::Callback) -> Result<SubscriptionHandle> {
      self.ensure_open()?;
      let guard = self.cdc.lock().expect("cdc lock poisoned");
      let Some(cdc) = guard.as_ref() else {
         return Err(Error::CdcUnsupported);
      };
      if !cdc.tracker.is_watching(table) {
         return Err(Error::Cdc(sirannon_cdc::Error::UnknownTable(table.to_string())));
      }
      Ok(cdc.subscriptions.subscribe(table, filter, callback))
   }

   fn ensure_poll_loop_running(self: &Arc<Self>) {
      let guard = self.cdc.lock().expect("cdc lock poisoned");
      let Some(cdc) = guard.as_ref() else { return };
      let mut task_guard = cdc.poll_task.lock().expect("poll task lock poisoned");
      if task_guard.as_ref().is_some_and(|h| !h.is_finished()) {
         return;
      }

      let db = Arc::clone(self);
      let tracker = Arc::clone(&cdc.tracker);
      let subscriptions = Arc::clone(&cdc.subscriptions);
      let interval = self.options.cdc_poll_interval;

      *task_guard = Some(tokio::spawn(async move {
         poll_loop(db, tracker, subscriptions, interval).await;
      }));
   }

   pub async fn migrate(&self, dir: &Path) -> Result<MigrateReport> {
      self.ensure_open()?;
      if self.options.read_only {
         return Err(Error::ReadOnly);
      }
      let mut guard = self.pool.acquire_writer().await.map_err(Error::Query)?;
      migrations::migrate(&mut guard, dir).await
   }

   pub async fn backup(&self, dest: &Path) -> Result<()> {
      self.ensure_open()?;
      backup::backup(&self.pool, dest).await
   }

   pub async fn schedule_backup(&self, options: BackupScheduleOptions) -> Result<()> {
      self.ensure_open()?;
      let scheduled = crate::backup::BackupScheduler::schedule(Arc::clone(&self.pool), options).await?;
      self.backup_schedules.lock().expect("backup schedules lock poisoned").push(scheduled);
      Ok(())
   }

   /// Reject unsafe paths (empty, containing NUL, or a `..` segment),
   /// resolve to an absolute path, and attempt to load the extension.
   pub async fn load_extension(&self, path: &str) -> Result<()> {
      self.ensure_open()?;
      if path.is_empty() || path.contains('\0') {
         return Err(Error::Extension("extension path is empty or contains a NUL byte".to_string()));
      }
      if std::path::Path::new(path).components().any(|c| matches!(c, std::path::Component::ParentDir)) {
         return Err(Error::Extension("extension path must not contain '..' segments".to_string()));
      }
      let absolute = std::path::Path::new(path)
         .canonicalize()
         .map_err(|e| Error::Extension(format!("cannot resolve extension path: {e}")))?;

      let mut guard = self.pool.acquire_writer().await.map_err(Error::Query)?;
      sqlx::query("SELECT load_extension(?)")
         .bind(absolute.to_string_lossy().to_string())
         .execute(&mut *guard)
         .await
         .map_err(|e| Error::Extension(e.to_string()))?;
      Ok(())
   }

   pub fn on_before_query(&self, listener: crate::hooks::Listener) {
      self.local_hooks.on_before_query(listener);
   }

   pub fn on_after_query(&self, listener: crate::hooks::Listener) {
      self.local_hooks.on_after_query(listener);
   }

   pub fn add_close_listener(&self, listener: Arc<dyn Fn() + Send + Sync>) {
      self.close_listeners.lock().expect("close listeners lock poisoned").push(listener);
   }

   /// Idempotently: stop CDC polling, cancel scheduled backups, close the
   /// pool, then run close listeners (errors swallowed). The pool's close
   /// error, if any, is re-raised after listeners run.
   pub async fn close(&self) -> Result<()> {
      if self.closed.swap(true, Ordering::SeqCst) {
         return Ok(());
      }

      if let Some(cdc) = self.cdc.lock().expect("cdc lock poisoned").take() {
         if let Some(handle) = cdc.poll_task.lock().expect("poll task lock poisoned").take() {
            handle.abort();
         }
      }

      for scheduled in self.backup_schedules.lock().expect("backup schedules lock poisoned").drain(..) {
         scheduled.cancel().await;
      }

      let pool_result = self.pool.close().await;

      let listeners = self.close_listeners.lock().expect("close listeners lock poisoned").clone();
      for listener in listeners {
         listener();
      }

      pool_result.map_err(Error::Query)
   }
}

/// How often the poll loop also runs retention cleanup, independent of the
/// poll tick interval itself. Clamped so a very short retention window still
/// gets pruned reasonably promptly, and a very long one doesn't run cleanup
/// every tick.
fn cleanup_interval(retention: Duration) -> Duration {
   (retention / 10).clamp(Duration::from_secs(10), Duration::from_secs(300))
}

async fn poll_loop(db: Arc<Database>, tracker: Arc<ChangeTracker>, subscriptions: Arc<SubscriptionManager>, interval: Duration) {
   let mut ticker = tokio::time::interval(interval);
   let consecutive_failures = AtomicU32::new(0);
   let cleanup_every = cleanup_interval(tracker.config().retention);
   let mut last_cleanup = tokio::time::Instant::now();

   loop {
      ticker.tick().await;
      if db.is_closed() {
         break;
      }

      let events = {
         let mut guard = match db.pool.acquire_writer().await {
            Ok(guard) => guard,
            Err(err) => {
               warn!(id = %db.id, error = %err, "CDC poll could not acquire writer");
               if consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1 >= MAX_CONSECUTIVE_POLL_FAILURES {
                  warn!(id = %db.id, "stopping CDC poll loop after repeated failures");
                  break;
               }
               continue;
            }
         };
         let events = tracker.poll(&mut guard).await;
         if last_cleanup.elapsed() >= cleanup_every {
            last_cleanup = tokio::time::Instant::now();
            match tracker.cleanup(&mut guard).await {
               Ok(deleted) if deleted > 0 => debug!(id = %db.id, deleted, "pruned expired CDC log rows"),
               Ok(_) => {}
               Err(err) => warn!(id = %db.id, error = %err, "CDC log cleanup failed"),
            }
         }
         events
      };

      match events {
         Ok(events) => {
            consecutive_failures.store(0, Ordering::SeqCst);
            if !events.is_empty() {
               debug!(id = %db.id, count = events.len(), "dispatching CDC events");
               subscriptions.dispatch(&events);
               db.metrics.report_cdc_dispatch(&db.id, events.len());
            }
         }
         Err(err) => {
            warn!(id = %db.id, error = %err, "CDC poll failed");
            if consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1 >= MAX_CONSECUTIVE_POLL_FAILURES {
               warn!(id = %db.id, "stopping CDC poll loop after repeated failures");
               break;
            }
         }
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use serde_json::json;

   async fn open_db(dir: &tempfile::TempDir, id: &str) -> Arc<Database> {
      Arc::new(
         Database::open(id.to_string(), dir.path().join(format!("{id}.db")), DatabaseOptions::default(), None, MetricsCollector::new())
            .await
            .unwrap(),
      )
   }

   #[tokio::test]
   async fn query_and_execute_round_trip() {
      let dir = tempfile::tempdir().unwrap();
      let db = open_db(&dir, "a").await;
      db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)", Params::none()).await.unwrap();
      db.execute("INSERT INTO t (v) VALUES (?)", Params::Positional(vec![json!("hi")])).await.unwrap();
      let rows = db.query("SELECT v FROM t", Params::none()).await.unwrap();
      assert_eq!(rows[0]["v"], json!("hi"));
   }

   #[tokio::test]
   async fn watch_is_forbidden_on_read_only() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("ro.db");
      // create the file writable first
      open_db(&dir, "ro").await;

      let mut opts = DatabaseOptions::default();
      opts.read_only = true;
      let db = Arc::new(Database::open("ro2".to_string(), path, opts, None, MetricsCollector::new()).await.unwrap());
      let err = db.watch("t").await.unwrap_err();
      assert!(matches!(err, Error::ReadOnly));
   }

   #[tokio::test]
   async fn watch_is_forbidden_on_memory_backed_database() {
      let db = Arc::new(
         Database::open(
            "mem".to_string(),
            PathBuf::from(":memory:"),
            DatabaseOptions::default(),
            None,
            MetricsCollector::new(),
         )
         .await
         .unwrap(),
      );
      db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", Params::none()).await.unwrap();
      let err = db.watch("t").await.unwrap_err();
      assert!(matches!(err, Error::CdcUnsupported));
   }

   #[tokio::test]
   async fn close_is_idempotent_and_blocks_further_operations() {
      let dir = tempfile::tempdir().unwrap();
      let db = open_db(&dir, "a").await;
      db.close().await.unwrap();
      db.close().await.unwrap();
      assert!(matches!(db.execute("SELECT 1", Params::none()).await, Err(Error::DatabaseClosed)));
   }

   #[tokio::test]
   async fn watch_and_subscribe_receive_insert_update_delete() {
      let dir = tempfile::tempdir().unwrap();
      let db = open_db(&dir, "a").await;
      db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v INT)", Params::none()).await.unwrap();
      db.watch("t").await.unwrap();

      let received = Arc::new(Mutex::new(Vec::new()));
      let received2 = Arc::clone(&received);
      let _handle = db
         .on(
            "t",
            None,
            Arc::new(move |event: &sirannon_cdc::ChangeEvent| {
               received2.lock().unwrap().push(event.operation);
               Ok(())
            }),
         )
         .unwrap();

      db.execute("INSERT INTO t (id, v) VALUES (1, 10)", Params::none()).await.unwrap();
      db.execute("UPDATE t SET v = 11 WHERE id = 1", Params::none()).await.unwrap();
      db.execute("DELETE FROM t WHERE id = 1", Params::none()).await.unwrap();

      // Give the poll loop a few ticks (default interval 50ms).
      tokio::time::sleep(Duration::from_millis(300)).await;

      let ops = received.lock().unwrap().clone();
      assert_eq!(ops.len(), 3);
   }
}

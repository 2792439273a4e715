//! Configurable sinks for query timing, connection lifecycle, and CDC
//! dispatch counts. A `MetricsCollector` with no sinks registered
//! is a no-op with no timing overhead beyond the one `Instant::now()` call
//! already needed to honor the trait.

use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One query's outcome, as reported to [`QuerySink`]s.
#[derive(Debug, Clone)]
pub struct QueryMetric {
   pub database_id: String,
   pub duration: Duration,
   pub error: bool,
}

/// One connection open/close event, as reported to [`ConnectionSink`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
   Open,
   Close,
}

pub type QuerySink = Arc<dyn Fn(&QueryMetric) + Send + Sync>;
pub type ConnectionSink = Arc<dyn Fn(&str, ConnectionEvent) + Send + Sync>;
pub type CdcDispatchSink = Arc<dyn Fn(&str, usize) + Send + Sync>;

#[derive(Default)]
struct Sinks {
   query: Vec<QuerySink>,
   connection: Vec<ConnectionSink>,
   cdc_dispatch: Vec<CdcDispatchSink>,
}

/// Wraps work units and fans timing/count metrics out to registered sinks.
/// Sinks are plain closures with no `Result` to report, so there is nothing
/// to swallow at this layer; callers that compose a fallible sink are
/// expected to catch its errors themselves before registering it, per the
/// "sink exceptions are swallowed" rule.
#[derive(Clone, Default)]
pub struct MetricsCollector {
   sinks: Arc<Mutex<Sinks>>,
}

impl MetricsCollector {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn on_query(&self, sink: QuerySink) {
      self.sinks.lock().expect("metrics lock poisoned").query.push(sink);
   }

   pub fn on_connection(&self, sink: ConnectionSink) {
      self.sinks.lock().expect("metrics lock poisoned").connection.push(sink);
   }

   pub fn on_cdc_dispatch(&self, sink: CdcDispatchSink) {
      self.sinks.lock().expect("metrics lock poisoned").cdc_dispatch.push(sink);
   }

   fn has_query_sinks(&self) -> bool {
      !self.sinks.lock().expect("metrics lock poisoned").query.is_empty()
   }

   /// Time `f`, reporting its duration and whether it errored to every
   /// query sink. Returns `f`'s own result unchanged.
   pub async fn time_query<F, Fut, T, E>(&self, database_id: &str, f: F) -> std::result::Result<T, E>
   where
      F: FnOnce() -> Fut,
      Fut: std::future::Future<Output = std::result::Result<T, E>>,
   {
      if !self.has_query_sinks() {
         return f().await;
      }
      let start = std::time::Instant::now();
      let result = f().await;
      let metric = QueryMetric {
         database_id: database_id.to_string(),
         duration: start.elapsed(),
         error: result.is_err(),
      };
      self.report_query(&metric);
      result
   }

   fn report_query(&self, metric: &QueryMetric) {
      for sink in self.sinks.lock().expect("metrics lock poisoned").query.clone() {
         sink(metric);
      }
   }

   pub fn report_connection(&self, database_id: &str, event: ConnectionEvent) {
      for sink in self.sinks.lock().expect("metrics lock poisoned").connection.clone() {
         sink(database_id, event);
      }
   }

   pub fn report_cdc_dispatch(&self, database_id: &str, event_count: usize) {
      for sink in self.sinks.lock().expect("metrics lock poisoned").cdc_dispatch.clone() {
         sink(database_id, event_count);
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use std::sync::atomic::{AtomicUsize, Ordering};

   #[tokio::test]
   async fn time_query_reports_duration_and_error_flag() {
      let collector = MetricsCollector::new();
      let reported = Arc::new(Mutex::new(None));
      let reported2 = Arc::clone(&reported);
      collector.on_query(Arc::new(move |m| {
         *reported2.lock().unwrap() = Some(m.clone());
      }));

      let _: std::result::Result<(), &str> = collector
         .time_query("db1", || async { Err("boom") })
         .await;

      let metric = reported.lock().unwrap().clone().unwrap();
      assert_eq!(metric.database_id, "db1");
      assert!(metric.error);
   }

   #[test]
   fn connection_sink_receives_open_and_close() {
      let collector = MetricsCollector::new();
      let count = Arc::new(AtomicUsize::new(0));
      let count2 = Arc::clone(&count);
      collector.on_connection(Arc::new(move |_id, _event| {
         count2.fetch_add(1, Ordering::SeqCst);
      }));
      collector.report_connection("db1", ConnectionEvent::Open);
      collector.report_connection("db1", ConnectionEvent::Close);
      assert_eq!(count.load(Ordering::SeqCst), 2);
   }

   #[tokio::test]
   async fn no_sinks_means_no_overhead_path_still_runs_closure() {
      let collector = MetricsCollector::new();
      let ran = collector.time_query("db1", || async { Ok::<_, ()>(42) }).await;
      assert_eq!(ran, Ok(42));
   }
}

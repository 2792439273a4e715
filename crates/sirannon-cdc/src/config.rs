//! Configuration for a [`ChangeTracker`](crate::ChangeTracker).

use std::time::Duration;

/// Construction parameters for a [`ChangeTracker`](crate::ChangeTracker).
#[derive(Debug, Clone)]
pub struct TrackerConfig {
   /// Name of the change log table.
   ///
   /// Default: `_sirannon_changes`
   pub log_table: String,

   /// Maximum rows returned per [`poll`](crate::ChangeTracker::poll) call.
   ///
   /// Default: 1000
   pub poll_batch_size: u32,

   /// How long a polled-and-advanced-past log row survives before
   /// [`cleanup`](crate::ChangeTracker::cleanup) may delete it.
   ///
   /// Default: 1 hour
   pub retention: Duration,
}

impl Default for TrackerConfig {
   fn default() -> Self {
      Self {
         log_table: "_sirannon_changes".to_string(),
         poll_batch_size: 1000,
         retention: Duration::from_secs(3600),
      }
   }
}

impl TrackerConfig {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn with_log_table(mut self, name: impl Into<String>) -> Self {
      self.log_table = name.into();
      self
   }

   pub fn with_poll_batch_size(mut self, size: u32) -> Self {
      self.poll_batch_size = size.max(1);
      self
   }

   pub fn with_retention(mut self, retention: Duration) -> Self {
      self.retention = retention;
      self
   }
}

//! Table-indexed subscriptions, filter matching, and fan-out dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::change::ChangeEvent;

/// A subscriber callback. Returning `Err` is this crate's equivalent of a
/// subscriber exception: it is caught, logged, and does not interrupt
/// dispatch to siblings or to later events.
pub type Callback =
   Arc<dyn Fn(&ChangeEvent) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> + Send + Sync>;

/// Equality filter: all keys must match (AND semantics).
pub type Filter = IndexMap<String, JsonValue>;

struct Subscription {
   id: u64,
   filter: Option<Filter>,
   callback: Callback,
}

struct Inner {
   by_table: Mutex<HashMap<String, Vec<Subscription>>>,
   next_id: AtomicU64,
}

/// Indexes subscriptions by table and dispatches matching [`ChangeEvent`]s.
#[derive(Clone)]
pub struct SubscriptionManager {
   inner: Arc<Inner>,
}

impl Default for SubscriptionManager {
   fn default() -> Self {
      Self::new()
   }
}

impl SubscriptionManager {
   pub fn new() -> Self {
      Self {
         inner: Arc::new(Inner {
            by_table: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
         }),
      }
   }

   /// Register `callback` for `table`, optionally filtered by equality on
   /// `filter`. Returns a handle whose `unsubscribe()` is idempotent.
   pub fn subscribe(
      &self,
      table: &str,
      filter: Option<Filter>,
      callback: Callback,
   ) -> SubscriptionHandle {
      let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
      self
         .inner
         .by_table
         .lock()
         .expect("subscription lock poisoned")
         .entry(table.to_string())
         .or_default()
         .push(Subscription { id, filter, callback });

      SubscriptionHandle {
         id,
         manager: Arc::downgrade(&self.inner),
      }
   }

   /// Number of live subscriptions across all tables. Test/diagnostic use.
   pub fn subscription_count(&self) -> usize {
      self
         .inner
         .by_table
         .lock()
         .expect("subscription lock poisoned")
         .values()
         .map(Vec::len)
         .sum()
   }

   /// Dispatch `events`, strictly in the order given (callers should pass
   /// them already ordered by `seq`). Across subscribers for the same event
   /// there is no ordering guarantee.
   pub fn dispatch(&self, events: &[ChangeEvent]) {
      for event in events {
         let matching: Vec<Callback> = {
            let by_table = self.inner.by_table.lock().expect("subscription lock poisoned");
            let Some(subs) = by_table.get(&event.table) else {
               continue;
            };
            subs
               .iter()
               .filter(|sub| matches(sub, event))
               .map(|sub| Arc::clone(&sub.callback))
               .collect()
         };

         for callback in matching {
            if let Err(err) = callback(event) {
               warn!(table = %event.table, seq = event.seq, error = %err, "CDC subscriber callback failed");
            }
         }
      }
   }
}

fn matches(sub: &Subscription, event: &ChangeEvent) -> bool {
   let Some(filter) = &sub.filter else {
      return true;
   };
   let target = match event.operation {
      crate::change::ChangeOperation::Delete => event.old_row.as_ref().unwrap_or(&event.row),
      _ => &event.row,
   };
   filter.iter().all(|(key, expected)| target.get(key) == Some(expected))
}

/// Opaque handle to a live subscription.
pub struct SubscriptionHandle {
   id: u64,
   manager: Weak<Inner>,
}

impl SubscriptionHandle {
   /// Idempotent: a no-op if already unsubscribed, or if the owning
   /// [`SubscriptionManager`] (and its Database) has since been dropped.
   pub fn unsubscribe(&self) {
      let Some(inner) = self.manager.upgrade() else {
         return;
      };
      let mut by_table = inner.by_table.lock().expect("subscription lock poisoned");
      for subs in by_table.values_mut() {
         subs.retain(|s| s.id != self.id);
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::change::ChangeOperation;
   use std::sync::atomic::AtomicUsize;

   fn event(table: &str, op: ChangeOperation, row: Vec<(&str, JsonValue)>) -> ChangeEvent {
      ChangeEvent {
         operation: op,
         table: table.to_string(),
         row: row.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
         old_row: None,
         seq: 1,
         timestamp: 0.0,
      }
   }

   #[test]
   fn filter_matches_exact_equality_and_rejects_others() {
      let manager = SubscriptionManager::new();
      let received = Arc::new(AtomicUsize::new(0));
      let received2 = Arc::clone(&received);

      let mut filter = Filter::new();
      filter.insert("name".to_string(), serde_json::json!("Alice"));

      let _handle = manager.subscribe(
         "users",
         Some(filter),
         Arc::new(move |_event| {
            received2.fetch_add(1, Ordering::SeqCst);
            Ok(())
         }),
      );

      manager.dispatch(&[
         event("users", ChangeOperation::Insert, vec![("name", serde_json::json!("Bob"))]),
         event(
            "users",
            ChangeOperation::Insert,
            vec![("name", serde_json::json!("Alice"))],
         ),
      ]);

      assert_eq!(received.load(Ordering::SeqCst), 1);
   }

   #[test]
   fn unsubscribe_is_idempotent_and_stops_delivery() {
      let manager = SubscriptionManager::new();
      let received = Arc::new(AtomicUsize::new(0));
      let received2 = Arc::clone(&received);

      let handle = manager.subscribe(
         "t",
         None,
         Arc::new(move |_event| {
            received2.fetch_add(1, Ordering::SeqCst);
            Ok(())
         }),
      );

      handle.unsubscribe();
      handle.unsubscribe();

      manager.dispatch(&[event("t", ChangeOperation::Insert, vec![])]);
      assert_eq!(received.load(Ordering::SeqCst), 0);
   }

   #[test]
   fn one_callback_error_does_not_block_siblings() {
      let manager = SubscriptionManager::new();
      let second_ran = Arc::new(AtomicUsize::new(0));
      let second_ran2 = Arc::clone(&second_ran);

      manager.subscribe(
         "t",
         None,
         Arc::new(|_event| Err("boom".into())),
      );
      manager.subscribe(
         "t",
         None,
         Arc::new(move |_event| {
            second_ran2.fetch_add(1, Ordering::SeqCst);
            Ok(())
         }),
      );

      manager.dispatch(&[event("t", ChangeOperation::Insert, vec![])]);
      assert_eq!(second_ran.load(Ordering::SeqCst), 1);
   }
}

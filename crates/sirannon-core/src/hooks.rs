//! Multi-listener before/after hooks, composed parent (Registry) then local
//! (Database): a `beforeQuery` denial from either level short-circuits the
//! query, while `afterQuery` runs every listener in both levels regardless
//! of individual failures.

use std::sync::{Arc, Mutex};

use serde_json::Value as JsonValue;

use crate::error::{Error, Result};

/// Context passed to a hook listener. Each event only populates the fields
/// relevant to it; see the five `HookEvent` variants below.
#[derive(Debug, Clone, Default)]
pub struct HookContext {
   pub database_id: Option<String>,
   pub sql: Option<String>,
   pub params: Option<JsonValue>,
   pub duration_ms: Option<f64>,
   pub error: Option<String>,
}

/// `beforeConnect`/`databaseOpen`/`databaseClose`/`beforeQuery`/`afterQuery`
/// listener. Returning `Err` from a `beforeConnect`/`beforeQuery` listener
/// denies the operation; from any other event it is swallowed.
pub type Listener = Arc<dyn Fn(&HookContext) -> std::result::Result<(), String> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
   BeforeConnect,
   DatabaseOpen,
   DatabaseClose,
   BeforeQuery,
   AfterQuery,
}

#[derive(Default)]
struct Listeners {
   before_connect: Vec<Listener>,
   database_open: Vec<Listener>,
   database_close: Vec<Listener>,
   before_query: Vec<Listener>,
   after_query: Vec<Listener>,
}

impl Listeners {
   fn for_event(&self, event: HookEvent) -> &[Listener] {
      match event {
         HookEvent::BeforeConnect => &self.before_connect,
         HookEvent::DatabaseOpen => &self.database_open,
         HookEvent::DatabaseClose => &self.database_close,
         HookEvent::BeforeQuery => &self.before_query,
         HookEvent::AfterQuery => &self.after_query,
      }
   }
}

/// A registry of listeners for the five hook events. A Database holds its
/// own local `HookRegistry` plus (optionally) a reference to its Registry's
/// global one; parent listeners always run before local ones.
#[derive(Clone, Default)]
pub struct HookRegistry {
   listeners: Arc<Mutex<Listeners>>,
}

impl HookRegistry {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn on_before_connect(&self, listener: Listener) {
      self.listeners.lock().expect("hook lock poisoned").before_connect.push(listener);
   }

   pub fn on_database_open(&self, listener: Listener) {
      self.listeners.lock().expect("hook lock poisoned").database_open.push(listener);
   }

   pub fn on_database_close(&self, listener: Listener) {
      self.listeners.lock().expect("hook lock poisoned").database_close.push(listener);
   }

   pub fn on_before_query(&self, listener: Listener) {
      self.listeners.lock().expect("hook lock poisoned").before_query.push(listener);
   }

   pub fn on_after_query(&self, listener: Listener) {
      self.listeners.lock().expect("hook lock poisoned").after_query.push(listener);
   }

   fn clone_listeners(&self, event: HookEvent) -> Vec<Listener> {
      self.listeners.lock().expect("hook lock poisoned").for_event(event).to_vec()
   }

   /// `beforeConnect`/`beforeQuery`: the first listener to return `Err`
   /// aborts the operation with `Error::HookDenied`.
   pub fn invoke_before_query(&self, ctx: &HookContext) -> Result<()> {
      self.invoke_denying(HookEvent::BeforeQuery, ctx)
   }

   pub fn invoke_before_connect(&self, ctx: &HookContext) -> Result<()> {
      self.invoke_denying(HookEvent::BeforeConnect, ctx)
   }

   /// `databaseOpen`/`databaseClose`/`afterQuery`: errors are logged and
   /// swallowed, never masking the operation's real result.
   pub fn invoke_after_query(&self, ctx: &HookContext) {
      self.invoke_swallowing(HookEvent::AfterQuery, ctx)
   }

   pub fn invoke_database_open(&self, ctx: &HookContext) {
      self.invoke_swallowing(HookEvent::DatabaseOpen, ctx)
   }

   pub fn invoke_database_close(&self, ctx: &HookContext) {
      self.invoke_swallowing(HookEvent::DatabaseClose, ctx)
   }

   fn invoke_denying(&self, event: HookEvent, ctx: &HookContext) -> Result<()> {
      for listener in self.clone_listeners(event) {
         if let Err(message) = listener(ctx) {
            return Err(Error::HookDenied(message));
         }
      }
      Ok(())
   }

   fn invoke_swallowing(&self, event: HookEvent, ctx: &HookContext) {
      for listener in self.clone_listeners(event) {
         if let Err(message) = listener(ctx) {
            tracing::warn!(?event, error = %message, "hook listener error swallowed");
         }
      }
   }

   /// Invoke `parent` (if any) then `local`, in that order, for a denying
   /// event (`beforeConnect`/`beforeQuery`).
   pub fn invoke_before_chain(
      parent: Option<&HookRegistry>,
      local: &HookRegistry,
      ctx: &HookContext,
      event: HookEvent,
   ) -> Result<()> {
      if let Some(parent) = parent {
         parent.invoke_denying(event, ctx)?;
      }
      local.invoke_denying(event, ctx)
   }

   /// Invoke `parent` (if any) then `local`, in that order, for a swallowing
   /// event (`databaseOpen`/`databaseClose`/`afterQuery`).
   pub fn invoke_after_chain(
      parent: Option<&HookRegistry>,
      local: &HookRegistry,
      ctx: &HookContext,
      event: HookEvent,
   ) {
      if let Some(parent) = parent {
         parent.invoke_swallowing(event, ctx);
      }
      local.invoke_swallowing(event, ctx);
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn before_query_listener_denies_with_its_message() {
      let registry = HookRegistry::new();
      registry.on_before_query(Arc::new(|_ctx| Err("nope".to_string())));
      let err = registry.invoke_before_query(&HookContext::default()).unwrap_err();
      assert!(matches!(err, Error::HookDenied(m) if m == "nope"));
   }

   #[test]
   fn after_query_errors_are_swallowed() {
      let registry = HookRegistry::new();
      registry.on_after_query(Arc::new(|_ctx| Err("boom".to_string())));
      registry.invoke_after_query(&HookContext::default());
   }

   #[test]
   fn parent_invoked_before_local() {
      let order = Arc::new(Mutex::new(Vec::new()));
      let parent = HookRegistry::new();
      let local = HookRegistry::new();

      let o1 = Arc::clone(&order);
      parent.on_before_query(Arc::new(move |_ctx| {
         o1.lock().unwrap().push("parent");
         Ok(())
      }));
      let o2 = Arc::clone(&order);
      local.on_before_query(Arc::new(move |_ctx| {
         o2.lock().unwrap().push("local");
         Ok(())
      }));

      HookRegistry::invoke_before_chain(Some(&parent), &local, &HookContext::default(), HookEvent::BeforeQuery).unwrap();
      assert_eq!(*order.lock().unwrap(), vec!["parent", "local"]);
   }

   #[test]
   fn second_listener_not_invoked_after_first_denies() {
      let registry = HookRegistry::new();
      let ran = Arc::new(Mutex::new(false));
      let ran2 = Arc::clone(&ran);
      registry.on_before_query(Arc::new(|_ctx| Err("denied".to_string())));
      registry.on_before_query(Arc::new(move |_ctx| {
         *ran2.lock().unwrap() = true;
         Ok(())
      }));
      let _ = registry.invoke_before_query(&HookContext::default());
      assert!(!*ran.lock().unwrap());
   }
}

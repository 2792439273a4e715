//! Shared process state: the tenant registry, loaded settings, and the
//! optional `onRequest` hook consulted before every database-route or
//! WebSocket-upgrade request.

use std::sync::Arc;

use axum::http::StatusCode;

use crate::settings::Settings;

/// What the `onRequest` hook sees about an inbound request.
#[derive(Debug, Clone)]
pub struct RequestContext {
   pub database_id: String,
   pub method: String,
   pub path: String,
}

/// A denial returned by the `onRequest` hook: short-circuits the request
/// with this status/code/message instead of reaching the handler.
#[derive(Debug, Clone)]
pub struct Denial {
   pub status: StatusCode,
   pub code: &'static str,
   pub message: String,
}

/// `Some` chain entry denies synchronously; a panic inside is caught by the
/// caller and translated into a `HOOK_ERROR` 500.
pub type OnRequestHook = Arc<dyn Fn(&RequestContext) -> Option<Denial> + Send + Sync>;

#[derive(Clone)]
pub struct AppState {
   pub registry: Arc<sirannon_core::Registry>,
   pub settings: Arc<Settings>,
   pub on_request: Option<OnRequestHook>,
}

impl AppState {
   pub fn new(registry: sirannon_core::Registry, settings: Settings) -> Self {
      Self { registry: Arc::new(registry), settings: Arc::new(settings), on_request: None }
   }

   pub fn with_on_request(mut self, hook: OnRequestHook) -> Self {
      self.on_request = Some(hook);
      self
   }

   /// Evaluate the `onRequest` hook for a database-route or WS-upgrade
   /// request. A hook that panics is treated as a thrown exception and
   /// reported as `HOOK_ERROR`.
   pub fn check_on_request(&self, ctx: &RequestContext) -> Result<(), Denial> {
      let Some(hook) = &self.on_request else {
         return Ok(());
      };
      let ctx_for_panic = ctx.clone();
      match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(ctx))) {
         Ok(Some(denial)) => Err(denial),
         Ok(None) => Ok(()),
         Err(_) => Err(Denial {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "HOOK_ERROR",
            message: format!("onRequest hook panicked for {} {}", ctx_for_panic.method, ctx_for_panic.path),
         }),
      }
   }
}

//! Process entry point: load settings, build the tenant registry, serve the
//! HTTP+WebSocket network surface, and shut down cleanly on SIGINT/SIGTERM.
//! Shutdown sequencing is modeled on `eardogger-rs`'s `main.rs`: a
//! `CancellationToken` observed by `axum::serve`'s graceful shutdown, then the
//! registry closed once the listener has stopped.

mod api_error;
mod http;
mod settings;
mod state;
mod wire;
mod ws;

use std::time::Duration;

use sirannon_core::{create_tenant_resolver, DatabaseOptions, LifecycleManagerConfig, Registry, RegistryConfig, TenantResolverConfig};
use tokio::net::TcpListener;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::settings::Settings;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
   tracing_subscriber::registry()
      .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
      .with(tracing_subscriber::fmt::layer())
      .init();

   let settings = Settings::with_env_and_config_file(None)?;
   tokio::fs::create_dir_all(&settings.base_dir).await?;

   let registry = Registry::new(registry_config(&settings));
   let state = AppState::new(registry.clone(), settings.clone());
   let app = http::router(state);

   let cancel_token = CancellationToken::new();
   tokio::spawn(cancel_on_terminate(cancel_token.clone()));

   let addr = settings.bind_addr()?;
   let listener = TcpListener::bind(addr).await?;
   info!(%addr, "starting sirannon network surface");

   let serve_result =
      axum::serve(listener, app).with_graceful_shutdown(cancel_token.clone().cancelled_owned()).await;

   if let Err(err) = serve_result {
      error!(error = %err, "server loop exited with an error");
      cancel_token.cancel();
   }

   if let Err(err) = registry.shutdown().await {
      error!(error = %err, "registry shutdown reported an error");
   }
   info!("shutdown complete");

   Ok(())
}

/// Builds the registry's lifecycle wiring: a tenant resolver rooted at
/// `settings.base_dir` so `/db/:id/*` requests auto-open `<id>.db` on first
/// use, with eviction/idle-timeout behavior driven by `settings`.
fn registry_config(settings: &Settings) -> RegistryConfig {
   let default_options = DatabaseOptions {
      read_pool_size: settings.default_read_pool_size,
      cdc_poll_interval: settings.default_cdc_poll_interval(),
      cdc_retention: settings.default_cdc_retention(),
      ..DatabaseOptions::default()
   };

   let resolver = create_tenant_resolver(
      TenantResolverConfig::new(settings.base_dir.clone()).with_default_options(default_options),
   );

   let lifecycle = LifecycleManagerConfig {
      resolver: Some(resolver),
      idle_timeout: Duration::from_secs(settings.tenant_idle_timeout_secs),
      max_open: settings.max_open_databases,
   };

   RegistryConfig {
      lifecycle: Some(lifecycle),
      ..RegistryConfig::default()
   }
}

/// Waits for SIGINT or SIGTERM, then cancels the token so
/// `axum::serve`'s graceful shutdown stops accepting new connections.
async fn cancel_on_terminate(cancel_token: CancellationToken) {
   use tokio::signal::ctrl_c;
   use tokio::signal::unix::{signal, SignalKind};

   let Ok(mut terminate) = signal(SignalKind::terminate()) else {
      error!("couldn't establish a SIGTERM listener; shutting down immediately");
      cancel_token.cancel();
      return;
   };

   select! {
      _ = ctrl_c() => {
         info!("received SIGINT, starting shutdown");
      }
      _ = terminate.recv() => {
         info!("received SIGTERM, starting shutdown");
      }
   }
   cancel_token.cancel();
}

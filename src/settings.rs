//! Process configuration: a TOML file overlaid by `SIRANNON_`-prefixed
//! environment variables, in the shape of `syncserver-settings`'s
//! `Settings::with_env_and_config_file` but built on `config`'s modern
//! builder API.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// Default maximum HTTP/WS body size, per the 1 MiB network-surface limit.
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
   pub bind_address: String,
   pub port: u16,
   /// Directory under which per-tenant database files are resolved.
   pub base_dir: PathBuf,
   pub default_read_pool_size: u32,
   pub default_cdc_poll_interval_ms: u64,
   pub default_cdc_retention_secs: u64,
   /// Origins allowed by CORS; empty disables CORS handling entirely.
   pub cors_origins: Vec<String>,
   pub max_body_bytes: usize,
   /// Seconds of inactivity before an auto-opened tenant is closed.
   /// `0` disables the idle sweeper.
   pub tenant_idle_timeout_secs: u64,
   /// Maximum tenants open at once under auto-open. Negative means
   /// unlimited.
   pub max_open_databases: i64,
}

impl Default for Settings {
   fn default() -> Self {
      Self {
         bind_address: "127.0.0.1".to_string(),
         port: 8080,
         base_dir: PathBuf::from("./data"),
         default_read_pool_size: 4,
         default_cdc_poll_interval_ms: 50,
         default_cdc_retention_secs: 3600,
         cors_origins: Vec::new(),
         max_body_bytes: DEFAULT_MAX_BODY_BYTES,
         tenant_idle_timeout_secs: 0,
         max_open_databases: -1,
      }
   }
}

impl Settings {
   /// Load defaults, overlay an optional TOML file (`sirannon.toml` when
   /// `filename` is `None`), then overlay `SIRANNON__`-prefixed environment
   /// variables (double underscore as the nesting separator).
   pub fn with_env_and_config_file(filename: Option<&str>) -> Result<Self, ConfigError> {
      let defaults = Config::try_from(&Settings::default())?;

      let mut builder = Config::builder().add_source(defaults);
      builder = builder.add_source(File::with_name(filename.unwrap_or("sirannon")).required(false));
      builder = builder.add_source(Environment::with_prefix("SIRANNON").separator("__"));

      builder.build()?.try_deserialize()
   }

   pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
      let ip: IpAddr = self.bind_address.parse()?;
      Ok(SocketAddr::new(ip, self.port))
   }

   pub fn default_cdc_poll_interval(&self) -> Duration {
      Duration::from_millis(self.default_cdc_poll_interval_ms)
   }

   pub fn default_cdc_retention(&self) -> Duration {
      Duration::from_secs(self.default_cdc_retention_secs)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn defaults_bind_to_localhost_8080() {
      let settings = Settings::default();
      assert_eq!(settings.bind_addr().unwrap(), "127.0.0.1:8080".parse().unwrap());
      assert_eq!(settings.max_body_bytes, DEFAULT_MAX_BODY_BYTES);
   }

   #[test]
   fn with_env_and_config_file_falls_back_to_defaults_when_no_file_present() {
      let settings = Settings::with_env_and_config_file(Some("definitely-does-not-exist")).unwrap();
      assert_eq!(settings.port, 8080);
      assert_eq!(settings.default_read_pool_size, 4);
   }
}

//! Tenant ID sanitization and resolver construction.
//!
//! `create_tenant_resolver` builds a function compatible with
//! [`LifecycleManager`](crate::lifecycle::LifecycleManager)'s `resolver`
//! callback: invalid IDs and over-long filenames return `None` rather than
//! erroring, so auto-open can never be turned into a path-traversal vector.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::LazyLock;

use regex::Regex;

use crate::registry::DatabaseOptions;

static TENANT_ID_RE: LazyLock<Regex> =
   LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*$").unwrap());

/// What a resolver returns for an auto-open: the path to open plus the
/// options to open it with.
#[derive(Debug, Clone)]
pub struct TenantOpen {
   pub path: PathBuf,
   pub options: DatabaseOptions,
}

/// A resolver function: `id -> Option<TenantOpen>`. Consulted by
/// [`LifecycleManager::resolve`](crate::lifecycle::LifecycleManager::resolve)
/// when `get(id)` misses.
pub type TenantResolver = Arc<dyn Fn(&str) -> Option<TenantOpen> + Send + Sync>;

/// Validate a tenant ID: length 1..255, matching
/// `^[A-Za-z0-9][A-Za-z0-9_-]*$`.
pub fn is_valid_tenant_id(id: &str) -> bool {
   !id.is_empty() && id.len() <= 255 && TENANT_ID_RE.is_match(id)
}

/// Join `base` with `id + ext`, rejecting IDs that fail validation or whose
/// resulting filename exceeds 255 characters.
pub fn tenant_path(base: &std::path::Path, id: &str, ext: &str) -> Option<PathBuf> {
   if !is_valid_tenant_id(id) {
      return None;
   }
   let filename = format!("{id}{ext}");
   if filename.len() > 255 {
      return None;
   }
   Some(base.join(filename))
}

/// Construction parameters for [`create_tenant_resolver`].
#[derive(Clone)]
pub struct TenantResolverConfig {
   pub base_path: PathBuf,
   pub extension: String,
   pub default_options: DatabaseOptions,
}

impl TenantResolverConfig {
   pub fn new(base_path: impl Into<PathBuf>) -> Self {
      Self {
         base_path: base_path.into(),
         extension: ".db".to_string(),
         default_options: DatabaseOptions::default(),
      }
   }

   pub fn with_extension(mut self, ext: impl Into<String>) -> Self {
      self.extension = ext.into();
      self
   }

   pub fn with_default_options(mut self, options: DatabaseOptions) -> Self {
      self.default_options = options;
      self
   }
}

/// Build a resolver closure suitable for
/// [`LifecycleManagerConfig::resolver`](crate::lifecycle::LifecycleManagerConfig).
pub fn create_tenant_resolver(config: TenantResolverConfig) -> TenantResolver {
   Arc::new(move |id: &str| {
      let path = tenant_path(&config.base_path, id, &config.extension)?;
      Some(TenantOpen {
         path,
         options: config.default_options.clone(),
      })
   })
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn rejects_path_traversal() {
      let resolver = create_tenant_resolver(TenantResolverConfig::new("/data"));
      assert!(resolver("../etc/passwd").is_none());
      assert!(resolver("a/b").is_none());
   }

   #[test]
   fn accepts_a_plain_id() {
      let resolver = create_tenant_resolver(TenantResolverConfig::new("/data"));
      let open = resolver("tenant1").unwrap();
      assert_eq!(open.path, std::path::PathBuf::from("/data/tenant1.db"));
   }

   #[test]
   fn rejects_overlong_filenames() {
      let id = "a".repeat(253);
      assert!(is_valid_tenant_id(&id));
      assert!(tenant_path(std::path::Path::new("/data"), &id, ".db").is_none());
   }

   #[test]
   fn rejects_empty_and_leading_punctuation() {
      assert!(!is_valid_tenant_id(""));
      assert!(!is_valid_tenant_id("_leading"));
      assert!(!is_valid_tenant_id("-leading"));
   }
}

//! Secret injection - resolves named secrets for a backend launch.
//!
//! Values flow from a [`SecretStore`] straight into the runtime's launch
//! environment. [`SecretValue`] redacts itself in `Debug` and `Display`, and
//! the injector only ever logs secret *names*.

mod stores;

pub use stores::{DirSecretStore, EnvSecretStore, InMemorySecretStore};

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::types::{Error, Result};

// =============================================================================
// Secret value
// =============================================================================

/// Opaque secret bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(Bytes);

impl SecretValue {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    /// Render for an environment variable. Non-UTF-8 payloads are
    /// base64-encoded.
    pub fn to_env_value(&self) -> String {
        match std::str::from_utf8(&self.0) {
            Ok(s) => s.to_string(),
            Err(_) => base64::engine::general_purpose::STANDARD.encode(&self.0),
        }
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretValue(<redacted {} bytes>)", self.0.len())
    }
}

impl fmt::Display for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

impl From<&str> for SecretValue {
    fn from(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

// =============================================================================
// Store capability
// =============================================================================

/// External secret store. `Ok(None)` means the secret does not exist.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SecretStore: Send + Sync + fmt::Debug {
    async fn get(&self, name: &str) -> Result<Option<SecretValue>>;
}

// =============================================================================
// Injector
// =============================================================================

/// Resolves every secret a backend needs, or none at all.
#[derive(Debug, Clone)]
pub struct SecretInjector {
    store: Arc<dyn SecretStore>,
}

impl SecretInjector {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self { store }
    }

    /// Resolve all `names`. The first missing secret aborts the launch.
    pub async fn resolve(&self, names: &BTreeSet<String>) -> Result<HashMap<String, SecretValue>> {
        let mut resolved = HashMap::with_capacity(names.len());
        for name in names {
            match self.store.get(name).await {
                Ok(Some(value)) => {
                    resolved.insert(name.clone(), value);
                }
                Ok(None) => {
                    tracing::warn!(secret = %name, "secret_not_found");
                    return Err(Error::secret_missing(name.clone()));
                }
                Err(e) => {
                    tracing::warn!(secret = %name, error = %e, "secret_store_error");
                    return Err(Error::secret_missing(name.clone()));
                }
            }
        }
        tracing::debug!(count = resolved.len(), "secrets_resolved");
        Ok(resolved)
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Which secret store the gateway binary builds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretSource {
    #[default]
    Env,
    Dir,
}

/// Secret store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    pub source: SecretSource,
    /// Prefix prepended to secret names when reading the environment.
    pub prefix: String,
    /// Directory holding one file per secret.
    pub dir: PathBuf,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            source: SecretSource::Env,
            prefix: String::new(),
            dir: PathBuf::from("/run/secrets"),
        }
    }
}

impl SecretsConfig {
    /// Build the configured store.
    pub fn build_store(&self) -> Arc<dyn SecretStore> {
        match self.source {
            SecretSource::Env => Arc::new(EnvSecretStore::with_prefix(self.prefix.clone())),
            SecretSource::Dir => Arc::new(DirSecretStore::new(self.dir.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_secret_value_is_redacted() {
        let value = SecretValue::from("hunter2");
        assert_eq!(format!("{}", value), "<redacted>");
        assert!(!format!("{:?}", value).contains("hunter2"));
        assert_eq!(value.expose(), b"hunter2");
    }

    #[test]
    fn test_env_value_base64_for_binary() {
        let value = SecretValue::new(vec![0xff, 0xfe]);
        assert_eq!(value.to_env_value(), "//4=");
        assert_eq!(SecretValue::from("plain").to_env_value(), "plain");
    }

    #[tokio::test]
    async fn test_resolve_all() {
        let mut store = MockSecretStore::new();
        store
            .expect_get()
            .with(eq("A"))
            .times(1)
            .returning(|_| Ok(Some(SecretValue::from("a"))));
        store
            .expect_get()
            .with(eq("B"))
            .times(1)
            .returning(|_| Ok(Some(SecretValue::from("b"))));

        let injector = SecretInjector::new(Arc::new(store));
        let resolved = injector.resolve(&names(&["A", "B"])).await.unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved["B"].expose(), b"b");
    }

    #[tokio::test]
    async fn test_missing_secret_aborts() {
        let mut store = MockSecretStore::new();
        store.expect_get().with(eq("A")).returning(|_| Ok(None));

        let injector = SecretInjector::new(Arc::new(store));
        let err = injector.resolve(&names(&["A", "B"])).await.unwrap_err();
        match err {
            Error::SecretResolutionFailed { name } => assert_eq!(name, "A"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_store_error_maps_to_resolution_failure() {
        let mut store = MockSecretStore::new();
        store
            .expect_get()
            .returning(|_| Err(Error::internal("vault sealed")));

        let injector = SecretInjector::new(Arc::new(store));
        let err = injector.resolve(&names(&["TOKEN"])).await.unwrap_err();
        assert_eq!(err.to_ipc_error_code(), "SECRET_RESOLUTION_FAILED");
    }

    #[tokio::test]
    async fn test_no_secrets_needed() {
        let store = MockSecretStore::new();
        let injector = SecretInjector::new(Arc::new(store));
        assert!(injector.resolve(&BTreeSet::new()).await.unwrap().is_empty());
    }
}

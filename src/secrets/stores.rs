//! Built-in secret stores.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;

use super::{SecretStore, SecretValue};
use crate::types::{Error, Result};

/// In-memory store, for embedding and tests.
#[derive(Debug, Default)]
pub struct InMemorySecretStore {
    secrets: RwLock<HashMap<String, SecretValue>>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, value: impl Into<SecretValue>) {
        self.secrets.write().insert(name.into(), value.into());
    }

    pub fn remove(&self, name: &str) {
        self.secrets.write().remove(name);
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn get(&self, name: &str) -> Result<Option<SecretValue>> {
        Ok(self.secrets.read().get(name).cloned())
    }
}

/// Reads secrets from the gateway's own environment, `<prefix><NAME>`.
#[derive(Debug, Default)]
pub struct EnvSecretStore {
    prefix: String,
}

impl EnvSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn get(&self, name: &str) -> Result<Option<SecretValue>> {
        let key = format!("{}{}", self.prefix, name);
        Ok(std::env::var_os(&key).map(|v| SecretValue::new(v.into_encoded_bytes())))
    }
}

/// One file per secret under a directory (the `/run/secrets` layout).
/// A single trailing newline is stripped.
#[derive(Debug)]
pub struct DirSecretStore {
    dir: PathBuf,
}

impl DirSecretStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl SecretStore for DirSecretStore {
    async fn get(&self, name: &str) -> Result<Option<SecretValue>> {
        if name.contains('/') || name.contains('\\') || name.starts_with('.') {
            return Err(Error::validation(format!("invalid secret name '{}'", name)));
        }
        match tokio::fs::read(self.dir.join(name)).await {
            Ok(mut bytes) => {
                if bytes.last() == Some(&b'\n') {
                    bytes.pop();
                }
                Ok(Some(SecretValue::new(bytes)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

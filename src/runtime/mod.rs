//! Backend runtime - the injected process/container capability.
//!
//! The supervisor decides *when* to launch, probe and stop backends; a
//! [`BackendRuntime`] decides *how*. Two implementations ship with the crate:
//! - [`StdioRuntime`]: local commands or `docker run -i` containers speaking
//!   JSON-RPC over stdio
//! - [`LocalRuntime`]: in-process async handlers, for embedding and tests
//!
//! Error convention for [`BackendRuntime::call`]: a dead or unreachable
//! process is `BackendUnavailable`; a tool-level error answered by a live
//! backend is `ToolFailed`.

pub mod local;
pub mod stdio;

pub use local::{handler, LocalCall, LocalHandler, LocalRuntime};
pub use stdio::StdioRuntime;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

use crate::catalog::{BackendRef, ResourceLimits};
use crate::secrets::SecretValue;
use crate::types::{InstanceId, Result};

/// Opaque reference to one launched backend process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessHandle(String);

impl ProcessHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything a runtime needs to launch one backend instance.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub instance_id: InstanceId,
    pub catalog: String,
    pub backend: BackendRef,
    /// Resolved secrets, by name. Dropped by the supervisor after spawn.
    pub env: HashMap<String, SecretValue>,
    pub resources: ResourceLimits,
    pub network: Vec<String>,
}

/// Process/container capability consumed by the supervisor.
#[async_trait]
pub trait BackendRuntime: Send + Sync + fmt::Debug {
    /// Launch a backend. Must not log `spec.env` values.
    async fn spawn(&self, spec: &LaunchSpec) -> Result<ProcessHandle>;

    /// Single health probe; the supervisor bounds it with a timeout.
    async fn health_check(&self, process: &ProcessHandle) -> bool;

    /// Forward one tool call to a running backend.
    async fn call(&self, process: &ProcessHandle, tool: &str, arguments: Value) -> Result<Value>;

    /// Stop the process and release its resources. Idempotent.
    async fn terminate(&self, process: &ProcessHandle);
}

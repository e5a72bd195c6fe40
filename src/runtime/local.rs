//! In-process runtime. Backends are async closures registered per
//! [`BackendRef`]; each spawn creates a logical process with its own
//! environment.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{BackendRuntime, LaunchSpec, ProcessHandle};
use crate::catalog::BackendRef;
use crate::types::{Error, Result};

/// A call as seen by an in-process backend.
#[derive(Debug, Clone)]
pub struct LocalCall {
    pub process: ProcessHandle,
    pub tool: String,
    pub arguments: Value,
    /// Launch environment, including injected secrets.
    pub env: Arc<HashMap<String, String>>,
}

pub type LocalHandler = Arc<dyn Fn(LocalCall) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Box an async closure into a [`LocalHandler`].
pub fn handler<F, Fut>(f: F) -> LocalHandler
where
    F: Fn(LocalCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(move |call| Box::pin(f(call)))
}

struct LocalBackend {
    handler: LocalHandler,
    healthy: bool,
    spawn_delay: Duration,
}

#[derive(Debug)]
struct LocalProcess {
    backend: BackendRef,
    env: Arc<HashMap<String, String>>,
    alive: bool,
}

/// Runtime whose backends live inside the gateway process.
#[derive(Default)]
pub struct LocalRuntime {
    backends: RwLock<HashMap<BackendRef, LocalBackend>>,
    processes: DashMap<ProcessHandle, LocalProcess>,
    next_id: AtomicU64,
    spawns: AtomicUsize,
    terminations: AtomicUsize,
}

impl std::fmt::Debug for LocalRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRuntime")
            .field("backends", &self.backends.read().len())
            .field("processes", &self.processes.len())
            .field("spawns", &self.spawn_count())
            .finish()
    }
}

impl LocalRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler implementing a backend.
    pub fn register(&self, backend: BackendRef, handler: LocalHandler) {
        self.backends.write().insert(
            backend,
            LocalBackend {
                handler,
                healthy: true,
                spawn_delay: Duration::ZERO,
            },
        );
    }

    /// Make health probes for every process of `backend` pass or fail.
    pub fn set_healthy(&self, backend: &BackendRef, healthy: bool) {
        if let Some(b) = self.backends.write().get_mut(backend) {
            b.healthy = healthy;
        }
    }

    /// Delay every spawn of `backend`, modelling a slow container start.
    pub fn set_spawn_delay(&self, backend: &BackendRef, delay: Duration) {
        if let Some(b) = self.backends.write().get_mut(backend) {
            b.spawn_delay = delay;
        }
    }

    /// Kill a process without going through the supervisor.
    pub fn kill(&self, process: &ProcessHandle) {
        if let Some(mut p) = self.processes.get_mut(process) {
            p.alive = false;
        }
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn terminate_count(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    /// Processes spawned and not yet terminated.
    pub fn live_processes(&self) -> usize {
        self.processes.iter().filter(|p| p.alive).count()
    }
}

#[async_trait]
impl BackendRuntime for LocalRuntime {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<ProcessHandle> {
        let delay = self
            .backends
            .read()
            .get(&spec.backend)
            .map(|b| b.spawn_delay)
            .ok_or_else(|| {
                Error::backend_unavailable(format!("no local backend for {}", spec.backend))
            })?;

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.spawns.fetch_add(1, Ordering::SeqCst);
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let process = ProcessHandle::new(format!("local-{}", n));

        let env = spec
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.to_env_value()))
            .collect();
        self.processes.insert(
            process.clone(),
            LocalProcess {
                backend: spec.backend.clone(),
                env: Arc::new(env),
                alive: true,
            },
        );
        tracing::debug!(process = %process, backend = %spec.backend, "local_process_spawned");
        Ok(process)
    }

    async fn health_check(&self, process: &ProcessHandle) -> bool {
        let backend = match self.processes.get(process) {
            Some(p) if p.alive => p.backend.clone(),
            _ => return false,
        };
        self.backends
            .read()
            .get(&backend)
            .map(|b| b.healthy)
            .unwrap_or(false)
    }

    async fn call(&self, process: &ProcessHandle, tool: &str, arguments: Value) -> Result<Value> {
        // Copy what we need out of the map guards before awaiting.
        let (backend, env) = match self.processes.get(process) {
            Some(p) if p.alive => (p.backend.clone(), p.env.clone()),
            _ => {
                return Err(Error::backend_unavailable(format!(
                    "process {} is not running",
                    process
                )))
            }
        };
        let handler = self
            .backends
            .read()
            .get(&backend)
            .map(|b| b.handler.clone())
            .ok_or_else(|| Error::backend_unavailable(format!("no local backend for {}", backend)))?;

        handler(LocalCall {
            process: process.clone(),
            tool: tool.to_string(),
            arguments,
            env,
        })
        .await
    }

    async fn terminate(&self, process: &ProcessHandle) {
        if self.processes.remove(process).is_some() {
            self.terminations.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(process = %process, "local_process_terminated");
        }
    }
}

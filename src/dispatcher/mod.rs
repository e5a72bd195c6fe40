//! Request router / dispatcher.
//!
//! `(catalog, tool, arguments, deadline)` → registry lookup →
//! `ensure_running` → forward → release → result. The deadline covers the
//! cold start and the forward together.

mod stats;

pub use stats::{ToolStats, ToolStatsReport};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::catalog::{CatalogRegistry, ToolDescriptor};
use crate::supervisor::Supervisor;
use crate::types::{Error, InstanceId, RequestId, Result};

/// Request deadlines and statistics window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Deadline applied when the caller gives none (default: 60s).
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,
    /// Caller deadlines are clamped to this (default: 10m).
    #[serde(with = "humantime_serde")]
    pub max_timeout: Duration,
    /// Calls kept per tool for statistics (default: 100).
    pub stats_window: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(60),
            max_timeout: Duration::from_secs(600),
            stats_window: 100,
        }
    }
}

/// One in-flight client request.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub request_id: RequestId,
    pub catalog: String,
    pub tool: String,
    pub arguments: Value,
    pub submitted_at: DateTime<Utc>,
    pub deadline: Option<Instant>,
}

/// Outcome of a successful dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    pub request_id: RequestId,
    pub instance_id: InstanceId,
    pub catalog: String,
    pub tool: String,
    /// Backend result payload, passed through untouched.
    pub content: Value,
    /// The backend flagged its own result as an error (`isError`).
    pub is_error: bool,
    pub elapsed_ms: u64,
}

#[derive(Debug)]
pub struct Dispatcher {
    registry: Arc<CatalogRegistry>,
    supervisor: Supervisor,
    config: DispatchConfig,
    stats: Mutex<ToolStats>,
}

impl Dispatcher {
    pub fn new(registry: Arc<CatalogRegistry>, supervisor: Supervisor, config: DispatchConfig) -> Self {
        let stats = ToolStats::new(config.stats_window);
        Self {
            registry,
            supervisor,
            config,
            stats: Mutex::new(stats),
        }
    }

    pub fn registry(&self) -> &Arc<CatalogRegistry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Per-catalog invocation surface.
    pub fn endpoint(self: &Arc<Self>, catalog: impl Into<String>) -> CatalogEndpoint {
        CatalogEndpoint {
            catalog: catalog.into(),
            dispatcher: self.clone(),
        }
    }

    /// Caller deadline, defaulted and clamped.
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        match requested {
            Some(d) if !d.is_zero() => d.min(self.config.max_timeout),
            _ => self.config.default_timeout,
        }
    }

    /// Route one tool call.
    pub async fn dispatch(
        &self,
        catalog: &str,
        tool: &str,
        arguments: Value,
        deadline: Option<Duration>,
    ) -> Result<ToolResult> {
        let timeout = self.effective_timeout(deadline);
        let pending = PendingRequest {
            request_id: RequestId::new(),
            catalog: catalog.to_string(),
            tool: tool.to_string(),
            arguments,
            submitted_at: Utc::now(),
            deadline: Some(Instant::now() + timeout),
        };
        self.execute(pending).await
    }

    /// Run a prepared request to completion.
    pub async fn execute(&self, pending: PendingRequest) -> Result<ToolResult> {
        let started = Instant::now();
        let PendingRequest {
            request_id,
            catalog,
            tool,
            arguments,
            deadline,
            ..
        } = pending;

        let (_, descriptor) = self.registry.tool(&catalog, &tool)?;

        let forward = self.forward(&catalog, &descriptor, arguments);
        let outcome = match deadline {
            Some(at) => match tokio::time::timeout_at(at, forward).await {
                Ok(result) => result,
                Err(_) => Err(Error::timeout(format!(
                    "{}/{} exceeded its deadline",
                    catalog, tool
                ))),
            },
            None => forward.await,
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let outcome = outcome.map(|(instance_id, content)| ToolResult {
            is_error: content
                .get("isError")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            request_id: request_id.clone(),
            instance_id,
            catalog: catalog.clone(),
            tool: tool.clone(),
            content,
            elapsed_ms,
        });

        match &outcome {
            Ok(result) => {
                let code = result.is_error.then_some("TOOL_FAILED");
                self.stats
                    .lock()
                    .record(&catalog, &tool, !result.is_error, elapsed_ms, code);
                tracing::debug!(
                    request_id = %request_id,
                    catalog = %catalog,
                    tool = %tool,
                    instance_id = %result.instance_id,
                    elapsed_ms,
                    "tool_call_completed"
                );
            }
            Err(e) => {
                let code = e.to_ipc_error_code();
                self.stats
                    .lock()
                    .record(&catalog, &tool, false, elapsed_ms, Some(code));
                tracing::warn!(
                    request_id = %request_id,
                    catalog = %catalog,
                    tool = %tool,
                    code,
                    error = %e,
                    elapsed_ms,
                    "tool_call_failed"
                );
            }
        }
        outcome
    }

    /// Statistics reports, optionally filtered.
    pub fn tool_stats(&self, catalog: Option<&str>, tool: Option<&str>) -> Vec<ToolStatsReport> {
        self.stats.lock().reports(catalog, tool)
    }

    /// Acquire, call, release. Dropping this future mid-way still releases
    /// the handle exactly once.
    async fn forward(
        &self,
        catalog: &str,
        tool: &ToolDescriptor,
        arguments: Value,
    ) -> Result<(InstanceId, Value)> {
        let handle = self.supervisor.ensure_running(catalog, tool).await?;
        let result = handle.call(&tool.name, arguments).await;

        if let Err(Error::BackendUnavailable(reason)) = &result {
            self.supervisor.report_crash(&handle, reason);
        }
        self.supervisor.release_handle(&handle);

        result.map(|content| (handle.instance_id().clone(), content))
    }
}

/// Invocation surface of one catalog.
#[derive(Debug, Clone)]
pub struct CatalogEndpoint {
    catalog: String,
    dispatcher: Arc<Dispatcher>,
}

impl CatalogEndpoint {
    pub fn name(&self) -> &str {
        &self.catalog
    }

    pub async fn call(
        &self,
        tool: &str,
        arguments: Value,
        deadline: Option<Duration>,
    ) -> Result<ToolResult> {
        self.dispatcher
            .dispatch(&self.catalog, tool, arguments, deadline)
            .await
    }

    /// Tools of this catalog in declaration order, from the current snapshot.
    pub fn tools(&self) -> Result<Vec<ToolDescriptor>> {
        self.dispatcher
            .registry
            .lookup(&self.catalog)
            .map(|c| c.tools.clone())
            .ok_or_else(|| Error::unknown_catalog(self.catalog.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{BackendRef, CatalogDescriptor};
    use crate::runtime::{handler, LocalCall, LocalRuntime};
    use crate::secrets::{InMemorySecretStore, SecretInjector};
    use crate::supervisor::SupervisorConfig;
    use serde_json::json;

    fn dispatcher() -> (Arc<Dispatcher>, Arc<LocalRuntime>) {
        let runtime = Arc::new(LocalRuntime::new());
        runtime.register(
            BackendRef::image("tools/docker"),
            handler(|call: LocalCall| async move {
                match call.tool.as_str() {
                    "docker-ps" => Ok(json!({ "content": [{ "type": "text", "text": "[]" }] })),
                    "slow" => {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok(json!({}))
                    }
                    "broken" => Ok(json!({ "isError": true, "content": [] })),
                    other => Err(Error::tool_failed(format!("no such tool {}", other))),
                }
            }),
        );
        let backend = BackendRef::image("tools/docker");
        let registry = Arc::new(
            CatalogRegistry::from_descriptors(vec![CatalogDescriptor::new(
                "infra",
                vec![
                    ToolDescriptor::new("docker-ps", backend.clone()),
                    ToolDescriptor::new("slow", backend.clone()),
                    ToolDescriptor::new("broken", backend.clone()),
                    ToolDescriptor::new("rejected", backend),
                ],
            )])
            .unwrap(),
        );
        let supervisor = Supervisor::new(
            runtime.clone(),
            SecretInjector::new(Arc::new(InMemorySecretStore::new())),
            SupervisorConfig::default(),
        );
        (
            Arc::new(Dispatcher::new(registry, supervisor, DispatchConfig::default())),
            runtime,
        )
    }

    #[test]
    fn test_effective_timeout() {
        let (d, _) = dispatcher();
        assert_eq!(d.effective_timeout(None), Duration::from_secs(60));
        assert_eq!(d.effective_timeout(Some(Duration::ZERO)), Duration::from_secs(60));
        assert_eq!(d.effective_timeout(Some(Duration::from_secs(5))), Duration::from_secs(5));
        assert_eq!(
            d.effective_timeout(Some(Duration::from_secs(3600))),
            Duration::from_secs(600)
        );
    }

    #[tokio::test]
    async fn test_unknown_catalog_and_tool() {
        let (d, runtime) = dispatcher();
        let err = d.dispatch("nope", "docker-ps", json!({}), None).await.unwrap_err();
        assert!(matches!(err, Error::UnknownCatalog(_)));
        let err = d.dispatch("infra", "nope", json!({}), None).await.unwrap_err();
        assert!(matches!(err, Error::UnknownTool { .. }));
        assert_eq!(runtime.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_reuses_instance() {
        let (d, runtime) = dispatcher();
        let first = d.dispatch("infra", "docker-ps", json!({}), None).await.unwrap();
        let second = d.dispatch("infra", "docker-ps", json!({}), None).await.unwrap();
        assert_eq!(first.instance_id, second.instance_id);
        assert_ne!(first.request_id, second.request_id);
        assert!(!first.is_error);
        assert_eq!(runtime.spawn_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_leaves_instance_running() {
        let (d, runtime) = dispatcher();
        let err = d
            .dispatch("infra", "slow", json!({}), Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        let instances = d.supervisor().instances();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].in_flight, 0);
        assert_eq!(runtime.live_processes(), 1);
    }

    #[tokio::test]
    async fn test_tool_error_keeps_instance() {
        let (d, _) = dispatcher();
        let err = d.dispatch("infra", "rejected", json!({}), None).await.unwrap_err();
        assert!(matches!(err, Error::ToolFailed(_)));

        let flagged = d.dispatch("infra", "broken", json!({}), None).await.unwrap();
        assert!(flagged.is_error);
        assert_eq!(d.supervisor().instances().len(), 1);

        let stats = d.tool_stats(Some("infra"), Some("rejected"));
        assert_eq!(stats[0].error_patterns, vec![("TOOL_FAILED".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_endpoint_lists_tools_in_order() {
        let (d, _) = dispatcher();
        let endpoint = d.endpoint("infra");
        let names: Vec<String> = endpoint.tools().unwrap().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["docker-ps", "slow", "broken", "rejected"]);

        let result = endpoint.call("docker-ps", json!({}), None).await.unwrap();
        assert_eq!(result.catalog, "infra");

        assert!(matches!(
            d.endpoint("ghost").tools().unwrap_err(),
            Error::UnknownCatalog(_)
        ));
    }
}

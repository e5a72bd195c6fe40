//! Backend process supervisor.
//!
//! Owns every [`BackendInstance`]: launches on demand, probes health, hands
//! out [`InstanceHandle`]s, tears down drained or crashed instances.
//!
//! Pools are keyed by catalog and the tool's full launch profile (backend,
//! limits, secrets, network, concurrency), so an instance only ever serves
//! tools it was launched for. The only serialisation point for launches is a
//! per-pool start-lock; acquiring an existing instance takes a short
//! per-instance lock and nothing else.

mod instance;

pub use instance::{BackendInstance, InstanceSnapshot, InstanceState, Release};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::Instrument;

use crate::catalog::{LaunchProfile, ToolDescriptor};
use crate::runtime::{BackendRuntime, LaunchSpec};
use crate::secrets::SecretInjector;
use crate::types::{Error, InstanceId, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Launch and health probe policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Launch attempts before `BackendUnavailable` (default: 3).
    pub start_attempts: u32,
    /// Delay before the second launch attempt, doubled after each failure.
    #[serde(with = "humantime_serde")]
    pub start_backoff: Duration,
    /// Bound on a single health probe.
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    /// Probes per launch attempt before giving up on the process.
    pub probe_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub probe_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub probe_backoff_max: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            start_attempts: 3,
            start_backoff: Duration::from_millis(500),
            probe_timeout: Duration::from_secs(5),
            probe_attempts: 10,
            probe_backoff: Duration::from_millis(100),
            probe_backoff_max: Duration::from_secs(2),
        }
    }
}

// =============================================================================
// Pool key
// =============================================================================

/// Interchangeable instances: same catalog, same launch profile.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub catalog: String,
    pub profile: LaunchProfile,
}

impl PoolKey {
    pub fn new(catalog: impl Into<String>, tool: &ToolDescriptor) -> Self {
        Self {
            catalog: catalog.into(),
            profile: tool.launch_profile(),
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

/// A caller's claim on one unit of an instance's capacity.
///
/// Released exactly once: explicitly through [`Supervisor::release_handle`]
/// or on drop, whichever comes first.
#[derive(Debug)]
pub struct InstanceHandle {
    instance: Arc<BackendInstance>,
    supervisor: Supervisor,
    released: AtomicBool,
}

impl InstanceHandle {
    fn new(instance: Arc<BackendInstance>, supervisor: Supervisor) -> Self {
        Self {
            instance,
            supervisor,
            released: AtomicBool::new(false),
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        self.instance.id()
    }

    pub fn instance(&self) -> &Arc<BackendInstance> {
        &self.instance
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Forward one tool call to the instance.
    ///
    /// Single-concurrency instances serialise here. Returns
    /// `BackendUnavailable` as soon as the instance crashes, even mid-call.
    pub async fn call(&self, tool: &str, arguments: Value) -> Result<Value> {
        let abort = self.instance.abort_token();
        if abort.is_cancelled() {
            return Err(Error::backend_unavailable(format!(
                "instance {} is no longer running",
                self.instance.id()
            )));
        }

        let forward = async {
            let _serial = match self.instance.call_lock() {
                Some(lock) => Some(lock.lock().await),
                None => None,
            };
            self.supervisor
                .runtime()
                .call(self.instance.process(), tool, arguments)
                .await
        };

        tokio::select! {
            biased;
            _ = abort.cancelled() => Err(Error::backend_unavailable(format!(
                "instance {} crashed",
                self.instance.id()
            ))),
            result = forward => result,
        }
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.instance.release() == Release::Finalize {
            self.supervisor.finalize(&self.instance);
        }
    }
}

impl Drop for InstanceHandle {
    fn drop(&mut self) {
        self.release();
    }
}

// =============================================================================
// Supervisor
// =============================================================================

#[derive(Debug)]
struct SupervisorInner {
    config: SupervisorConfig,
    runtime: Arc<dyn BackendRuntime>,
    injector: SecretInjector,
    pools: DashMap<PoolKey, Vec<Arc<BackendInstance>>>,
    start_locks: DashMap<PoolKey, Arc<Mutex<()>>>,
}

/// Cheap to clone; all clones share the same pools.
#[derive(Debug, Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    pub fn new(
        runtime: Arc<dyn BackendRuntime>,
        injector: SecretInjector,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                config,
                runtime,
                injector,
                pools: DashMap::new(),
                start_locks: DashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub(crate) fn runtime(&self) -> &Arc<dyn BackendRuntime> {
        &self.inner.runtime
    }

    /// Return a handle to a healthy instance of the tool's pool, launching
    /// one if none has capacity.
    pub async fn ensure_running(
        &self,
        catalog: &str,
        tool: &ToolDescriptor,
    ) -> Result<InstanceHandle> {
        let key = PoolKey::new(catalog, tool);
        if let Some(handle) = self.try_acquire(&key) {
            return Ok(handle);
        }

        let start_lock = self
            .inner
            .start_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = start_lock.lock_owned().await;

        // Another caller may have launched while we waited.
        if let Some(handle) = self.try_acquire(&key) {
            return Ok(handle);
        }

        // The launch runs detached and owns the start-lock, so a caller that
        // gives up mid-start never leaves a half-launched instance behind. If
        // nobody is waiting, the handle drops and the instance sits idle.
        let supervisor = self.clone();
        let launch = tokio::spawn(
            async move {
                let launched = supervisor.launch(&key).await;
                drop(guard);
                supervisor.prune_start_lock(&key);
                Ok::<_, Error>(InstanceHandle::new(launched?, supervisor))
            }
            .in_current_span(),
        );
        launch
            .await
            .map_err(|e| Error::internal(format!("launch task failed: {}", e)))?
    }

    /// Release a handle. Repeated calls (and the later drop) are no-ops.
    pub fn release_handle(&self, handle: &InstanceHandle) {
        handle.release();
    }

    /// Mark the handle's instance crashed and tear it down. In-flight
    /// callers on the same instance observe `BackendUnavailable`.
    pub fn report_crash(&self, handle: &InstanceHandle, reason: &str) {
        let instance = handle.instance();
        if !instance.mark_crashed() {
            return;
        }
        tracing::warn!(
            instance_id = %instance.id(),
            catalog = %instance.catalog(),
            backend = %instance.backend(),
            reason = %reason,
            "backend_instance_crashed"
        );
        self.remove_and_terminate(instance);
    }

    /// Admin drain: stop routing to the instance and stop it once empty.
    pub fn drain(&self, instance_id: &InstanceId) -> Result<InstanceSnapshot> {
        let instance = self
            .find(instance_id)
            .ok_or_else(|| Error::not_found(format!("instance {}", instance_id)))?;
        match instance.begin_drain() {
            Ok(()) => {
                tracing::info!(
                    instance_id = %instance_id,
                    in_flight = instance.in_flight(),
                    "backend_instance_draining"
                );
                if instance.finish_drain() == Release::Finalize {
                    self.finalize(&instance);
                }
                Ok(instance.snapshot())
            }
            Err(state) => Err(Error::state_transition(format!(
                "instance {} is {:?}, cannot drain",
                instance_id, state
            ))),
        }
    }

    /// Drain `instance` if it is idle past `idle_timeout` at `now`, then stop
    /// it. Returns whether the instance was drained.
    pub fn drain_if_idle(
        &self,
        instance: &Arc<BackendInstance>,
        idle_timeout: Duration,
        now: Instant,
    ) -> bool {
        if !instance.drain_if_idle(idle_timeout, now) {
            return false;
        }
        tracing::info!(
            instance_id = %instance.id(),
            catalog = %instance.catalog(),
            backend = %instance.backend(),
            "backend_instance_idle_drained"
        );
        if instance.finish_drain() == Release::Finalize {
            self.finalize(instance);
        }
        true
    }

    /// Launch an instance ahead of the first call and leave it idle.
    pub async fn prewarm(&self, catalog: &str, tool: &ToolDescriptor) -> Result<InstanceId> {
        let handle = self.ensure_running(catalog, tool).await?;
        let id = handle.instance_id().clone();
        self.release_handle(&handle);
        Ok(id)
    }

    /// Every instance currently tracked, in no particular order.
    pub fn live_instances(&self) -> Vec<Arc<BackendInstance>> {
        self.inner
            .pools
            .iter()
            .flat_map(|pool| pool.value().clone())
            .collect()
    }

    /// Snapshot listing for admin surfaces, oldest first.
    pub fn instances(&self) -> Vec<InstanceSnapshot> {
        let mut list: Vec<InstanceSnapshot> =
            self.live_instances().iter().map(|i| i.snapshot()).collect();
        list.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        list
    }

    pub fn instance(&self, instance_id: &InstanceId) -> Option<InstanceSnapshot> {
        self.find(instance_id).map(|i| i.snapshot())
    }

    /// Stop and terminate every instance, in-flight calls included.
    pub async fn shutdown(&self) {
        let instances = self.live_instances();
        self.inner.pools.clear();
        for instance in &instances {
            if instance.force_stop() {
                self.inner.runtime.terminate(instance.process()).await;
            }
        }
        tracing::info!(stopped = instances.len(), "supervisor_shutdown_completed");
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn try_acquire(&self, key: &PoolKey) -> Option<InstanceHandle> {
        let pool = self.inner.pools.get(key)?;
        let instance = pool.iter().find(|i| i.try_acquire())?.clone();
        drop(pool);
        Some(InstanceHandle::new(instance, self.clone()))
    }

    fn find(&self, instance_id: &InstanceId) -> Option<Arc<BackendInstance>> {
        self.inner
            .pools
            .iter()
            .find_map(|pool| pool.value().iter().find(|i| i.id() == instance_id).cloned())
    }

    /// Launch with retries. Caller holds the pool's start-lock.
    async fn launch(&self, key: &PoolKey) -> Result<Arc<BackendInstance>> {
        let config = &self.inner.config;
        let attempts = config.start_attempts.max(1);
        let mut backoff = config.start_backoff;
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.launch_once(key).await {
                Ok(instance) => return Ok(instance),
                Err(e @ Error::SecretResolutionFailed { .. }) => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        catalog = %key.catalog,
                        backend = %key.profile.backend,
                        attempt,
                        attempts,
                        error = %e,
                        "backend_launch_failed"
                    );
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(backoff).await;
                        backoff = backoff.saturating_mul(2);
                    }
                }
            }
        }

        Err(Error::backend_unavailable(format!(
            "{} did not become healthy after {} attempt(s): {}",
            key.profile.backend,
            attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    async fn launch_once(&self, key: &PoolKey) -> Result<Arc<BackendInstance>> {
        let profile = &key.profile;
        let env = self.inner.injector.resolve(&profile.secrets).await?;
        let spec = LaunchSpec {
            instance_id: InstanceId::new(),
            catalog: key.catalog.clone(),
            backend: profile.backend.clone(),
            env,
            resources: profile.resources.clone(),
            network: profile.network.clone(),
        };

        let process = self.inner.runtime.spawn(&spec).await?;
        let instance_id = spec.instance_id.clone();
        drop(spec);

        let instance = Arc::new(BackendInstance::new(instance_id, key.clone(), process));
        self.inner
            .pools
            .entry(key.clone())
            .or_default()
            .push(instance.clone());

        if self.probe(&instance).await && instance.promote_and_acquire() {
            tracing::info!(
                instance_id = %instance.id(),
                catalog = %key.catalog,
                backend = %profile.backend,
                "backend_instance_healthy"
            );
            return Ok(instance);
        }

        instance.mark_crashed();
        self.remove_and_terminate(&instance);
        Err(Error::backend_unavailable(format!(
            "instance {} failed health probe",
            instance.id()
        )))
    }

    /// Bounded probe loop: fixed per-probe timeout, exponential backoff.
    async fn probe(&self, instance: &BackendInstance) -> bool {
        let config = &self.inner.config;
        let mut backoff = config.probe_backoff;
        for attempt in 1..=config.probe_attempts.max(1) {
            let probe = self.inner.runtime.health_check(instance.process());
            match tokio::time::timeout(config.probe_timeout, probe).await {
                Ok(true) => return true,
                Ok(false) => {
                    tracing::debug!(instance_id = %instance.id(), attempt, "health_probe_failed")
                }
                Err(_) => {
                    tracing::debug!(instance_id = %instance.id(), attempt, "health_probe_timed_out")
                }
            }
            if instance.state().is_terminal() {
                return false;
            }
            tokio::time::sleep(backoff).await;
            backoff = backoff.saturating_mul(2).min(config.probe_backoff_max);
        }
        false
    }

    fn remove_from_pool(&self, instance: &BackendInstance) {
        let key = instance.pool();
        if let Some(mut pool) = self.inner.pools.get_mut(key) {
            pool.retain(|i| i.id() != instance.id());
        }
        self.inner.pools.remove_if(key, |_, pool| pool.is_empty());
        self.prune_start_lock(key);
    }

    /// Forget the start-lock of an empty pool nobody is waiting on. Waiters
    /// and the launching task each hold a clone of the lock.
    fn prune_start_lock(&self, key: &PoolKey) {
        if !self.inner.pools.contains_key(key) {
            self.inner
                .start_locks
                .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        }
    }

    /// Tear down an instance that just reached `Stopped`.
    fn finalize(&self, instance: &Arc<BackendInstance>) {
        tracing::info!(
            instance_id = %instance.id(),
            catalog = %instance.catalog(),
            calls_served = instance.calls_served(),
            "backend_instance_stopped"
        );
        self.remove_and_terminate(instance);
    }

    fn remove_and_terminate(&self, instance: &Arc<BackendInstance>) {
        self.remove_from_pool(instance);
        let runtime = self.inner.runtime.clone();
        let process = instance.process().clone();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    runtime.terminate(&process).await;
                });
            }
            Err(_) => {
                tracing::warn!(process = %process, "terminate_skipped_no_runtime");
            }
        }
    }
}

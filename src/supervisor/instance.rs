//! Backend instance state and in-flight accounting.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::PoolKey;
use crate::catalog::{BackendRef, ConcurrencyModel};
use crate::runtime::ProcessHandle;
use crate::types::InstanceId;

// =============================================================================
// State machine
// =============================================================================

/// Lifecycle of one backend process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Starting,
    Healthy,
    Draining,
    Stopped,
    Crashed,
}

impl InstanceState {
    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceState::Stopped | InstanceState::Crashed)
    }

    /// Check if transition is valid.
    pub fn can_transition_to(self, to: InstanceState) -> bool {
        match (self, to) {
            (InstanceState::Starting, InstanceState::Healthy) => true,
            (InstanceState::Starting, InstanceState::Crashed) => true,
            (InstanceState::Healthy, InstanceState::Draining) => true,
            (InstanceState::Healthy, InstanceState::Crashed) => true,
            (InstanceState::Draining, InstanceState::Stopped) => true,
            (InstanceState::Draining, InstanceState::Crashed) => true,
            _ => false,
        }
    }
}

// =============================================================================
// Instance
// =============================================================================

#[derive(Debug)]
struct InstanceInner {
    state: InstanceState,
    in_flight: u32,
    last_activity: Instant,
}

/// Outcome of giving back one unit of in-flight capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Still serving, or already terminal.
    Kept,
    /// Draining instance with nothing left in flight; it is now `Stopped`
    /// and must be torn down.
    Finalize,
}

/// One running (or starting) backend process owned by the supervisor.
#[derive(Debug)]
pub struct BackendInstance {
    id: InstanceId,
    pool: PoolKey,
    process: ProcessHandle,
    max_in_flight: Option<u32>,
    started_at: DateTime<Utc>,
    inner: Mutex<InstanceInner>,
    calls_served: AtomicU64,
    /// Cancelled when the instance crashes or is force-stopped.
    abort: CancellationToken,
    /// Present for single-concurrency backends.
    call_lock: Option<tokio::sync::Mutex<()>>,
}

impl BackendInstance {
    pub fn new(id: InstanceId, pool: PoolKey, process: ProcessHandle) -> Self {
        let max_in_flight = pool.profile.resources.max_in_flight;
        let concurrency = pool.profile.concurrency;
        Self {
            id,
            pool,
            process,
            max_in_flight,
            started_at: Utc::now(),
            inner: Mutex::new(InstanceInner {
                state: InstanceState::Starting,
                in_flight: 0,
                last_activity: Instant::now(),
            }),
            calls_served: AtomicU64::new(0),
            abort: CancellationToken::new(),
            call_lock: match concurrency {
                ConcurrencyModel::Single => Some(tokio::sync::Mutex::new(())),
                ConcurrencyModel::Multi => None,
            },
        }
    }

    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn catalog(&self) -> &str {
        &self.pool.catalog
    }

    pub fn backend(&self) -> &BackendRef {
        &self.pool.profile.backend
    }

    pub fn pool(&self) -> &PoolKey {
        &self.pool
    }

    pub fn process(&self) -> &ProcessHandle {
        &self.process
    }

    pub fn state(&self) -> InstanceState {
        self.inner.lock().state
    }

    pub fn in_flight(&self) -> u32 {
        self.inner.lock().in_flight
    }

    pub fn last_activity(&self) -> Instant {
        self.inner.lock().last_activity
    }

    pub fn calls_served(&self) -> u64 {
        self.calls_served.load(Ordering::Relaxed)
    }

    pub(crate) fn abort_token(&self) -> &CancellationToken {
        &self.abort
    }

    pub(crate) fn call_lock(&self) -> Option<&tokio::sync::Mutex<()>> {
        self.call_lock.as_ref()
    }

    fn has_capacity(&self, in_flight: u32) -> bool {
        match self.max_in_flight {
            Some(max) => in_flight < max.max(1),
            None => true,
        }
    }

    /// Take one unit of capacity if the instance is `Healthy` and not full.
    /// The state check and the increment happen under the same lock.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != InstanceState::Healthy || !self.has_capacity(inner.in_flight) {
            return false;
        }
        inner.in_flight += 1;
        true
    }

    /// Give back one unit of capacity and record activity.
    pub fn release(&self) -> Release {
        let mut inner = self.inner.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
        inner.last_activity = Instant::now();
        self.calls_served.fetch_add(1, Ordering::Relaxed);
        if inner.state == InstanceState::Draining && inner.in_flight == 0 {
            inner.state = InstanceState::Stopped;
            return Release::Finalize;
        }
        Release::Kept
    }

    /// `Starting -> Healthy`, handing the first unit of capacity to the
    /// launching caller so nobody else can fill the instance first.
    pub(crate) fn promote_and_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        if !inner.state.can_transition_to(InstanceState::Healthy) {
            return false;
        }
        inner.state = InstanceState::Healthy;
        inner.in_flight = 1;
        inner.last_activity = Instant::now();
        true
    }

    /// `Healthy -> Draining`. Already draining is accepted as-is.
    pub(crate) fn begin_drain(&self) -> Result<(), InstanceState> {
        let mut inner = self.inner.lock();
        match inner.state {
            InstanceState::Healthy => {
                inner.state = InstanceState::Draining;
                Ok(())
            }
            InstanceState::Draining => Ok(()),
            other => Err(other),
        }
    }

    /// `Healthy -> Draining` if idle past `idle_timeout` at `now` with
    /// nothing in flight.
    pub(crate) fn drain_if_idle(&self, idle_timeout: Duration, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != InstanceState::Healthy || inner.in_flight > 0 {
            return false;
        }
        if now.saturating_duration_since(inner.last_activity) <= idle_timeout {
            return false;
        }
        inner.state = InstanceState::Draining;
        true
    }

    /// `Draining -> Stopped` once nothing is in flight. Only one caller ever
    /// sees `Finalize`: this or the last [`release`](Self::release).
    pub(crate) fn finish_drain(&self) -> Release {
        let mut inner = self.inner.lock();
        if inner.state == InstanceState::Draining && inner.in_flight == 0 {
            inner.state = InstanceState::Stopped;
            return Release::Finalize;
        }
        Release::Kept
    }

    /// Mark `Crashed` from any live state. Returns false if already terminal.
    pub(crate) fn mark_crashed(&self) -> bool {
        let mut inner = self.inner.lock();
        if !inner.state.can_transition_to(InstanceState::Crashed) {
            return false;
        }
        inner.state = InstanceState::Crashed;
        drop(inner);
        self.abort.cancel();
        true
    }

    /// Forced stop at shutdown, regardless of in-flight calls.
    pub(crate) fn force_stop(&self) -> bool {
        let mut inner = self.inner.lock();
        let next = match inner.state {
            InstanceState::Starting => InstanceState::Crashed,
            InstanceState::Healthy | InstanceState::Draining => InstanceState::Stopped,
            InstanceState::Stopped | InstanceState::Crashed => return false,
        };
        inner.state = next;
        drop(inner);
        self.abort.cancel();
        true
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        let inner = self.inner.lock();
        InstanceSnapshot {
            instance_id: self.id.to_string(),
            catalog: self.pool.catalog.clone(),
            backend: self.pool.profile.backend.to_string(),
            state: inner.state,
            in_flight: inner.in_flight,
            idle_ms: Instant::now()
                .saturating_duration_since(inner.last_activity)
                .as_millis() as u64,
            started_at: self.started_at,
            calls_served: self.calls_served.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of an instance, for admin listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub instance_id: String,
    pub catalog: String,
    pub backend: String,
    pub state: InstanceState,
    pub in_flight: u32,
    pub idle_ms: u64,
    pub started_at: DateTime<Utc>,
    pub calls_served: u64,
}

//! Idle reaper.
//!
//! Background loop that drains backend instances nobody has used for
//! `idle_timeout`. An instance with calls in flight is never touched; the
//! idle check and the state change happen under the instance's own lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::supervisor::{InstanceState, Supervisor};

/// Configuration for idle reaping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    /// How often to scan (default: 30s).
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Idle time after which an instance is drained (default: 5m).
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Statistics from one reap cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReapStats {
    /// Instances looked at
    pub examined: usize,
    /// Instances moved out of `Healthy`
    pub drained: usize,
    /// Instances that reached `Stopped` this cycle
    pub stopped: usize,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Drains idle instances on a fixed interval.
#[derive(Debug)]
pub struct IdleReaper {
    supervisor: Supervisor,
    config: ReaperConfig,
    stop_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl IdleReaper {
    pub fn new(supervisor: Supervisor, config: ReaperConfig) -> Self {
        Self {
            supervisor,
            config,
            stop_tx: None,
        }
    }

    pub fn config(&self) -> &ReaperConfig {
        &self.config
    }

    /// Start the reap loop in the background.
    /// Returns immediately; reaping runs in a spawned task.
    pub fn start(&mut self) -> tokio::task::JoinHandle<()> {
        let supervisor = self.supervisor.clone();
        let config = self.config.clone();
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel();
        self.stop_tx = Some(stop_tx);

        tokio::spawn(async move {
            let mut ticker = interval(config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::reap(&supervisor, &config);
                    }
                    _ = &mut stop_rx => {
                        tracing::info!("idle_reaper_stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Stop the reap loop.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Run a single reap cycle now.
    pub fn run_cycle(&self) -> ReapStats {
        Self::reap(&self.supervisor, &self.config)
    }

    fn reap(supervisor: &Supervisor, config: &ReaperConfig) -> ReapStats {
        let now = Instant::now();
        let mut stats = ReapStats::default();

        for instance in supervisor.live_instances() {
            stats.examined += 1;
            if supervisor.drain_if_idle(&instance, config.idle_timeout, now) {
                stats.drained += 1;
                if instance.state() == InstanceState::Stopped {
                    stats.stopped += 1;
                }
            }
        }

        tracing::debug!(
            "reap_cycle_completed: examined={}, drained={}, stopped={}",
            stats.examined,
            stats.drained,
            stats.stopped,
        );

        stats.completed_at = Some(Utc::now());
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{BackendRef, ToolDescriptor};
    use crate::runtime::{handler, LocalCall, LocalRuntime};
    use crate::secrets::{InMemorySecretStore, SecretInjector};
    use crate::supervisor::SupervisorConfig;
    use serde_json::json;
    use std::sync::Arc;

    fn setup() -> (Supervisor, Arc<LocalRuntime>, ToolDescriptor) {
        let runtime = Arc::new(LocalRuntime::new());
        let backend = BackendRef::image("tools/docker");
        runtime.register(
            backend.clone(),
            handler(|_call: LocalCall| async move { Ok(json!({})) }),
        );
        let supervisor = Supervisor::new(
            runtime.clone(),
            SecretInjector::new(Arc::new(InMemorySecretStore::new())),
            SupervisorConfig::default(),
        );
        (supervisor, runtime, ToolDescriptor::new("docker-ps", backend))
    }

    fn reaper(supervisor: &Supervisor, idle_timeout: Duration) -> IdleReaper {
        IdleReaper::new(
            supervisor.clone(),
            ReaperConfig {
                interval: Duration::from_millis(10),
                idle_timeout,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_instance_is_stopped() {
        let (supervisor, _, tool) = setup();
        supervisor.prewarm("infra", &tool).await.unwrap();
        let reaper = reaper(&supervisor, Duration::from_secs(60));

        let stats = reaper.run_cycle();
        assert_eq!(stats.examined, 1);
        assert_eq!(stats.drained, 0);

        tokio::time::advance(Duration::from_secs(61)).await;
        let stats = reaper.run_cycle();
        assert_eq!(stats.drained, 1);
        assert_eq!(stats.stopped, 1);
        assert!(supervisor.instances().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_instance_is_never_drained() {
        let (supervisor, _, tool) = setup();
        let handle = supervisor.ensure_running("infra", &tool).await.unwrap();
        let reaper = reaper(&supervisor, Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(600)).await;
        let stats = reaper.run_cycle();
        assert_eq!(stats.drained, 0);
        assert_eq!(handle.instance().state(), InstanceState::Healthy);

        // Release counts as activity, so the clock restarts.
        drop(handle);
        assert_eq!(reaper.run_cycle().drained, 0);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(reaper.run_cycle().drained, 1);
    }

    #[tokio::test]
    async fn test_reaper_start_stop() {
        let (supervisor, runtime, tool) = setup();
        supervisor.prewarm("infra", &tool).await.unwrap();

        let mut reaper = reaper(&supervisor, Duration::from_millis(20));
        let handle = reaper.start();

        tokio::time::sleep(Duration::from_millis(150)).await;
        reaper.stop();

        let _ = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("reaper should stop");
        assert!(supervisor.instances().is_empty());
        assert_eq!(runtime.terminate_count(), 1);
    }
}

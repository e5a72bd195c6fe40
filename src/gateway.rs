//! Gateway assembly - wires registry, supervisor, dispatcher and reaper.

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::catalog::{load_catalog_file, CatalogDescriptor, CatalogRegistry};
use crate::dispatcher::{CatalogEndpoint, Dispatcher};
use crate::reaper::IdleReaper;
use crate::runtime::BackendRuntime;
use crate::secrets::{SecretInjector, SecretStore};
use crate::supervisor::Supervisor;
use crate::types::{Config, Error, InstanceId, Result};

/// Outcome of one prewarm attempt.
#[derive(Debug)]
pub struct PrewarmOutcome {
    pub catalog: String,
    pub tool: String,
    pub result: Result<InstanceId>,
}

/// The running gateway.
#[derive(Debug)]
pub struct Gateway {
    config: Config,
    registry: Arc<CatalogRegistry>,
    supervisor: Supervisor,
    dispatcher: Arc<Dispatcher>,
    reaper: Mutex<IdleReaper>,
    reaper_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Gateway {
    /// Build a gateway, loading catalogs from `config.catalogs_path` if set.
    pub fn new(
        config: Config,
        runtime: Arc<dyn BackendRuntime>,
        store: Arc<dyn SecretStore>,
    ) -> Result<Self> {
        let catalogs = match &config.catalogs_path {
            Some(path) => load_catalog_file(path)?,
            None => Vec::new(),
        };
        Self::with_catalogs(config, runtime, store, catalogs)
    }

    /// Build a gateway from catalogs already in hand.
    pub fn with_catalogs(
        config: Config,
        runtime: Arc<dyn BackendRuntime>,
        store: Arc<dyn SecretStore>,
        catalogs: Vec<CatalogDescriptor>,
    ) -> Result<Self> {
        let registry = Arc::new(CatalogRegistry::from_descriptors(catalogs)?);
        let supervisor = Supervisor::new(
            runtime,
            SecretInjector::new(store),
            config.supervisor.clone(),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            supervisor.clone(),
            config.dispatch.clone(),
        ));
        let reaper = IdleReaper::new(supervisor.clone(), config.reaper.clone());

        tracing::info!(
            catalogs = registry.catalog_names().len(),
            generation = registry.generation(),
            "gateway_initialized"
        );

        Ok(Self {
            config,
            registry,
            supervisor,
            dispatcher,
            reaper: Mutex::new(reaper),
            reaper_task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CatalogRegistry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Invocation surface for one catalog. The catalog is looked up per call,
    /// so the endpoint follows reloads.
    pub fn endpoint(&self, catalog: impl Into<String>) -> CatalogEndpoint {
        self.dispatcher.endpoint(catalog)
    }

    /// Replace every catalog. On error the previous snapshot stays active.
    pub fn reload(&self, catalogs: Vec<CatalogDescriptor>) -> Result<u64> {
        self.registry.reload(catalogs)?;
        Ok(self.registry.generation())
    }

    /// Reload from `path`, or from the configured catalogs file.
    pub fn reload_from_file(&self, path: Option<&Path>) -> Result<u64> {
        let path: PathBuf = match path {
            Some(p) => p.to_path_buf(),
            None => self
                .config
                .catalogs_path
                .clone()
                .ok_or_else(|| Error::config("no catalogs file configured"))?,
        };
        let catalogs = load_catalog_file(&path)?;
        let generation = self.reload(catalogs)?;
        tracing::info!(path = %path.display(), generation, "catalogs_reloaded");
        Ok(generation)
    }

    /// Launch one instance for every tool marked `prewarm`.
    pub async fn prewarm_all(&self) -> Vec<PrewarmOutcome> {
        let snapshot = self.registry.snapshot();
        let mut outcomes = Vec::new();
        for catalog in snapshot.catalogs() {
            for tool in catalog.tools.iter().filter(|t| t.prewarm) {
                let result = self.supervisor.prewarm(&catalog.name, tool).await;
                if let Err(e) = &result {
                    tracing::warn!(
                        catalog = %catalog.name,
                        tool = %tool.name,
                        error = %e,
                        "prewarm_failed"
                    );
                }
                outcomes.push(PrewarmOutcome {
                    catalog: catalog.name.clone(),
                    tool: tool.name.clone(),
                    result,
                });
            }
        }
        outcomes
    }

    /// Start the idle reaper. Calling it twice is a no-op.
    pub fn start_reaper(&self) {
        let mut task = self.reaper_task.lock();
        if task.is_none() {
            *task = Some(self.reaper.lock().start());
        }
    }

    /// Stop reaping and tear down every backend instance.
    pub async fn shutdown(&self) {
        self.reaper.lock().stop();
        let task = self.reaper_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.supervisor.shutdown().await;
        tracing::info!("gateway_shutdown_completed");
    }
}

//! Tool gateway server - main entry point.
//!
//! Loads configuration and catalogs, prewarms flagged tools, starts the idle
//! reaper and serves the IPC surface. SIGHUP reloads catalogs; Ctrl-C drains
//! everything and exits.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tool_gateway::ipc::IpcServer;
use tool_gateway::runtime::StdioRuntime;
use tool_gateway::{Config, Gateway};

#[derive(Debug, Parser)]
#[command(name = "tool-gateway", version, about = "Dynamic per-catalog tool gateway")]
struct Cli {
    /// Gateway configuration file (YAML).
    #[arg(long, short, env = "GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Catalog definitions file; overrides `catalogs_path` from the config.
    #[arg(long, env = "GATEWAY_CATALOGS")]
    catalogs: Option<PathBuf>,

    /// Listen address; overrides `server.listen_addr`.
    #[arg(long, env = "GATEWAY_LISTEN")]
    listen: Option<String>,

    /// Docker CLI used for image backends.
    #[arg(long, default_value = "docker")]
    docker_bin: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(path) = cli.catalogs {
        config.catalogs_path = Some(path);
    }
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }

    tool_gateway::observability::init_tracing_with(&config.observability);

    let addr: SocketAddr = config.server.listen_addr.parse()?;
    let ipc_config = config.ipc.clone();
    let store = config.secrets.build_store();
    let runtime = Arc::new(StdioRuntime::with_docker_bin(cli.docker_bin));

    let gateway = Arc::new(Gateway::new(config, runtime, store)?);
    tracing::info!(
        addr = %addr,
        catalogs = ?gateway.registry().catalog_names(),
        "tool_gateway_starting"
    );

    let prewarmed = gateway.prewarm_all().await;
    let failed = prewarmed.iter().filter(|o| o.result.is_err()).count();
    if !prewarmed.is_empty() {
        tracing::info!(total = prewarmed.len(), failed, "prewarm_completed");
    }
    gateway.start_reaper();

    let server = Arc::new(IpcServer::new(gateway.clone(), addr, ipc_config));
    let serve = {
        let server = server.clone();
        tokio::spawn(async move { server.serve().await })
    };

    wait_for_shutdown(&gateway).await;

    server.shutdown();
    if let Err(e) = serve.await? {
        tracing::error!(error = %e, "ipc_server_failed");
    }
    gateway.shutdown().await;
    Ok(())
}

/// Block until Ctrl-C, reloading catalogs on every SIGHUP.
#[cfg(unix)]
async fn wait_for_shutdown(gateway: &Gateway) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "sighup_handler_unavailable");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown_requested");
                return;
            }
            _ = hangup.recv() => {
                if let Err(e) = gateway.reload_from_file(None) {
                    tracing::error!(error = %e, "catalog_reload_failed");
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_gateway: &Gateway) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown_requested");
}

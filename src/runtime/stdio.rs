//! Stdio runtime - backends as child processes speaking newline-delimited
//! JSON-RPC 2.0 on stdin/stdout.
//!
//! Command backends are executed directly. Image backends run under
//! `docker run -i --rm`; secrets are passed as `-e NAME` with the value set on
//! the docker CLI's own environment, so no secret ever appears on an argv.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use super::{BackendRuntime, LaunchSpec, ProcessHandle};
use crate::catalog::BackendRef;
use crate::types::{Error, Result};

const PROTOCOL_VERSION: &str = "2024-11-05";
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct RpcError {
    code: i64,
    message: String,
}

type RpcReply = std::result::Result<Value, RpcError>;
type PendingMap = Arc<SyncMutex<HashMap<u64, oneshot::Sender<RpcReply>>>>;

/// Removes a pending request slot when the caller stops waiting.
struct PendingGuard {
    pending: PendingMap,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

#[derive(Debug)]
struct StdioProcess {
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    pending: PendingMap,
    next_id: AtomicU64,
    initialized: AtomicBool,
    closed: Arc<AtomicBool>,
    /// Container name for image backends.
    container: Option<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl StdioProcess {
    async fn write_message(&self, message: &Value) -> Result<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(&line)
            .await
            .map_err(|e| Error::backend_unavailable(format!("write to backend failed: {}", e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| Error::backend_unavailable(format!("flush to backend failed: {}", e)))
    }

    async fn request(&self, method: &str, params: Value) -> Result<RpcReply> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::backend_unavailable("backend stdout closed"));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        let _guard = PendingGuard {
            pending: self.pending.clone(),
            id,
        };

        self.write_message(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        }))
        .await?;

        rx.await
            .map_err(|_| Error::backend_unavailable("backend exited before replying"))
    }

    async fn notify(&self, method: &str) -> Result<()> {
        self.write_message(&json!({ "jsonrpc": "2.0", "method": method }))
            .await
    }

    async fn has_exited(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return true;
        }
        matches!(self.child.lock().await.try_wait(), Ok(Some(_)) | Err(_))
    }
}

/// Runtime launching real child processes.
#[derive(Debug)]
pub struct StdioRuntime {
    docker_bin: String,
    processes: DashMap<ProcessHandle, Arc<StdioProcess>>,
}

impl Default for StdioRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl StdioRuntime {
    pub fn new() -> Self {
        Self::with_docker_bin("docker")
    }

    pub fn with_docker_bin(docker_bin: impl Into<String>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
            processes: DashMap::new(),
        }
    }

    fn get(&self, process: &ProcessHandle) -> Result<Arc<StdioProcess>> {
        self.processes
            .get(process)
            .map(|p| p.value().clone())
            .ok_or_else(|| Error::backend_unavailable(format!("unknown process {}", process)))
    }

    /// Build the command line for a launch. Secret values go on the child's
    /// environment only.
    fn build_command(&self, spec: &LaunchSpec) -> Command {
        let env: Vec<(String, String)> = spec
            .env
            .iter()
            .map(|(name, value)| (name.clone(), value.to_env_value()))
            .collect();

        let mut cmd = match &spec.backend {
            BackendRef::Image(reference) => {
                let mut cmd = Command::new(&self.docker_bin);
                cmd.args(docker_run_args(spec, reference));
                cmd
            }
            BackendRef::Command { program, args } => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
        };

        cmd.envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

fn container_name(spec: &LaunchSpec) -> String {
    format!("tgw-{}", spec.instance_id)
}

/// `docker run` arguments for an image backend. Secret names only.
fn docker_run_args(spec: &LaunchSpec, reference: &str) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-i".to_string(),
        "--rm".to_string(),
        "--init".to_string(),
        "--name".to_string(),
        container_name(spec),
        "--label".to_string(),
        format!("tool-gateway.catalog={}", spec.catalog),
    ];
    if let Some(cpus) = spec.resources.cpus {
        args.push("--cpus".to_string());
        args.push(cpus.to_string());
    }
    if let Some(memory_mb) = spec.resources.memory_mb {
        args.push("--memory".to_string());
        args.push(format!("{}m", memory_mb));
    }
    if spec.network.is_empty() {
        args.push("--network".to_string());
        args.push("none".to_string());
    }
    let mut names: Vec<&String> = spec.env.keys().collect();
    names.sort();
    for name in names {
        args.push("-e".to_string());
        args.push(name.clone());
    }
    args.push(reference.to_string());
    args
}

fn parse_reply(message: &Value) -> Option<(u64, RpcReply)> {
    let id = message.get("id")?.as_u64()?;
    if let Some(error) = message.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
        let text = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Some((id, Err(RpcError { code, message: text })));
    }
    Some((id, Ok(message.get("result").cloned().unwrap_or(Value::Null))))
}

#[async_trait]
impl BackendRuntime for StdioRuntime {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<ProcessHandle> {
        let mut child = self.build_command(spec).spawn().map_err(|e| {
            Error::backend_unavailable(format!("failed to start {}: {}", spec.backend, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::internal("child stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::internal("child stdout not captured"))?;
        let stderr = child.stderr.take();

        let handle = ProcessHandle::new(spec.instance_id.to_string());
        let pending: PendingMap = Arc::new(SyncMutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let mut tasks = Vec::with_capacity(2);
        {
            let pending = pending.clone();
            let closed = closed.clone();
            let process = handle.clone();
            tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let message: Value = match serde_json::from_str(&line) {
                        Ok(v) => v,
                        Err(_) => {
                            tracing::debug!(process = %process, "backend_non_json_stdout");
                            continue;
                        }
                    };
                    match parse_reply(&message) {
                        Some((id, reply)) => {
                            if let Some(tx) = pending.lock().remove(&id) {
                                let _ = tx.send(reply);
                            }
                        }
                        None => {
                            tracing::trace!(process = %process, "backend_notification_ignored");
                        }
                    }
                }
                closed.store(true, Ordering::SeqCst);
                // Dropping the senders wakes every waiter with an error.
                pending.lock().clear();
                tracing::debug!(process = %process, "backend_stdout_closed");
            }));
        }
        if let Some(stderr) = stderr {
            let process = handle.clone();
            tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(process = %process, stderr = %line, "backend_stderr");
                }
            }));
        }

        self.processes.insert(
            handle.clone(),
            Arc::new(StdioProcess {
                child: Mutex::new(child),
                stdin: Mutex::new(stdin),
                pending,
                next_id: AtomicU64::new(1),
                initialized: AtomicBool::new(false),
                closed,
                container: match &spec.backend {
                    BackendRef::Image(_) => Some(container_name(spec)),
                    BackendRef::Command { .. } => None,
                },
                tasks,
            }),
        );

        tracing::info!(
            process = %handle,
            backend = %spec.backend,
            catalog = %spec.catalog,
            secrets = spec.env.len(),
            "backend_process_spawned"
        );
        Ok(handle)
    }

    async fn health_check(&self, process: &ProcessHandle) -> bool {
        let Ok(proc_) = self.get(process) else {
            return false;
        };
        if proc_.has_exited().await {
            return false;
        }

        if !proc_.initialized.load(Ordering::SeqCst) {
            let params = json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": "tool-gateway",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            });
            return match proc_.request("initialize", params).await {
                Ok(Ok(_)) => {
                    if proc_.notify("notifications/initialized").await.is_err() {
                        return false;
                    }
                    proc_.initialized.store(true, Ordering::SeqCst);
                    true
                }
                _ => false,
            };
        }

        matches!(proc_.request("ping", json!({})).await, Ok(Ok(_)))
    }

    async fn call(&self, process: &ProcessHandle, tool: &str, arguments: Value) -> Result<Value> {
        let proc_ = self.get(process)?;
        let params = json!({ "name": tool, "arguments": arguments });
        match proc_.request("tools/call", params).await? {
            Ok(result) => Ok(result),
            Err(e) => Err(Error::tool_failed(format!("{} (code {})", e.message, e.code))),
        }
    }

    async fn terminate(&self, process: &ProcessHandle) {
        let Some((_, proc_)) = self.processes.remove(process) else {
            return;
        };

        // Killing the docker CLI does not stop the container itself.
        if let Some(name) = &proc_.container {
            let mut rm = Command::new(&self.docker_bin);
            rm.args(["rm", "-f", name.as_str()])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
            match tokio::time::timeout(TERMINATE_GRACE, rm.status()).await {
                Ok(Ok(status)) if status.success() => {}
                Ok(Ok(status)) => {
                    tracing::debug!(container = %name, status = %status, "container_remove_failed")
                }
                Ok(Err(e)) => tracing::debug!(container = %name, error = %e, "container_remove_failed"),
                Err(_) => tracing::warn!(container = %name, "container_remove_timeout"),
            }
        }

        let mut child = proc_.child.lock().await;
        if let Err(e) = child.start_kill() {
            tracing::debug!(process = %process, error = %e, "backend_kill_failed");
        }
        match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(process = %process, status = %status, "backend_process_exited");
            }
            Ok(Err(e)) => tracing::warn!(process = %process, error = %e, "backend_wait_failed"),
            Err(_) => tracing::warn!(process = %process, "backend_exit_timeout"),
        }
        for task in &proc_.tasks {
            task.abort();
        }
    }
}

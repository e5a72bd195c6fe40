//! TCP IPC server - accept loop and per-connection handler.
//!
//! Requests on one connection are handled in order. Concurrency comes from
//! connections: the gateway itself is shared without a global lock.

use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::gateway::Gateway;
use crate::ipc::codec::{
    decode_msgpack, encode_msgpack, read_frame, write_frame, MSG_ERROR, MSG_REQUEST, MSG_RESPONSE,
};
use crate::ipc::router::route_request;
use crate::types::IpcConfig;

/// IPC server in front of a [`Gateway`].
#[derive(Debug)]
pub struct IpcServer {
    gateway: Arc<Gateway>,
    addr: SocketAddr,
    cancel: CancellationToken,
    ipc_config: IpcConfig,
}

impl IpcServer {
    pub fn new(gateway: Arc<Gateway>, addr: SocketAddr, ipc_config: IpcConfig) -> Self {
        Self {
            gateway,
            addr,
            cancel: CancellationToken::new(),
            ipc_config,
        }
    }

    /// Bind the configured address and serve until cancelled.
    pub async fn serve(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve_listener(listener).await
    }

    /// Serve on an already-bound listener.
    pub async fn serve_listener(&self, listener: TcpListener) -> std::io::Result<()> {
        let conn_semaphore = Arc::new(Semaphore::new(self.ipc_config.max_connections));
        tracing::info!(
            addr = %listener.local_addr()?,
            max_connections = self.ipc_config.max_connections,
            "ipc_server_listening"
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("ipc_server_shutting_down");
                    break;
                }
                accept = listener.accept() => {
                    let (stream, peer) = accept?;

                    let permit = match conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            tracing::warn!(
                                peer = %peer,
                                max_connections = self.ipc_config.max_connections,
                                "ipc_connection_rejected"
                            );
                            drop(stream);
                            continue;
                        }
                    };

                    tracing::debug!(
                        peer = %peer,
                        active = self.ipc_config.max_connections - conn_semaphore.available_permits(),
                        "ipc_connection_accepted"
                    );
                    let gateway = self.gateway.clone();
                    let cancel = self.cancel.clone();
                    let ipc_config = self.ipc_config.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, gateway, cancel, ipc_config, permit).await {
                            tracing::warn!(peer = %peer, error = %e, "ipc_connection_error");
                        }
                    });
                }
            }
        }
        Ok(())
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

fn error_body(id: &str, code: &str, message: String) -> Value {
    json!({
        "id": id,
        "ok": false,
        "error": { "code": code, "message": message },
    })
}

/// Read frames → route → write responses, until EOF, timeout or shutdown.
async fn handle_connection(
    stream: TcpStream,
    gateway: Arc<Gateway>,
    cancel: CancellationToken,
    ipc_config: IpcConfig,
    _permit: OwnedSemaphorePermit, // held for connection lifetime
) -> std::io::Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let read_timeout = Duration::from_secs(ipc_config.read_timeout_secs);
    let write_timeout = Duration::from_secs(ipc_config.write_timeout_secs);

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            read = tokio::time::timeout(read_timeout, read_frame(&mut reader, ipc_config.max_frame_bytes)) => {
                match read {
                    Err(_elapsed) => {
                        tracing::debug!(timeout_secs = ipc_config.read_timeout_secs, "ipc_read_timeout");
                        break;
                    }
                    Ok(result) => match result? {
                        Some(f) => f,
                        None => break,
                    },
                }
            }
        };

        let (msg_type, payload) = frame;
        if msg_type != MSG_REQUEST {
            let reply = error_body(
                "",
                "INVALID_ARGUMENT",
                format!("Unexpected message type: 0x{:02X}", msg_type),
            );
            timed_write(&mut writer, MSG_ERROR, &encode_msgpack(&reply)?, write_timeout).await?;
            continue;
        }

        let request = match decode_msgpack(&payload) {
            Ok(v) => v,
            Err(e) => {
                let reply = error_body("", "INVALID_ARGUMENT", format!("Invalid msgpack: {}", e));
                timed_write(&mut writer, MSG_ERROR, &encode_msgpack(&reply)?, write_timeout).await?;
                continue;
            }
        };

        let request_id = request.get("id").and_then(Value::as_str).unwrap_or("");
        let service = request.get("service").and_then(Value::as_str).unwrap_or("");
        let method = request.get("method").and_then(Value::as_str).unwrap_or("");
        let body = request
            .get("body")
            .cloned()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));

        let (msg_type, reply) = match route_request(&gateway, service, method, body).await {
            Ok(body) => (
                MSG_RESPONSE,
                json!({ "id": request_id, "ok": true, "body": body }),
            ),
            Err(e) => (
                MSG_ERROR,
                error_body(request_id, e.to_ipc_error_code(), e.to_string()),
            ),
        };
        timed_write(&mut writer, msg_type, &encode_msgpack(&reply)?, write_timeout).await?;
    }

    let _ = writer.shutdown().await;
    Ok(())
}

/// Write a frame with a timeout so slow consumers cannot hold a connection.
async fn timed_write<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    msg_type: u8,
    payload: &[u8],
    timeout: Duration,
) -> std::io::Result<()> {
    tokio::time::timeout(timeout, write_frame(writer, msg_type, payload))
        .await
        .map_err(|_| {
            tracing::warn!(timeout_secs = timeout.as_secs(), "ipc_write_timeout");
            std::io::Error::new(std::io::ErrorKind::TimedOut, "write timeout")
        })?
}

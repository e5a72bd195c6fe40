//! Top-level IPC router - routes by service, delegates to handlers.
//!
//! Services:
//! - `catalog/<name>`: one invocation surface per catalog
//! - `admin`: registry and instance management

use serde_json::Value;
use std::time::Duration;

use crate::gateway::Gateway;
use crate::ipc::handlers;
use crate::types::{Error, Result};

pub const CATALOG_SERVICE_PREFIX: &str = "catalog/";
pub const ADMIN_SERVICE: &str = "admin";

/// Route an IPC request to the appropriate service handler.
pub async fn route_request(
    gateway: &Gateway,
    service: &str,
    method: &str,
    body: Value,
) -> Result<Value> {
    if let Some(catalog) = service.strip_prefix(CATALOG_SERVICE_PREFIX) {
        return handlers::endpoint::handle(gateway, catalog, method, body).await;
    }
    match service {
        ADMIN_SERVICE => handlers::admin::handle(gateway, method, body).await,
        _ => Err(Error::not_found(format!("Unknown service: {}", service))),
    }
}

// =============================================================================
// Shared helpers - used by all handler modules
// =============================================================================

pub fn str_field(body: &Value, key: &str) -> Result<String> {
    body.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| Error::validation(format!("Missing required field: {}", key)))
}

pub fn opt_str_field(body: &Value, key: &str) -> Option<String> {
    body.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// Optional millisecond duration. Present but not a non-negative integer is
/// a validation error.
pub fn opt_millis_field(body: &Value, key: &str) -> Result<Option<Duration>> {
    match body.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(|ms| Some(Duration::from_millis(ms)))
            .ok_or_else(|| Error::validation(format!("{} must be a non-negative integer", key))),
    }
}

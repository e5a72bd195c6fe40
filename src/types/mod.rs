//! Core types for the tool gateway.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (InstanceId, RequestId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for server, supervisor, reaper

mod config;
mod errors;
mod ids;

pub use config::{Config, IpcConfig, ObservabilityConfig, ServerConfig};
pub use errors::{Error, Result};
pub use ids::{InstanceId, RequestId};

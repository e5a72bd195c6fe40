//! # Tool Gateway - Dynamic per-catalog tool routing
//!
//! A long-lived gateway exposing one invocation surface per catalog (a named
//! set of tools). Backend tool servers are started on first use, reused while
//! busy, and drained once idle:
//! - Catalog registry with atomic snapshot reload
//! - Backend supervisor with start-locks, health probing and crash handling
//! - Secret injection at launch time, never logged
//! - Dispatcher with per-request deadlines and call statistics
//! - Idle reaper
//! - TCP+msgpack IPC surface
//!
//! ## Architecture
//!
//! ```text
//!   client ─→ Dispatcher ─→ CatalogRegistry (snapshot)
//!                │
//!                ▼
//!            Supervisor ─→ SecretInjector ─→ BackendRuntime::spawn
//!                │                                   │
//!                ▼                                   ▼
//!         InstanceHandle ───── call ─────→ backend instance
//!                ▲
//!            IdleReaper (drains Healthy, idle, in_flight == 0)
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod catalog;
pub mod dispatcher;
pub mod gateway;
pub mod ipc;
pub mod reaper;
pub mod runtime;
pub mod secrets;
pub mod supervisor;
pub mod types;

// Internal utilities
pub mod observability;

pub use catalog::{BackendRef, CatalogDescriptor, CatalogRegistry, ToolDescriptor};
pub use dispatcher::{CatalogEndpoint, Dispatcher, ToolResult};
pub use gateway::Gateway;
pub use types::{Config, Error, InstanceId, IpcConfig, RequestId, Result};

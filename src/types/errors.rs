//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context. Every variant maps onto one wire error
//! code via [`Error::to_ipc_error_code`].

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the tool gateway.
#[derive(Error, Debug)]
pub enum Error {
    /// No catalog with this name in the active registry snapshot.
    #[error("unknown catalog: {0}")]
    UnknownCatalog(String),

    /// Catalog exists but does not declare this tool.
    #[error("unknown tool '{tool}' in catalog '{catalog}'")]
    UnknownTool { catalog: String, tool: String },

    /// No healthy backend could be obtained, or the backend died mid-call.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Caller deadline exceeded. The backend instance is left running.
    #[error("timeout: {0}")]
    Timeout(String),

    /// A required secret could not be resolved. Only the name is carried.
    #[error("secret resolution failed: {name}")]
    SecretResolutionFailed { name: String },

    /// Bad catalog or gateway configuration.
    #[error("config error: {0}")]
    Config(String),

    /// The backend answered the call with a tool-level error.
    #[error("tool failed: {0}")]
    ToolFailed(String),

    /// Malformed request from a client.
    #[error("validation error: {0}")]
    Validation(String),

    /// Resource not found (instances, admin lookups).
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid state transition.
    #[error("state transition error: {0}")]
    StateTransition(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// JSON serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors (catalog and config files).
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Map to the error code string used on the IPC wire.
    pub fn to_ipc_error_code(&self) -> &'static str {
        match self {
            Error::UnknownCatalog(_) => "UNKNOWN_CATALOG",
            Error::UnknownTool { .. } => "UNKNOWN_TOOL",
            Error::BackendUnavailable(_) => "BACKEND_UNAVAILABLE",
            Error::Timeout(_) => "TIMEOUT",
            Error::SecretResolutionFailed { .. } => "SECRET_RESOLUTION_FAILED",
            Error::Config(_) | Error::Yaml(_) => "CONFIG_ERROR",
            Error::ToolFailed(_) => "TOOL_FAILED",
            Error::Validation(_) => "INVALID_ARGUMENT",
            Error::NotFound(_) => "NOT_FOUND",
            Error::StateTransition(_) => "FAILED_PRECONDITION",
            Error::Internal(_) | Error::Serialization(_) | Error::Io(_) => "INTERNAL",
        }
    }

    /// Whether the caller may reasonably retry the same request.
    ///
    /// Retrying a `BackendUnavailable` goes back through `ensure_running`,
    /// which launches a fresh instance.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::BackendUnavailable(_) | Error::Timeout(_))
    }
}

// Convenience constructors
impl Error {
    pub fn unknown_catalog(name: impl Into<String>) -> Self {
        Self::UnknownCatalog(name.into())
    }

    pub fn unknown_tool(catalog: impl Into<String>, tool: impl Into<String>) -> Self {
        Self::UnknownTool {
            catalog: catalog.into(),
            tool: tool.into(),
        }
    }

    pub fn backend_unavailable(msg: impl Into<String>) -> Self {
        Self::BackendUnavailable(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn secret_missing(name: impl Into<String>) -> Self {
        Self::SecretResolutionFailed { name: name.into() }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn tool_failed(msg: impl Into<String>) -> Self {
        Self::ToolFailed(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::unknown_catalog("x").to_ipc_error_code(), "UNKNOWN_CATALOG");
        assert_eq!(Error::unknown_tool("c", "t").to_ipc_error_code(), "UNKNOWN_TOOL");
        assert_eq!(Error::secret_missing("TOKEN").to_ipc_error_code(), "SECRET_RESOLUTION_FAILED");
        assert_eq!(Error::config("dup").to_ipc_error_code(), "CONFIG_ERROR");
        assert_eq!(Error::timeout("5s").to_ipc_error_code(), "TIMEOUT");
    }

    #[test]
    fn test_unknown_tool_message_names_both() {
        let err = Error::unknown_tool("infra", "docker-ps");
        assert_eq!(err.to_string(), "unknown tool 'docker-ps' in catalog 'infra'");
    }

    #[test]
    fn test_retryable() {
        assert!(Error::backend_unavailable("probe failed").is_retryable());
        assert!(!Error::unknown_catalog("x").is_retryable());
        assert!(!Error::secret_missing("TOKEN").is_retryable());
    }
}

//! Catalog and tool descriptors - typed, immutable tool metadata.
//!
//! Descriptors carry everything the supervisor needs to launch a backend
//! (what to run, limits, secrets, network) but never the backend itself.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::types::{Error, Result};

// =============================================================================
// Backend reference
// =============================================================================

/// What to run for a tool: a container image or a local command line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendRef {
    /// Container image reference, e.g. `mcp/github:latest`.
    Image(String),
    /// Local executable speaking the backend protocol on stdio.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl BackendRef {
    pub fn image(reference: impl Into<String>) -> Self {
        Self::Image(reference.into())
    }

    pub fn command(program: impl Into<String>, args: &[&str]) -> Self {
        Self::Command {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Check the reference can be handed to a runtime at all.
    pub fn validate(&self) -> std::result::Result<(), String> {
        match self {
            BackendRef::Image(reference) => {
                if reference.trim().is_empty() {
                    return Err("image reference is empty".to_string());
                }
                if reference.chars().any(char::is_whitespace) {
                    return Err(format!("image reference '{}' contains whitespace", reference));
                }
                Ok(())
            }
            BackendRef::Command { program, .. } => {
                if program.trim().is_empty() {
                    Err("command program is empty".to_string())
                } else {
                    Ok(())
                }
            }
        }
    }
}

impl fmt::Display for BackendRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendRef::Image(reference) => write!(f, "image:{}", reference),
            BackendRef::Command { program, args } if args.is_empty() => {
                write!(f, "cmd:{}", program)
            }
            BackendRef::Command { program, args } => {
                write!(f, "cmd:{} {}", program, args.join(" "))
            }
        }
    }
}

// =============================================================================
// Limits and concurrency
// =============================================================================

/// Advisory resource limits handed to the runtime at launch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU share (fractional CPUs).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<f64>,
    /// Memory ceiling in MiB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    /// Maximum concurrent calls routed to one instance before another
    /// instance is launched. `None` = unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_in_flight: Option<u32>,
}

// Compared bitwise on `cpus` so limits can key a pool.
impl PartialEq for ResourceLimits {
    fn eq(&self, other: &Self) -> bool {
        self.cpus.map(f64::to_bits) == other.cpus.map(f64::to_bits)
            && self.memory_mb == other.memory_mb
            && self.max_in_flight == other.max_in_flight
    }
}

impl Eq for ResourceLimits {}

impl Hash for ResourceLimits {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.cpus.map(f64::to_bits).hash(state);
        self.memory_mb.hash(state);
        self.max_in_flight.hash(state);
    }
}

/// Whether a backend accepts overlapping calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyModel {
    #[default]
    Multi,
    /// Calls to one instance are serialised by the supervisor.
    Single,
}

// =============================================================================
// Tool descriptor
// =============================================================================

/// One invocable capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub backend: BackendRef,
    #[serde(default)]
    pub resources: ResourceLimits,
    /// Secret names resolved before the backend starts.
    #[serde(default)]
    pub secrets: BTreeSet<String>,
    /// Outbound host allow-list; empty means no network.
    #[serde(default)]
    pub network: Vec<String>,
    #[serde(default)]
    pub concurrency: ConcurrencyModel,
    /// Launch an instance at gateway start instead of on first call.
    #[serde(default)]
    pub prewarm: bool,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, backend: BackendRef) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            backend,
            resources: ResourceLimits::default(),
            secrets: BTreeSet::new(),
            network: Vec::new(),
            concurrency: ConcurrencyModel::Multi,
            prewarm: false,
        }
    }

    pub fn with_secrets(mut self, names: &[&str]) -> Self {
        self.secrets = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn with_limits(mut self, resources: ResourceLimits) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_concurrency(mut self, concurrency: ConcurrencyModel) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// The part of the descriptor that decides how an instance is launched.
    pub fn launch_profile(&self) -> LaunchProfile {
        LaunchProfile {
            backend: self.backend.clone(),
            resources: self.resources.clone(),
            secrets: self.secrets.clone(),
            network: self.network.clone(),
            concurrency: self.concurrency,
        }
    }
}

/// Launch settings of a tool. Two tools share backend instances only when
/// their profiles are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LaunchProfile {
    pub backend: BackendRef,
    pub resources: ResourceLimits,
    pub secrets: BTreeSet<String>,
    pub network: Vec<String>,
    pub concurrency: ConcurrencyModel,
}

// =============================================================================
// Catalog descriptor
// =============================================================================

/// A named tool collection, in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogDescriptor {
    pub name: String,
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
}

impl CatalogDescriptor {
    pub fn new(name: impl Into<String>, tools: Vec<ToolDescriptor>) -> Self {
        Self {
            name: name.into(),
            tools,
        }
    }

    pub fn tool(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tool(name).is_some()
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    /// Reject empty or duplicate tool names and unresolvable backends.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::config("catalog name cannot be empty"));
        }

        let mut seen = HashSet::new();
        for tool in &self.tools {
            if tool.name.trim().is_empty() {
                return Err(Error::config(format!(
                    "catalog '{}': tool name cannot be empty",
                    self.name
                )));
            }
            if !seen.insert(tool.name.as_str()) {
                return Err(Error::config(format!(
                    "catalog '{}': duplicate tool name '{}'",
                    self.name, tool.name
                )));
            }
            tool.backend.validate().map_err(|e| {
                Error::config(format!(
                    "catalog '{}': tool '{}': {}",
                    self.name, tool.name, e
                ))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_catalog() -> CatalogDescriptor {
        CatalogDescriptor::new(
            "infra",
            vec![
                ToolDescriptor::new("docker-ps", BackendRef::image("docker-cli"))
                    .with_description("List containers"),
                ToolDescriptor::new("kubectl-get", BackendRef::command("kubectl-mcp", &["--stdio"])),
            ],
        )
    }

    #[test]
    fn test_lookup_keeps_declaration_order() {
        let catalog = sample_catalog();
        assert_eq!(catalog.tool_names(), vec!["docker-ps", "kubectl-get"]);
        assert!(catalog.has_tool("docker-ps"));
        assert!(!catalog.has_tool("nonexistent"));
    }

    #[test]
    fn test_validate_ok() {
        assert!(sample_catalog().validate().is_ok());
    }

    #[test]
    fn test_validate_duplicate_tool() {
        let mut catalog = sample_catalog();
        catalog.tools.push(ToolDescriptor::new("docker-ps", BackendRef::image("other")));
        let err = catalog.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate tool name 'docker-ps'"));
    }

    #[test]
    fn test_validate_empty_backend() {
        let catalog = CatalogDescriptor::new(
            "infra",
            vec![ToolDescriptor::new("x", BackendRef::image(""))],
        );
        assert!(matches!(catalog.validate(), Err(Error::Config(_))));

        let catalog = CatalogDescriptor::new(
            "infra",
            vec![ToolDescriptor::new("x", BackendRef::command(" ", &[]))],
        );
        assert!(catalog.validate().is_err());
    }

    #[test]
    fn test_backend_display() {
        assert_eq!(BackendRef::image("mcp/github").to_string(), "image:mcp/github");
        assert_eq!(
            BackendRef::command("npx", &["-y", "server"]).to_string(),
            "cmd:npx -y server"
        );
    }

    #[test]
    fn test_launch_profile_covers_launch_settings() {
        let base = ToolDescriptor::new("list", BackendRef::image("mcp/github"));
        let same = ToolDescriptor::new("search", BackendRef::image("mcp/github"))
            .with_description("different docs, same launch");
        assert_eq!(base.launch_profile(), same.launch_profile());

        let with_secret = base.clone().with_secrets(&["GH_TOKEN"]);
        let single = base.clone().with_concurrency(ConcurrencyModel::Single);
        let limited = base.clone().with_limits(ResourceLimits {
            cpus: Some(0.5),
            ..Default::default()
        });
        for other in [with_secret, single, limited] {
            assert_ne!(base.launch_profile(), other.launch_profile());
        }
    }

    #[test]
    fn test_backend_yaml_map_form() {
        let tool: ToolDescriptor =
            serde_yaml::from_str("name: docker-ps\nbackend: { image: \"mcp/docker:latest\" }\n")
                .unwrap();
        assert_eq!(tool.backend, BackendRef::image("mcp/docker:latest"));

        let tool: ToolDescriptor = serde_yaml::from_str(
            "name: kubectl\nbackend:\n  command:\n    program: kubectl-mcp\n    args: [--stdio]\n",
        )
        .unwrap();
        assert_eq!(tool.backend, BackendRef::command("kubectl-mcp", &["--stdio"]));

        let yaml = serde_yaml::to_string(&tool).unwrap();
        let back: ToolDescriptor = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, tool);
    }

    #[test]
    fn test_structural_equality() {
        let a = ToolDescriptor::new("t", BackendRef::image("img"));
        let b = ToolDescriptor::new("t", BackendRef::image("img"));
        assert_eq!(a, b);
        assert_ne!(a, b.with_secrets(&["TOKEN"]));
    }
}

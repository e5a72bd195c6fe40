//! Catalog source - loads catalog definitions from YAML.
//!
//! ```yaml
//! catalogs:
//!   - name: infra
//!     tools:
//!       - name: docker-ps
//!         backend: { image: "mcp/docker:latest" }
//!         resources: { cpus: 0.5, memory_mb: 256 }
//!         secrets: [DOCKER_HOST_TOKEN]
//!         network: [registry-1.docker.io]
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::descriptor::CatalogDescriptor;
use crate::types::{Error, Result};

/// On-disk shape of a catalog file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub catalogs: Vec<CatalogDescriptor>,
}

/// Parse catalog definitions from a YAML string. Structural validation
/// (duplicates, backends) happens on registry reload, not here.
pub fn parse_catalogs(raw: &str) -> Result<Vec<CatalogDescriptor>> {
    let file: CatalogFile = serde_yaml::from_str(raw)
        .map_err(|e| Error::config(format!("invalid catalog yaml: {}", e)))?;
    Ok(file.catalogs)
}

/// Read and parse a catalog file.
pub fn load_catalog_file(path: impl AsRef<Path>) -> Result<Vec<CatalogDescriptor>> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|e| {
        Error::config(format!("cannot read catalog file {}: {}", path.display(), e))
    })?;
    let catalogs = parse_catalogs(&raw)?;
    tracing::debug!(path = %path.display(), catalogs = catalogs.len(), "catalog_file_loaded");
    Ok(catalogs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{BackendRef, ConcurrencyModel};
    use std::io::Write;

    const SAMPLE: &str = r#"
catalogs:
  - name: infra
    tools:
      - name: docker-ps
        description: List running containers
        backend: { image: "docker-cli" }
        resources: { cpus: 0.5, memory_mb: 256, max_in_flight: 4 }
        secrets: [DOCKER_TOKEN]
        network: [registry-1.docker.io]
      - name: shell
        backend:
          command:
            program: /usr/local/bin/shell-mcp
            args: ["--stdio"]
        concurrency: single
        prewarm: true
  - name: empty
"#;

    #[test]
    fn test_parse_sample() {
        let catalogs = parse_catalogs(SAMPLE).unwrap();
        assert_eq!(catalogs.len(), 2);

        let infra = &catalogs[0];
        assert_eq!(infra.tool_names(), vec!["docker-ps", "shell"]);

        let ps = infra.tool("docker-ps").unwrap();
        assert_eq!(ps.backend, BackendRef::image("docker-cli"));
        assert_eq!(ps.resources.memory_mb, Some(256));
        assert_eq!(ps.resources.max_in_flight, Some(4));
        assert!(ps.secrets.contains("DOCKER_TOKEN"));
        assert_eq!(ps.network, vec!["registry-1.docker.io"]);
        assert_eq!(ps.concurrency, ConcurrencyModel::Multi);

        let shell = infra.tool("shell").unwrap();
        assert_eq!(shell.backend, BackendRef::command("/usr/local/bin/shell-mcp", &["--stdio"]));
        assert_eq!(shell.concurrency, ConcurrencyModel::Single);
        assert!(shell.prewarm);
        assert!(shell.network.is_empty());

        assert!(catalogs[1].tools.is_empty());
    }

    #[test]
    fn test_parse_rejects_unknown_backend_kind() {
        let raw = r#"
catalogs:
  - name: infra
    tools:
      - name: x
        backend: { helm: "chart" }
"#;
        let err = parse_catalogs(raw).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_load_catalog_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let catalogs = load_catalog_file(file.path()).unwrap();
        assert_eq!(catalogs[0].name, "infra");
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = load_catalog_file("/nonexistent/catalogs.yaml").unwrap_err();
        assert_eq!(err.to_ipc_error_code(), "CONFIG_ERROR");
    }
}

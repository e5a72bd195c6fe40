//! Catalog registry - immutable snapshots swapped atomically on reload.
//!
//! Readers clone an `Arc` of the current snapshot and work from that; the lock
//! is held only for the pointer clone or swap, never across validation.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::descriptor::{CatalogDescriptor, ToolDescriptor};
use crate::types::{Error, Result};

/// One consistent view of every catalog.
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    catalogs: HashMap<String, Arc<CatalogDescriptor>>,
    order: Vec<String>,
    generation: u64,
}

impl CatalogSnapshot {
    fn build(descriptors: Vec<CatalogDescriptor>, generation: u64) -> Self {
        let order = descriptors.iter().map(|c| c.name.clone()).collect();
        let catalogs = descriptors
            .into_iter()
            .map(|c| (c.name.clone(), Arc::new(c)))
            .collect();
        Self {
            catalogs,
            order,
            generation,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<CatalogDescriptor>> {
        self.catalogs.get(name)
    }

    /// Catalog names in declaration order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    /// Catalogs in declaration order.
    pub fn catalogs(&self) -> impl Iterator<Item = &Arc<CatalogDescriptor>> {
        self.order.iter().filter_map(|name| self.catalogs.get(name))
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.catalogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.catalogs.is_empty()
    }
}

/// Registry of catalogs. Cheap to read, replaced wholesale on reload.
#[derive(Debug, Default)]
pub struct CatalogRegistry {
    current: RwLock<Arc<CatalogSnapshot>>,
}

impl CatalogRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from an initial, validated set of catalogs.
    pub fn from_descriptors(descriptors: Vec<CatalogDescriptor>) -> Result<Self> {
        let registry = Self::new();
        registry.reload(descriptors)?;
        Ok(registry)
    }

    /// Look up a catalog in the current snapshot.
    pub fn lookup(&self, name: &str) -> Option<Arc<CatalogDescriptor>> {
        self.snapshot().get(name).cloned()
    }

    /// Look up a single tool. Returns the owning catalog so the caller can
    /// keep borrowing the descriptor after a concurrent reload.
    pub fn tool(&self, catalog: &str, tool: &str) -> Result<(Arc<CatalogDescriptor>, ToolDescriptor)> {
        let descriptor = self
            .lookup(catalog)
            .ok_or_else(|| Error::unknown_catalog(catalog))?;
        let tool = descriptor
            .tool(tool)
            .cloned()
            .ok_or_else(|| Error::unknown_tool(catalog, tool))?;
        Ok((descriptor, tool))
    }

    /// The whole current snapshot.
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.current.read().clone()
    }

    pub fn catalog_names(&self) -> Vec<String> {
        self.snapshot().names().to_vec()
    }

    pub fn generation(&self) -> u64 {
        self.snapshot().generation()
    }

    /// Validate and atomically replace every catalog.
    ///
    /// On error the previous snapshot stays active untouched.
    pub fn reload(&self, descriptors: Vec<CatalogDescriptor>) -> Result<()> {
        validate_all(&descriptors)?;

        let mut current = self.current.write();
        let next = CatalogSnapshot::build(descriptors, current.generation + 1);
        tracing::info!(
            generation = next.generation,
            catalogs = next.len(),
            "catalog_registry_swapped"
        );
        *current = Arc::new(next);
        Ok(())
    }
}

fn validate_all(descriptors: &[CatalogDescriptor]) -> Result<()> {
    let mut names = HashSet::new();
    for catalog in descriptors {
        if !names.insert(catalog.name.as_str()) {
            return Err(Error::config(format!(
                "duplicate catalog name '{}'",
                catalog.name
            )));
        }
        catalog.validate()?;
    }
    Ok(())
}

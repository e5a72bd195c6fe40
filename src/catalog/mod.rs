//! Catalog infrastructure - descriptors, the snapshot registry, YAML source.

pub mod descriptor;
pub mod registry;
pub mod source;

pub use descriptor::{
    BackendRef, CatalogDescriptor, ConcurrencyModel, LaunchProfile, ResourceLimits, ToolDescriptor,
};
pub use registry::{CatalogRegistry, CatalogSnapshot};
pub use source::{load_catalog_file, parse_catalogs, CatalogFile};

//! # Lakeflow Plugins
//!
//! Connectors built on `lakeflow-core` and the companion plugins that
//! blueprint compilation wires in after them.
//!
//! - connectors: [`github`], [`sonarqube`], [`zentao`], [`tapd`], [`jenkins`]
//! - code retrieval: [`gitextractor`], then [`refdiff`] for tag pairs
//! - enrichment: [`dora`]

pub mod common;
pub mod dora;
pub mod gitextractor;
pub mod github;
pub mod jenkins;
pub mod refdiff;
pub mod sonarqube;
pub mod tapd;
pub mod zentao;

use lakeflow_core::{PluginError, PluginRegistry};

pub use dora::Dora;
pub use gitextractor::GitExtractor;
pub use github::Github;
pub use jenkins::Jenkins;
pub use refdiff::Refdiff;
pub use sonarqube::Sonarqube;
pub use tapd::Tapd;
pub use zentao::Zentao;

/// A registry holding every plugin shipped in this crate.
pub fn builtin_registry() -> Result<PluginRegistry, PluginError> {
    let mut registry = PluginRegistry::new();
    registry.register(Github)?;
    registry.register(Sonarqube)?;
    registry.register(Zentao)?;
    registry.register(Tapd)?;
    registry.register(Jenkins)?;
    registry.register(GitExtractor)?;
    registry.register(Refdiff)?;
    registry.register(Dora)?;
    Ok(registry)
}

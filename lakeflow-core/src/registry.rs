//! Explicit plugin registry, populated at startup and read-only afterwards.

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::error::PluginError;
use crate::plugin::{Plugin, PluginAdapter, PluginRunner};
use crate::subtask::SubTaskMeta;

/// Listing entry for a registered plugin.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInfo {
    pub name: String,
    pub description: String,
    pub root_package_path: String,
    pub blueprint_support: bool,
    pub subtasks: Vec<SubTaskMeta>,
}

/// Plugins by name.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Arc<dyn PluginRunner>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed plugin.
    pub fn register<P: Plugin>(&mut self, plugin: P) -> Result<(), PluginError> {
        self.register_runner(Arc::new(PluginAdapter::new(plugin)))
    }

    /// Register an already type-erased plugin.
    pub fn register_runner(&mut self, runner: Arc<dyn PluginRunner>) -> Result<(), PluginError> {
        let name = runner.name().to_string();
        if name.is_empty() {
            return Err(PluginError::InvalidMetadata {
                plugin: name,
                message: "plugin name is empty".into(),
            });
        }
        if self.plugins.contains_key(&name) {
            return Err(PluginError::AlreadyRegistered { name });
        }
        let mut seen = HashSet::new();
        for meta in runner.subtask_metas() {
            if !seen.insert(meta.name.clone()) {
                return Err(PluginError::InvalidMetadata {
                    plugin: name,
                    message: format!("duplicate subtask '{}'", meta.name),
                });
            }
        }
        tracing::debug!(plugin = %name, subtasks = seen.len(), "Registered plugin");
        self.plugins.insert(name, runner);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn PluginRunner>> {
        self.plugins.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.plugins.keys().map(String::as_str).collect()
    }

    pub fn list(&self) -> Vec<PluginInfo> {
        self.plugins
            .values()
            .map(|p| PluginInfo {
                name: p.name().to_string(),
                description: p.description().to_string(),
                root_package_path: p.root_package_path().to_string(),
                blueprint_support: p.scope_planner().is_some(),
                subtasks: p.subtask_metas(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

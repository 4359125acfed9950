//! Domain identifiers: `<plugin>:<Type>:<connectionId>:<natural key>`.

use std::fmt;

/// Builds stable domain ids for one plugin and entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainIdGenerator {
    plugin: String,
    entity: String,
}

impl DomainIdGenerator {
    pub fn new(plugin: impl Into<String>, entity: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            entity: entity.into(),
        }
    }

    pub fn generate(&self, connection_id: u64, natural_key: impl fmt::Display) -> String {
        format!(
            "{}:{}:{}:{}",
            self.plugin, self.entity, connection_id, natural_key
        )
    }
}

/// A parsed domain id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainId {
    pub plugin: String,
    pub entity: String,
    pub connection_id: u64,
    pub natural_key: String,
}

impl DomainId {
    /// Split an id produced by [`DomainIdGenerator`]. Natural keys may contain `:`.
    pub fn parse(id: &str) -> Option<Self> {
        let mut parts = id.splitn(4, ':');
        let plugin = parts.next()?;
        let entity = parts.next()?;
        let connection_id = parts.next()?.parse().ok()?;
        let natural_key = parts.next()?;
        if plugin.is_empty() || entity.is_empty() {
            return None;
        }
        Some(Self {
            plugin: plugin.to_string(),
            entity: entity.to_string(),
            connection_id,
            natural_key: natural_key.to_string(),
        })
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.plugin, self.entity, self.connection_id, self.natural_key
        )
    }
}

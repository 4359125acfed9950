//! Fundamental types shared across the engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Coarse capability tags a blueprint scope can request.
///
/// Every subtask declares the tags it contributes to; the compiler selects
/// subtasks whose tags intersect the requested entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DomainType {
    #[serde(rename = "CODE")]
    Code,
    #[serde(rename = "TICKET")]
    Ticket,
    #[serde(rename = "CODEREVIEW")]
    CodeReview,
    #[serde(rename = "CROSS")]
    Cross,
    #[serde(rename = "CICD")]
    Cicd,
    #[serde(rename = "CODEQUALITY")]
    CodeQuality,
}

impl DomainType {
    pub const ALL: [DomainType; 6] = [
        DomainType::Code,
        DomainType::Ticket,
        DomainType::CodeReview,
        DomainType::Cross,
        DomainType::Cicd,
        DomainType::CodeQuality,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DomainType::Code => "CODE",
            DomainType::Ticket => "TICKET",
            DomainType::CodeReview => "CODEREVIEW",
            DomainType::Cross => "CROSS",
            DomainType::Cicd => "CICD",
            DomainType::CodeQuality => "CODEQUALITY",
        }
    }
}

impl fmt::Display for DomainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DomainType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DomainType::ALL
            .iter()
            .copied()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| format!("unknown domain type '{s}'"))
    }
}

/// Credentials and limits for one external API account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Connection {
    pub id: u64,
    pub name: String,
    /// Connector plugin this connection belongs to.
    pub plugin: String,
    /// Base URL that request paths are joined onto.
    pub endpoint: String,
    pub token: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Proxy URL, empty when requests go direct.
    pub proxy: String,
    /// Overrides the fetcher's default requests-per-hour budget.
    pub rate_limit_per_hour: Option<u32>,
}

impl Connection {
    /// Returns the proxy URL when one is configured.
    pub fn proxy_url(&self) -> Option<&str> {
        if self.proxy.trim().is_empty() {
            None
        } else {
            Some(self.proxy.as_str())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_type_serde_tags() {
        let json = serde_json::to_string(&DomainType::CodeReview).unwrap();
        assert_eq!(json, "\"CODEREVIEW\"");
        let parsed: DomainType = serde_json::from_str("\"CICD\"").unwrap();
        assert_eq!(parsed, DomainType::Cicd);
    }

    #[test]
    fn test_domain_type_from_str() {
        assert_eq!("CODE".parse::<DomainType>(), Ok(DomainType::Code));
        assert!("CODEX".parse::<DomainType>().is_err());
        for d in DomainType::ALL {
            assert_eq!(d.as_str().parse::<DomainType>(), Ok(d));
        }
    }

    #[test]
    fn test_connection_defaults_from_toml() {
        let conn: Connection = toml::from_str(
            r#"
            id = 3
            name = "gh"
            plugin = "github"
            endpoint = "https://api.github.com/"
            token = "secret"
            "#,
        )
        .unwrap();
        assert_eq!(conn.id, 3);
        assert_eq!(conn.token.as_deref(), Some("secret"));
        assert!(conn.proxy_url().is_none());
        assert!(conn.rate_limit_per_hour.is_none());
    }
}

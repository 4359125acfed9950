//! Configuration system for Lakeflow.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> CLI args.
//! Configuration is loaded from `~/.config/lakeflow/config.toml` and/or `.lakeflow/config.toml`
//! in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::fetcher::RetryConfig;
use crate::types::Connection;

/// Top-level configuration for a Lakeflow process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LakeflowConfig {
    #[serde(default)]
    pub fetcher: FetcherConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Configured API connections, referenced by id from task options.
    #[serde(default)]
    pub connections: Vec<Connection>,
}

/// Configuration for the rate-limited HTTP fetcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    /// Maximum in-flight requests per collector run.
    pub max_workers: usize,
    /// Requests per hour when a connection sets no limit of its own (0 = unlimited).
    pub default_rate_limit_per_hour: u32,
    /// Requests allowed back-to-back before the hourly rate applies.
    pub burst: u32,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    pub retry: RetryConfig,
    pub user_agent: String,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            default_rate_limit_per_hour: 3600,
            burst: 10,
            timeout_secs: 60,
            retry: RetryConfig::default(),
            user_agent: format!("lakeflow/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Configuration for the embedded SQLite store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file. Defaults to `lakeflow.db` under the platform data dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    /// Resolve the database path, falling back to the platform data directory.
    pub fn resolved_path(&self) -> Option<PathBuf> {
        self.path.clone().or_else(|| {
            directories::ProjectDirs::from("dev", "lakeflow", "lakeflow")
                .map(|dirs| dirs.data_dir().join("lakeflow.db"))
        })
    }
}

/// Configuration for the pipeline executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Maximum tasks of one stage running at once.
    pub max_concurrent_tasks: usize,
    /// Rows read or written per batch by extraction and conversion stages.
    pub page_batch_size: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 4,
            page_batch_size: 500,
        }
    }
}

impl LakeflowConfig {
    /// Look up a configured connection by id.
    pub fn connection(&self, id: u64) -> Result<&Connection, ConfigError> {
        self.connections
            .iter()
            .find(|c| c.id == id)
            .ok_or(ConfigError::ConnectionNotFound { id })
    }

    /// Returns a list of human-readable problems with this configuration.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.fetcher.max_workers == 0 {
            problems.push("fetcher.max_workers must be at least 1".to_string());
        }
        if self.fetcher.timeout_secs == 0 {
            problems.push("fetcher.timeout_secs must be at least 1".to_string());
        }
        if self.fetcher.retry.backoff_multiplier < 1.0 {
            problems.push("fetcher.retry.backoff_multiplier must be >= 1.0".to_string());
        }
        if self.executor.max_concurrent_tasks == 0 {
            problems.push("executor.max_concurrent_tasks must be at least 1".to_string());
        }
        if self.executor.page_batch_size == 0 {
            problems.push("executor.page_batch_size must be at least 1".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for conn in &self.connections {
            if !seen.insert(conn.id) {
                problems.push(format!("connection id {} is defined more than once", conn.id));
            }
            if conn.endpoint.trim().is_empty() {
                problems.push(format!("connection {} has no endpoint", conn.id));
            }
        }
        problems
    }

    /// Validate and convert the first problem into a `ConfigError`.
    pub fn ensure_valid(&self) -> Result<(), ConfigError> {
        match self.validate().into_iter().next() {
            Some(message) => Err(ConfigError::Invalid { message }),
            None => Ok(()),
        }
    }
}

/// Load configuration from all layered sources.
///
/// Sources are merged in order of increasing precedence:
/// 1. Built-in defaults
/// 2. User config (`~/.config/lakeflow/config.toml`)
/// 3. Workspace-local config (`.lakeflow/config.toml`)
/// 4. Environment variables (prefixed with `LAKEFLOW_`)
/// 5. Explicit overrides (passed as argument)
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&LakeflowConfig>,
) -> Result<LakeflowConfig, ConfigError> {
    let user_config = directories::ProjectDirs::from("dev", "lakeflow", "lakeflow")
        .map(|dirs| dirs.config_dir().join("config.toml"));
    // LAKEFLOW_FETCHER__MAX_WORKERS, LAKEFLOW_STORE__PATH, etc.
    layered(user_config.as_deref(), workspace, Some("LAKEFLOW_"), overrides)
        .extract()
        .map_err(|e| ConfigError::Parse(Box::new(e)))
}

/// Stack the configuration sources, lowest precedence first. Missing files
/// are skipped.
fn layered(
    user_config: Option<&Path>,
    workspace: Option<&Path>,
    env_prefix: Option<&str>,
    overrides: Option<&LakeflowConfig>,
) -> Figment {
    let mut figment = Figment::from(Serialized::defaults(LakeflowConfig::default()));

    if let Some(path) = user_config.filter(|p| p.exists()) {
        figment = figment.merge(Toml::file(path));
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".lakeflow").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(prefix) = env_prefix {
        figment = figment.merge(Env::prefixed(prefix).split("__"));
    }

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }
    figment
}

/// Load configuration from a single explicit file layered over defaults.
pub fn load_config_file(path: &Path) -> Result<LakeflowConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    Figment::from(Serialized::defaults(LakeflowConfig::default()))
        .merge(Toml::file(path))
        .extract()
        .map_err(|e| ConfigError::Parse(Box::new(e)))
}

//! Error types for the Lakeflow ingestion engine.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering fetching, collection, storage, stages, subtasks, plan compilation,
//! execution, and configuration.

use std::path::PathBuf;

/// Top-level error type for the Lakeflow core library.
#[derive(Debug, thiserror::Error)]
pub enum LakeflowError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Collector error: {0}")]
    Collector(#[from] CollectorError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    #[error("Subtask error: {0}")]
    SubTask(#[from] SubTaskError),

    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LakeflowError {
    /// Whether this error was caused by run cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            LakeflowError::Fetch(FetchError::Cancelled)
                | LakeflowError::Collector(CollectorError::Cancelled)
                | LakeflowError::Collector(CollectorError::Fetch(FetchError::Cancelled))
                | LakeflowError::Stage(StageError::Cancelled)
                | LakeflowError::SubTask(SubTaskError::Cancelled { .. })
                | LakeflowError::Executor(ExecutorError::Cancelled)
        )
    }
}

/// Errors from HTTP requests issued through the rate-limited fetcher.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("Request to {url} timed out after {timeout_secs}s")]
    Timeout { url: String, timeout_secs: u64 },

    #[error("Connection to {url} failed: {message}")]
    Connection { url: String, message: String },

    #[error("Request to {url} returned HTTP {status}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("Rate limited by {url}, retry after {retry_after_secs}s")]
    RateLimited { url: String, retry_after_secs: u64 },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Request was cancelled")]
    Cancelled,
}

impl FetchError {
    /// Transient failures are retried by the fetcher with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout { .. }
            | FetchError::Connection { .. }
            | FetchError::RateLimited { .. } => true,
            FetchError::Status { status, .. } => *status >= 500,
            FetchError::InvalidRequest { .. } | FetchError::Cancelled => false,
        }
    }
}

/// Errors from the paginated API collector.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error(
        "Stale data detected for {scope}: {message}. Please recollect this scope with a full sync"
    )]
    StaleData { scope: String, message: String },

    #[error("Malformed response from {url}: {message}")]
    MalformedResponse { url: String, message: String },

    #[error("Template error: {message}")]
    Template { message: String },

    #[error("Invalid collector arguments: {message}")]
    InvalidArgs { message: String },

    #[error("Collector worker failed: {message}")]
    Worker { message: String },

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Collection was cancelled")]
    Cancelled,
}

/// Errors from the embedded SQL store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Row serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid table name: '{table}'")]
    InvalidTable { table: String },

    #[error("Store connection lock poisoned")]
    Poisoned,

    #[error("Blocking store task failed: {message}")]
    Join { message: String },
}

/// Errors from extraction and conversion stages.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("Failed to extract raw row {raw_id} of {table}: {message}")]
    Extract {
        table: String,
        raw_id: i64,
        message: String,
    },

    #[error("Failed to convert row '{id}' of {table}: {message}")]
    Convert {
        table: String,
        id: String,
        message: String,
    },

    #[error("Failed to decode row of {table}: {message}")]
    Decode { table: String, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Stage was cancelled")]
    Cancelled,
}

/// Errors from the subtask state machine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SubTaskError {
    #[error("Plugin '{plugin}' has no subtask named '{name}'")]
    UnknownSubTask { plugin: String, name: String },

    #[error("Required subtask '{name}' failed: {message}")]
    RequiredFailed { name: String, message: String },

    #[error("Subtask '{name}' was cancelled")]
    Cancelled { name: String },

    #[error("Task data for '{plugin}' could not be prepared: {message}")]
    PreparationFailed { plugin: String, message: String },
}

/// Errors from compiling a blueprint into a pipeline plan.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CompileError {
    #[error("Invalid blueprint options: {message}")]
    InvalidOptions { message: String },

    #[error("Unsupported option combination: {message}")]
    UnsupportedCombination { message: String },

    #[error("Plugin '{plugin}' is not registered")]
    MissingPlugin { plugin: String },

    #[error("Lookup for scope '{scope}' failed: {message}")]
    Lookup { scope: String, message: String },

    #[error("Invalid pattern in '{field}': {message}")]
    InvalidPattern { field: String, message: String },
}

/// Errors from the pipeline executor.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutorError {
    #[error("Plugin '{plugin}' is not registered")]
    PluginNotFound { plugin: String },

    #[error("Stage {stage} failed: {}", failed.join(", "))]
    StageFailed { stage: usize, failed: Vec<String> },

    #[error("Pipeline was cancelled")]
    Cancelled,
}

/// Errors from plugin registration and task preparation.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("Plugin already registered: {name}")]
    AlreadyRegistered { name: String },

    #[error("Invalid metadata for plugin '{plugin}': {message}")]
    InvalidMetadata { plugin: String, message: String },

    #[error("Invalid task options for plugin '{plugin}': {message}")]
    InvalidOptions { plugin: String, message: String },

    #[error("Plugin '{plugin}' execution failed: {message}")]
    ExecutionFailed { plugin: String, message: String },
}

/// Errors from configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Connection {id} is not configured")]
    ConnectionNotFound { id: u64 },

    #[error("Configuration parse error: {0}")]
    Parse(#[from] Box<figment::Error>),
}

/// Convenience type alias for Lakeflow results.
pub type Result<T> = std::result::Result<T, LakeflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_fetch() {
        let err = FetchError::RateLimited {
            url: "https://api.github.com/repos".into(),
            retry_after_secs: 30,
        };
        assert_eq!(
            err.to_string(),
            "Rate limited by https://api.github.com/repos, retry after 30s"
        );
    }

    #[test]
    fn test_error_display_stale_data() {
        let err = CollectorError::StaleData {
            scope: "project 'lake'".into(),
            message: "issue updated after the last analysis".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("project 'lake'"));
        assert!(msg.contains("full sync"));
    }

    #[test]
    fn test_error_display_stage_failed() {
        let err = ExecutorError::StageFailed {
            stage: 2,
            failed: vec!["github".into(), "gitextractor".into()],
        };
        assert_eq!(err.to_string(), "Stage 2 failed: github, gitextractor");
    }

    #[test]
    fn test_error_conversion_chain() {
        let fetch = FetchError::Cancelled;
        let collector: CollectorError = fetch.into();
        let top: LakeflowError = collector.into();
        assert!(top.is_cancelled());
        assert!(top.to_string().contains("cancelled"));
    }

    #[test]
    fn test_fetch_error_transience() {
        let server = FetchError::Status {
            url: "u".into(),
            status: 502,
            body: String::new(),
        };
        let client = FetchError::Status {
            url: "u".into(),
            status: 404,
            body: String::new(),
        };
        assert!(server.is_transient());
        assert!(!client.is_transient());
        assert!(
            FetchError::Timeout {
                url: "u".into(),
                timeout_secs: 5
            }
            .is_transient()
        );
        assert!(!FetchError::Cancelled.is_transient());
    }

    #[test]
    fn test_unknown_subtask_display() {
        let err = SubTaskError::UnknownSubTask {
            plugin: "github".into(),
            name: "CollectNothing".into(),
        };
        assert_eq!(
            err.to_string(),
            "Plugin 'github' has no subtask named 'CollectNothing'"
        );
    }
}

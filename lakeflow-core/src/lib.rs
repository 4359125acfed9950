//! # Lakeflow Core
//!
//! Ingestion engine for Lakeflow: a rate-limited API fetcher, stateful
//! paginated collectors writing raw rows, extraction and conversion stages
//! that turn raw rows into tool and domain records, the subtask runner, and
//! the blueprint compiler and executor for multi-plugin pipeline plans.

pub mod collector;
pub mod config;
pub mod domain;
pub mod error;
pub mod executor;
pub mod fetcher;
pub mod plan;
pub mod plugin;
pub mod progress;
pub mod registry;
pub mod stage;
pub mod store;
pub mod subtask;
pub mod time;
pub mod types;

// Re-export commonly used types at the crate root.
pub use collector::{ApiCollector, CollectionWindow, CollectorStats, Pager, RequestData, UrlTemplate};
pub use config::{ExecutorConfig, FetcherConfig, LakeflowConfig, StoreConfig, load_config};
pub use error::{
    CollectorError, CompileError, ConfigError, ExecutorError, FetchError, LakeflowError,
    PluginError, Result, StageError, StoreError, SubTaskError,
};
pub use executor::{PipelineExecutor, PipelineReport, PipelineStatus, TaskReport, TaskStatus};
pub use fetcher::{ApiAuth, ApiClient, ApiResponse, RateLimitedFetcher, RateLimiterPool};
pub use plan::{
    Blueprint, BlueprintScope, PipelinePlan, PipelineStage, PipelineTask, PlanCompiler,
    RepositoryRef, ResolvedScope, ScopePlanner,
};
pub use plugin::{ClientFactory, HttpClientFactory, Plugin, PluginRunner, TaskEnv};
pub use progress::Progress;
pub use registry::{PluginInfo, PluginRegistry};
pub use stage::{ApiExtractor, DataConverter, DomainIdGenerator, Entity, Row};
pub use store::{RawDataArgs, RawRow, SqliteStore, Store};
pub use subtask::{
    SubTask, SubTaskContext, SubTaskMeta, SubTaskReport, SubTaskSelection, SubTaskStatus,
    TaskRunReport, entry,
};
pub use types::{Connection, DomainType};

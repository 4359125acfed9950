//! Connector capability contract.
//!
//! A [`Plugin`] is typed by its task data; the executor only sees the
//! object-safe [`PluginRunner`] produced by [`PluginAdapter`].

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{FetcherConfig, LakeflowConfig};
use crate::error::{ConfigError, FetchError, LakeflowError, PluginError};
use crate::fetcher::{ApiAuth, ApiClient, HttpApiClient, RateLimitedFetcher, RateLimiterPool};
use crate::plan::{PipelineTask, ScopePlanner};
use crate::store::Store;
use crate::subtask::{SubTask, SubTaskMeta, SubTaskRunner, TaskRunReport};
use crate::types::Connection;

/// Builds API clients for connections. Swapped out in tests.
pub trait ClientFactory: Send + Sync {
    fn client(
        &self,
        connection: &Connection,
        auth: ApiAuth,
        config: &FetcherConfig,
    ) -> Result<Arc<dyn ApiClient>, FetchError>;
}

/// Real HTTP clients via `reqwest`.
#[derive(Debug, Default)]
pub struct HttpClientFactory;

impl ClientFactory for HttpClientFactory {
    fn client(
        &self,
        connection: &Connection,
        auth: ApiAuth,
        config: &FetcherConfig,
    ) -> Result<Arc<dyn ApiClient>, FetchError> {
        Ok(Arc::new(HttpApiClient::for_connection(connection, auth, config)?))
    }
}

/// Shared services handed to plugins while preparing a task.
#[derive(Clone)]
pub struct TaskEnv {
    pub store: Arc<dyn Store>,
    pub config: Arc<LakeflowConfig>,
    pub limiters: Arc<RateLimiterPool>,
    pub clients: Arc<dyn ClientFactory>,
    pub cancel: CancellationToken,
}

impl TaskEnv {
    pub fn new(store: Arc<dyn Store>, config: Arc<LakeflowConfig>) -> Self {
        let limiters = Arc::new(RateLimiterPool::new(
            config.fetcher.default_rate_limit_per_hour,
            config.fetcher.burst,
        ));
        Self {
            store,
            config,
            limiters,
            clients: Arc::new(HttpClientFactory),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_client_factory(mut self, clients: Arc<dyn ClientFactory>) -> Self {
        self.clients = clients;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn connection(&self, id: u64) -> Result<&Connection, ConfigError> {
        self.config.connection(id)
    }

    pub fn api_client(
        &self,
        connection: &Connection,
        auth: ApiAuth,
    ) -> Result<Arc<dyn ApiClient>, FetchError> {
        self.clients.client(connection, auth, &self.config.fetcher)
    }

    /// A fetcher sharing the process-wide limiter of `connection`.
    pub fn fetcher(
        &self,
        connection: &Connection,
        auth: ApiAuth,
    ) -> Result<RateLimitedFetcher, FetchError> {
        let client = self.api_client(connection, auth)?;
        let fetcher = &self.config.fetcher;
        Ok(RateLimitedFetcher::new(
            client,
            self.limiters.for_connection(connection),
            fetcher.max_workers,
            fetcher.retry.clone(),
            self.cancel.clone(),
        ))
    }

    pub fn batch_size(&self) -> usize {
        self.config.executor.page_batch_size.max(1)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.fetcher.timeout_secs)
    }
}

/// A connector or companion plugin.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// Decoded, validated task options plus whatever the subtasks share.
    type TaskData: Send + Sync + 'static;

    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn root_package_path(&self) -> &'static str;

    /// Subtasks in execution order.
    fn subtasks(&self) -> Vec<SubTask<Self::TaskData>>;

    async fn prepare_task_data(
        &self,
        options: &Value,
        env: &TaskEnv,
    ) -> crate::error::Result<Self::TaskData>;

    /// Blueprint support; plugins without one cannot own a blueprint.
    fn scope_planner(&self) -> Option<Arc<dyn ScopePlanner>> {
        None
    }
}

/// What the registry and executor need from any plugin.
#[async_trait]
pub trait PluginRunner: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn root_package_path(&self) -> &str;

    fn subtask_metas(&self) -> Vec<SubTaskMeta>;

    fn scope_planner(&self) -> Option<Arc<dyn ScopePlanner>>;

    async fn run_task(
        &self,
        task: &PipelineTask,
        env: &TaskEnv,
    ) -> crate::error::Result<TaskRunReport>;
}

/// Erases a [`Plugin`]'s task data type.
pub struct PluginAdapter<P> {
    plugin: P,
}

impl<P: Plugin> PluginAdapter<P> {
    pub fn new(plugin: P) -> Self {
        Self { plugin }
    }
}

#[async_trait]
impl<P: Plugin> PluginRunner for PluginAdapter<P> {
    fn name(&self) -> &str {
        self.plugin.name()
    }

    fn description(&self) -> &str {
        self.plugin.description()
    }

    fn root_package_path(&self) -> &str {
        self.plugin.root_package_path()
    }

    fn subtask_metas(&self) -> Vec<SubTaskMeta> {
        self.plugin.subtasks().into_iter().map(|s| s.meta).collect()
    }

    fn scope_planner(&self) -> Option<Arc<dyn ScopePlanner>> {
        self.plugin.scope_planner()
    }

    async fn run_task(
        &self,
        task: &PipelineTask,
        env: &TaskEnv,
    ) -> crate::error::Result<TaskRunReport> {
        let runner = SubTaskRunner::new(self.plugin.name(), self.plugin.subtasks());
        let selection = task.selection();
        // Unknown subtask names fail before any options are decoded or I/O happens.
        runner.plan(&selection)?;

        let options = Value::Object(task.options.clone());
        let data = match self.plugin.prepare_task_data(&options, env).await {
            Ok(data) => data,
            Err(e) => return Ok(runner.not_started(&selection, &e)?),
        };
        let report = runner
            .run(
                &selection,
                Arc::new(data),
                Arc::clone(&env.store),
                env.cancel.clone(),
            )
            .await?;
        Ok(report)
    }
}

/// Decode task options into a plugin's option struct.
pub fn decode_options<T: DeserializeOwned>(plugin: &str, options: &Value) -> Result<T, PluginError> {
    serde_json::from_value(options.clone()).map_err(|e| PluginError::InvalidOptions {
        plugin: plugin.to_string(),
        message: e.to_string(),
    })
}

/// Wrap a subtask failure in a plugin-scoped error.
pub fn execution_failed(plugin: &str, message: impl std::fmt::Display) -> LakeflowError {
    LakeflowError::Plugin(PluginError::ExecutionFailed {
        plugin: plugin.to_string(),
        message: message.to_string(),
    })
}

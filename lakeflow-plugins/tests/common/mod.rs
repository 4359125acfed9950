//! Shared fixtures for plugin integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};

use lakeflow_core::config::{FetcherConfig, LakeflowConfig};
use lakeflow_core::error::FetchError;
use lakeflow_core::fetcher::{ApiAuth, ApiClient, ApiResponse, Headers};
use lakeflow_core::store::{EntityStore, RowFilter};
use lakeflow_core::{ClientFactory, Connection, PluginRunner, SqliteStore, Store, TaskEnv};

type Handler = dyn Fn(&str, &[(String, String)]) -> ApiResponse + Send + Sync;

/// Scripted API client that records every request.
pub struct MockClient {
    handler: Box<Handler>,
    requests: Mutex<Vec<(String, Vec<(String, String)>)>>,
}

impl MockClient {
    pub fn new(handler: impl Fn(&str, &[(String, String)]) -> ApiResponse + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn paths(&self) -> Vec<String> {
        self.requests.lock().unwrap().iter().map(|(p, _)| p.clone()).collect()
    }

    pub fn queries_for(&self, path: &str) -> Vec<Vec<(String, String)>> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, q)| q.clone())
            .collect()
    }

    pub fn reset(&self) {
        self.requests.lock().unwrap().clear();
    }
}

#[async_trait]
impl ApiClient for MockClient {
    async fn get(
        &self,
        path: &str,
        query: &[(String, String)],
        _headers: &Headers,
    ) -> Result<ApiResponse, FetchError> {
        self.requests
            .lock()
            .unwrap()
            .push((path.to_string(), query.to_vec()));
        Ok((self.handler)(path, query))
    }
}

/// Hands the same mock client to every connection.
pub struct MockFactory(pub Arc<MockClient>);

impl ClientFactory for MockFactory {
    fn client(
        &self,
        _connection: &Connection,
        _auth: ApiAuth,
        _config: &FetcherConfig,
    ) -> Result<Arc<dyn ApiClient>, FetchError> {
        Ok(self.0.clone())
    }
}

pub fn ok(path: &str, body: Value) -> ApiResponse {
    ApiResponse::json_ok(format!("https://mock.example.com/{path}"), &body)
}

pub fn not_found(path: &str) -> ApiResponse {
    ApiResponse {
        status: 404,
        url: format!("https://mock.example.com/{path}"),
        ..Default::default()
    }
}

pub fn query<'a>(query: &'a [(String, String)], key: &str) -> Option<&'a str> {
    query
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

pub fn connection(id: u64, plugin: &str, endpoint: &str) -> Connection {
    Connection {
        id,
        name: format!("{plugin}-{id}"),
        plugin: plugin.to_string(),
        endpoint: endpoint.to_string(),
        token: Some("secret".to_string()),
        ..Default::default()
    }
}

/// An unthrottled config holding `connections`.
pub fn config(connections: Vec<Connection>) -> LakeflowConfig {
    let mut config = LakeflowConfig {
        connections,
        ..Default::default()
    };
    config.fetcher.default_rate_limit_per_hour = 0;
    config.fetcher.retry.max_retries = 0;
    config
}

/// A task environment over a fresh in-memory store.
pub fn env(client: Arc<MockClient>, connections: Vec<Connection>) -> (Arc<SqliteStore>, TaskEnv) {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let env = TaskEnv::new(store.clone(), Arc::new(config(connections)))
        .with_client_factory(Arc::new(MockFactory(client)));
    (store, env)
}

pub async fn count(store: &dyn Store, table: &str) -> usize {
    store.count_rows(table, &RowFilter::all()).await.unwrap()
}

/// Every row of `table`, decoded.
pub async fn rows<T: serde::de::DeserializeOwned>(store: &dyn Store, table: &str) -> Vec<T> {
    store
        .rows_after(table, &RowFilter::all(), None, 10_000)
        .await
        .unwrap()
        .into_iter()
        .map(|row| serde_json::from_value(row.data).unwrap())
        .collect()
}

/// Run one task through the built-in registry.
pub async fn run_task(
    env: &TaskEnv,
    plugin: &str,
    options: Value,
) -> lakeflow_core::TaskRunReport {
    let Value::Object(options) = options else {
        panic!("options must be an object");
    };
    let registry = lakeflow_plugins::builtin_registry().unwrap();
    let task = lakeflow_core::PipelineTask::new(plugin, Vec::new(), options);
    registry
        .get(plugin)
        .unwrap()
        .run_task(&task, env)
        .await
        .unwrap()
}

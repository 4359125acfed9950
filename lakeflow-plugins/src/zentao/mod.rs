//! Zentao connector: one product and its stories.

pub mod models;
mod tasks;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use lakeflow_core::fetcher::ApiAuth;
use lakeflow_core::plugin::decode_options;
use lakeflow_core::{Connection, DomainType, Plugin, SubTask, SubTaskMeta, TaskEnv, entry};

use crate::common::ConnectorClient;

pub use tasks::{RAW_PRODUCT_TABLE, RAW_STORY_TABLE, story_status};

pub const NAME: &str = "zentao";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZentaoOptions {
    pub connection_id: u64,
    pub product_id: u64,
    pub project_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ZentaoParams {
    pub connection_id: u64,
    pub product_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<u64>,
}

pub struct ZentaoTaskData {
    pub options: ZentaoOptions,
    pub params: ZentaoParams,
    pub client: ConnectorClient,
    pub batch_size: usize,
}

fn zentao_auth(connection: &Connection) -> ApiAuth {
    match connection.token.as_deref().filter(|t| !t.is_empty()) {
        Some(token) => ApiAuth::Header {
            name: "Token".into(),
            value: token.to_string(),
        },
        None => ApiAuth::from_connection(connection),
    }
}

#[derive(Debug, Default)]
pub struct Zentao;

#[async_trait]
impl Plugin for Zentao {
    type TaskData = ZentaoTaskData;

    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Collect products and stories from Zentao"
    }

    fn root_package_path(&self) -> &'static str {
        "lakeflow/plugins/zentao"
    }

    fn subtasks(&self) -> Vec<SubTask<ZentaoTaskData>> {
        let types = [DomainType::Ticket];
        vec![
            SubTask::new(
                SubTaskMeta::new("CollectProduct")
                    .description("Collect the product")
                    .domain_types(&types),
                entry(tasks::collect_product),
            ),
            SubTask::new(
                SubTaskMeta::new("ExtractProduct")
                    .description("Extract the product and its story counters")
                    .domain_types(&types),
                entry(tasks::extract_product),
            ),
            SubTask::new(
                SubTaskMeta::new("ConvertProduct")
                    .description("Convert the product into a board")
                    .domain_types(&types),
                entry(tasks::convert_product),
            ),
            SubTask::new(
                SubTaskMeta::new("CollectStories")
                    .description("Collect the product's stories")
                    .domain_types(&types),
                entry(tasks::collect_stories),
            ),
            SubTask::new(
                SubTaskMeta::new("ExtractStories")
                    .description("Extract stories into the tool layer")
                    .domain_types(&types),
                entry(tasks::extract_stories),
            ),
            SubTask::new(
                SubTaskMeta::new("ConvertStories")
                    .description("Convert stories into issues and board links")
                    .domain_types(&types),
                entry(tasks::convert_stories),
            ),
        ]
    }

    async fn prepare_task_data(
        &self,
        options: &Value,
        env: &TaskEnv,
    ) -> lakeflow_core::Result<ZentaoTaskData> {
        let options: ZentaoOptions = decode_options(NAME, options)?;
        let client = ConnectorClient::new(env, options.connection_id, zentao_auth)?;
        Ok(ZentaoTaskData {
            params: ZentaoParams {
                connection_id: options.connection_id,
                product_id: options.product_id,
                project_id: options.project_id,
            },
            options,
            client,
            batch_size: env.batch_size(),
        })
    }
}

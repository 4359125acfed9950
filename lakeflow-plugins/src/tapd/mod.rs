//! TAPD connector: iterations, stories, and the commits linked to stories.
//!
//! Iterations and stories collect incrementally from the tool-layer watermark
//! unless the options carry an explicit `since`. Story commits are requested
//! once per story modified since the last commit collection.

pub mod models;
mod tasks;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use lakeflow_core::fetcher::ApiAuth;
use lakeflow_core::plugin::decode_options;
use lakeflow_core::time::flexible;
use lakeflow_core::{DomainType, Plugin, SubTask, SubTaskMeta, TaskEnv, entry};

use crate::common::ConnectorClient;

pub use tasks::{
    RAW_ITERATION_TABLE, RAW_STORY_COMMIT_TABLE, RAW_STORY_TABLE, modified_filter, story_status,
};

pub const NAME: &str = "tapd";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TapdOptions {
    pub connection_id: u64,
    pub workspace_id: u64,
    /// Collect only records modified after this instant, as a full run.
    #[serde(default, with = "flexible")]
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TapdParams {
    pub connection_id: u64,
    pub workspace_id: u64,
}

pub struct TapdTaskData {
    pub options: TapdOptions,
    pub params: TapdParams,
    pub client: ConnectorClient,
    pub batch_size: usize,
}

#[derive(Debug, Default)]
pub struct Tapd;

#[async_trait]
impl Plugin for Tapd {
    type TaskData = TapdTaskData;

    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Collect iterations, stories and story commits from TAPD"
    }

    fn root_package_path(&self) -> &'static str {
        "lakeflow/plugins/tapd"
    }

    fn subtasks(&self) -> Vec<SubTask<TapdTaskData>> {
        let ticket = [DomainType::Ticket];
        let cross = [DomainType::Cross];
        vec![
            SubTask::new(
                SubTaskMeta::new("CollectIterations")
                    .description("Collect iterations of the workspace")
                    .domain_types(&ticket)
                    .required(),
                entry(tasks::collect_iterations),
            ),
            SubTask::new(
                SubTaskMeta::new("ExtractIterations")
                    .description("Extract iterations into the tool layer")
                    .domain_types(&ticket),
                entry(tasks::extract_iterations),
            ),
            SubTask::new(
                SubTaskMeta::new("ConvertIterations")
                    .description("Convert iterations into sprints")
                    .domain_types(&ticket),
                entry(tasks::convert_iterations),
            ),
            SubTask::new(
                SubTaskMeta::new("CollectStories")
                    .description("Collect stories of the workspace")
                    .domain_types(&ticket),
                entry(tasks::collect_stories),
            ),
            SubTask::new(
                SubTaskMeta::new("ExtractStories")
                    .description("Extract stories into the tool layer")
                    .domain_types(&ticket),
                entry(tasks::extract_stories),
            ),
            SubTask::new(
                SubTaskMeta::new("ConvertStories")
                    .description("Convert stories into issues and board links")
                    .domain_types(&ticket),
                entry(tasks::convert_stories),
            ),
            SubTask::new(
                SubTaskMeta::new("CollectStoryCommits")
                    .description("Collect commits linked to recently modified stories")
                    .domain_types(&cross),
                entry(tasks::collect_story_commits),
            ),
            SubTask::new(
                SubTaskMeta::new("ExtractStoryCommits")
                    .description("Extract story commits into the tool layer")
                    .domain_types(&cross),
                entry(tasks::extract_story_commits),
            ),
            SubTask::new(
                SubTaskMeta::new("ConvertStoryCommits")
                    .description("Convert story commits into issue commits")
                    .domain_types(&cross),
                entry(tasks::convert_story_commits),
            ),
        ]
    }

    async fn prepare_task_data(
        &self,
        options: &Value,
        env: &TaskEnv,
    ) -> lakeflow_core::Result<TapdTaskData> {
        let options: TapdOptions = decode_options(NAME, options)?;
        let client = ConnectorClient::new(env, options.connection_id, ApiAuth::from_connection)?;
        Ok(TapdTaskData {
            params: TapdParams {
                connection_id: options.connection_id,
                workspace_id: options.workspace_id,
            },
            options,
            client,
            batch_size: env.batch_size(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_options_accept_naive_since() {
        let options: TapdOptions = decode_options(
            NAME,
            &json!({"connectionId": 1, "workspaceId": 991, "since": "2022-03-01 00:00:00"}),
        )
        .unwrap();
        assert_eq!(options.workspace_id, 991);
        assert_eq!(
            options.since.unwrap().to_rfc3339(),
            "2022-03-01T00:00:00+00:00"
        );

        let options: TapdOptions =
            decode_options(NAME, &json!({"connectionId": 1, "workspaceId": 991})).unwrap();
        assert!(options.since.is_none());
    }
}

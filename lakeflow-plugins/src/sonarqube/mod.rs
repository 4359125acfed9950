//! SonarQube connector: code-quality issues of one project.
//!
//! Issues are paged with a known total. A page containing an issue updated
//! after the project's last analysis means the analysis changed mid-collection;
//! the collection aborts and asks for a full re-collection.

pub mod models;
mod tasks;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use lakeflow_core::fetcher::{ApiAuth, Headers};
use lakeflow_core::plugin::{decode_options, execution_failed};
use lakeflow_core::{Connection, DomainType, Plugin, SubTask, SubTaskMeta, TaskEnv, entry};

use crate::common::ConnectorClient;
use models::ApiProjectSearch;

pub use tasks::RAW_ISSUES_TABLE;

pub const NAME: &str = "sonarqube";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SonarqubeOptions {
    pub connection_id: u64,
    pub project_key: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SonarqubeParams {
    pub connection_id: u64,
    pub project_key: String,
}

pub struct SonarqubeTaskData {
    pub options: SonarqubeOptions,
    pub params: SonarqubeParams,
    pub client: ConnectorClient,
    /// Issues updated after this instant belong to a newer analysis.
    pub last_analysis_date: Option<DateTime<Utc>>,
    pub batch_size: usize,
}

/// SonarQube tokens authenticate as the basic-auth username.
fn sonar_auth(connection: &Connection) -> ApiAuth {
    match connection.token.as_deref().filter(|t| !t.is_empty()) {
        Some(token) => ApiAuth::Basic {
            username: token.to_string(),
            password: String::new(),
        },
        None => ApiAuth::from_connection(connection),
    }
}

#[derive(Debug, Default)]
pub struct Sonarqube;

#[async_trait]
impl Plugin for Sonarqube {
    type TaskData = SonarqubeTaskData;

    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Collect code-quality issues from SonarQube"
    }

    fn root_package_path(&self) -> &'static str {
        "lakeflow/plugins/sonarqube"
    }

    fn subtasks(&self) -> Vec<SubTask<SonarqubeTaskData>> {
        let types = [DomainType::CodeQuality];
        vec![
            SubTask::new(
                SubTaskMeta::new("CollectIssues")
                    .description("Collect issues data from the SonarQube API")
                    .domain_types(&types)
                    .required(),
                entry(tasks::collect_issues),
            ),
            SubTask::new(
                SubTaskMeta::new("ExtractIssues")
                    .description("Extract raw issues into the tool layer")
                    .domain_types(&types),
                entry(tasks::extract_issues),
            ),
            SubTask::new(
                SubTaskMeta::new("ConvertIssues")
                    .description("Convert tool issues into code-quality issues")
                    .domain_types(&types),
                entry(tasks::convert_issues),
            ),
        ]
    }

    async fn prepare_task_data(
        &self,
        options: &Value,
        env: &TaskEnv,
    ) -> lakeflow_core::Result<SonarqubeTaskData> {
        let options: SonarqubeOptions = decode_options(NAME, options)?;
        if options.project_key.trim().is_empty() {
            return Err(execution_failed(NAME, "projectKey is required"));
        }
        let client = ConnectorClient::new(env, options.connection_id, sonar_auth)?;

        let response = client
            .fetcher
            .get(
                "projects/search",
                &[("projects".to_string(), options.project_key.clone())],
                &Headers::new(),
            )
            .await?;
        let search: ApiProjectSearch = response.json()?;
        let project = search
            .components
            .into_iter()
            .find(|c| c.key == options.project_key)
            .ok_or_else(|| {
                execution_failed(NAME, format!("project '{}' not found", options.project_key))
            })?;
        info!(
            project = %project.key,
            last_analysis = ?project.last_analysis_date,
            "Resolved SonarQube project"
        );

        Ok(SonarqubeTaskData {
            params: SonarqubeParams {
                connection_id: options.connection_id,
                project_key: options.project_key.clone(),
            },
            options,
            client,
            last_analysis_date: project.last_analysis_date,
            batch_size: env.batch_size(),
        })
    }
}

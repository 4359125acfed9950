//! Jenkins connector: builds of one job as CI/CD tasks.

pub mod models;
pub mod planner;
mod tasks;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use lakeflow_core::domain::cicd;
use lakeflow_core::fetcher::ApiAuth;
use lakeflow_core::plan::ScopePlanner;
use lakeflow_core::plugin::decode_options;
use lakeflow_core::{Connection, DomainType, Plugin, SubTask, SubTaskMeta, TaskEnv, entry};

use crate::common::{ConnectorClient, optional_pattern};

pub use planner::JenkinsScopePlanner;
pub use tasks::{RAW_BUILD_TABLE, build_result};

pub const NAME: &str = "jenkins";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JenkinsOptions {
    pub connection_id: u64,
    pub job_full_name: String,
    #[serde(default)]
    pub transformation_rules: TransformationRules,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformationRules {
    pub deployment_pattern: Option<String>,
    pub production_pattern: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JenkinsParams {
    pub connection_id: u64,
    pub job_full_name: String,
}

/// Compiled build classification rules.
#[derive(Debug, Clone, Default)]
pub struct BuildRules {
    deployment: Option<Regex>,
    production: Option<Regex>,
}

impl BuildRules {
    pub fn compile(rules: &TransformationRules) -> Result<Self, lakeflow_core::error::PluginError> {
        Ok(Self {
            deployment: optional_pattern(
                NAME,
                "deploymentPattern",
                rules.deployment_pattern.as_deref(),
            )?,
            production: optional_pattern(
                NAME,
                "productionPattern",
                rules.production_pattern.as_deref(),
            )?,
        })
    }

    pub fn task_type(&self, name: &str) -> &'static str {
        match &self.deployment {
            Some(re) if re.is_match(name) => cicd::DEPLOYMENT,
            _ => "",
        }
    }

    /// `None` when no production pattern is configured.
    pub fn environment(&self, name: &str) -> Option<&'static str> {
        self.production.as_ref().map(|re| {
            if re.is_match(name) {
                cicd::PRODUCTION
            } else {
                cicd::TESTING
            }
        })
    }
}

/// `a/b` to `job/a/job/b`.
pub fn job_path(full_name: &str) -> String {
    full_name
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| format!("job/{}", urlencoding::encode(segment)))
        .collect::<Vec<_>>()
        .join("/")
}

pub struct JenkinsTaskData {
    pub options: JenkinsOptions,
    pub params: JenkinsParams,
    pub client: ConnectorClient,
    pub rules: BuildRules,
    pub batch_size: usize,
}

/// Jenkins API tokens are used as the basic-auth password.
fn jenkins_auth(connection: &Connection) -> ApiAuth {
    match connection.username.as_deref().filter(|u| !u.is_empty()) {
        Some(username) => ApiAuth::Basic {
            username: username.to_string(),
            password: connection
                .password
                .clone()
                .or_else(|| connection.token.clone())
                .unwrap_or_default(),
        },
        None => ApiAuth::from_connection(connection),
    }
}

#[derive(Debug, Default)]
pub struct Jenkins;

#[async_trait]
impl Plugin for Jenkins {
    type TaskData = JenkinsTaskData;

    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Collect builds from Jenkins"
    }

    fn root_package_path(&self) -> &'static str {
        "lakeflow/plugins/jenkins"
    }

    fn subtasks(&self) -> Vec<SubTask<JenkinsTaskData>> {
        let types = [DomainType::Cicd];
        vec![
            SubTask::new(
                SubTaskMeta::new("CollectBuilds")
                    .description("Collect builds of the job")
                    .domain_types(&types)
                    .required(),
                entry(tasks::collect_builds),
            ),
            SubTask::new(
                SubTaskMeta::new("ExtractBuilds")
                    .description("Extract builds into the tool layer")
                    .domain_types(&types)
                    .required(),
                entry(tasks::extract_builds),
            ),
            SubTask::new(
                SubTaskMeta::new("ConvertBuilds")
                    .description("Convert builds into CI/CD tasks")
                    .domain_types(&types),
                entry(tasks::convert_builds),
            ),
        ]
    }

    async fn prepare_task_data(
        &self,
        options: &Value,
        env: &TaskEnv,
    ) -> lakeflow_core::Result<JenkinsTaskData> {
        let options: JenkinsOptions = decode_options(NAME, options)?;
        let rules = BuildRules::compile(&options.transformation_rules)?;
        let client = ConnectorClient::new(env, options.connection_id, jenkins_auth)?;
        Ok(JenkinsTaskData {
            params: JenkinsParams {
                connection_id: options.connection_id,
                job_full_name: options.job_full_name.trim_matches('/').to_string(),
            },
            options,
            client,
            rules,
            batch_size: env.batch_size(),
        })
    }

    fn scope_planner(&self) -> Option<Arc<dyn ScopePlanner>> {
        Some(Arc::new(JenkinsScopePlanner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_path() {
        assert_eq!(job_path("devlake"), "job/devlake");
        assert_eq!(job_path("team/app"), "job/team/job/app");
        assert_eq!(job_path("team/my app"), "job/team/job/my%20app");
    }

    #[test]
    fn test_build_rules() {
        let rules = BuildRules::compile(&TransformationRules {
            deployment_pattern: Some("deploy".into()),
            production_pattern: Some("(?i)build-and-deploy".into()),
        })
        .unwrap();
        assert_eq!(rules.task_type("build-and-deploy"), cicd::DEPLOYMENT);
        assert_eq!(rules.task_type("unit-test"), "");
        assert_eq!(rules.environment("Build-And-Deploy"), Some(cicd::PRODUCTION));
        assert_eq!(rules.environment("unit-test"), Some(cicd::TESTING));
        assert_eq!(BuildRules::default().environment("anything"), None);
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let err = BuildRules::compile(&TransformationRules {
            deployment_pattern: Some("(".into()),
            production_pattern: None,
        })
        .unwrap_err();
        assert!(err.to_string().contains("deploymentPattern"));
    }

    #[test]
    fn test_basic_auth_falls_back_to_token() {
        let conn = Connection {
            username: Some("admin".into()),
            token: Some("api-token".into()),
            ..Default::default()
        };
        assert_eq!(
            jenkins_auth(&conn),
            ApiAuth::Basic {
                username: "admin".into(),
                password: "api-token".into()
            }
        );
    }
}

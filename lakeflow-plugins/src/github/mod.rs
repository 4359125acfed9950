//! GitHub connector: repository metadata and issues.
//!
//! Blueprint scopes name a repository by `owner` and `repo`; the planner
//! resolves it once per compile so `gitextractor` can clone it.

pub mod models;
pub mod planner;
mod tasks;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use lakeflow_core::domain::issue_type;
use lakeflow_core::fetcher::ApiAuth;
use lakeflow_core::plan::ScopePlanner;
use lakeflow_core::plugin::decode_options;
use lakeflow_core::{DomainType, Plugin, SubTask, SubTaskMeta, TaskEnv, entry};

use crate::common::{ConnectorClient, optional_pattern};

pub use planner::{GithubScopePlanner, authenticated_clone_url};
pub use tasks::{RAW_ISSUE_TABLE, RAW_REPO_TABLE};

pub const NAME: &str = "github";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubOptions {
    pub connection_id: u64,
    pub owner: String,
    pub repo: String,
    #[serde(default)]
    pub transformation_rules: TransformationRules,
}

/// Label patterns that map issues onto standard types.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformationRules {
    pub issue_type_bug: Option<String>,
    pub issue_type_incident: Option<String>,
    pub issue_type_requirement: Option<String>,
}

/// Scopes raw and tool rows to one repository of one connection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubParams {
    pub connection_id: u64,
    pub owner: String,
    pub repo: String,
}

#[derive(Debug, Clone, Default)]
pub struct IssueTypeRules {
    bug: Option<Regex>,
    incident: Option<Regex>,
    requirement: Option<Regex>,
}

impl IssueTypeRules {
    pub fn compile(rules: &TransformationRules) -> Result<Self, lakeflow_core::PluginError> {
        Ok(Self {
            bug: optional_pattern(NAME, "issueTypeBug", rules.issue_type_bug.as_deref())?,
            incident: optional_pattern(
                NAME,
                "issueTypeIncident",
                rules.issue_type_incident.as_deref(),
            )?,
            requirement: optional_pattern(
                NAME,
                "issueTypeRequirement",
                rules.issue_type_requirement.as_deref(),
            )?,
        })
    }

    /// First matching rule wins, in bug / incident / requirement order.
    pub fn classify(&self, labels: &[String]) -> &'static str {
        let matches = |re: &Option<Regex>| {
            re.as_ref()
                .is_some_and(|re| labels.iter().any(|l| re.is_match(l)))
        };
        if matches(&self.bug) {
            issue_type::BUG
        } else if matches(&self.incident) {
            issue_type::INCIDENT
        } else if matches(&self.requirement) {
            issue_type::REQUIREMENT
        } else {
            issue_type::TASK
        }
    }
}

pub struct GithubTaskData {
    pub options: GithubOptions,
    pub params: GithubParams,
    pub client: ConnectorClient,
    pub rules: IssueTypeRules,
    pub batch_size: usize,
}

#[derive(Debug, Default)]
pub struct Github;

#[async_trait]
impl Plugin for Github {
    type TaskData = GithubTaskData;

    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Collect repositories and issues from GitHub"
    }

    fn root_package_path(&self) -> &'static str {
        "lakeflow/plugins/github"
    }

    fn subtasks(&self) -> Vec<SubTask<GithubTaskData>> {
        let scope_types = [DomainType::Code, DomainType::Ticket];
        vec![
            SubTask::new(
                SubTaskMeta::new("CollectRepo")
                    .description("Collect repository metadata")
                    .domain_types(&scope_types)
                    .required(),
                entry(tasks::collect_repo),
            ),
            SubTask::new(
                SubTaskMeta::new("ExtractRepo")
                    .description("Extract repository metadata into the tool layer")
                    .domain_types(&scope_types)
                    .required(),
                entry(tasks::extract_repo),
            ),
            SubTask::new(
                SubTaskMeta::new("ConvertRepo")
                    .description("Convert the repository into a domain repo and board")
                    .domain_types(&scope_types),
                entry(tasks::convert_repo),
            ),
            SubTask::new(
                SubTaskMeta::new("CollectIssues")
                    .description("Collect issues, incrementally once issues were extracted")
                    .domain_types(&[DomainType::Ticket]),
                entry(tasks::collect_issues),
            ),
            SubTask::new(
                SubTaskMeta::new("ExtractIssues")
                    .description("Extract issues and classify them by label")
                    .domain_types(&[DomainType::Ticket]),
                entry(tasks::extract_issues),
            ),
            SubTask::new(
                SubTaskMeta::new("ConvertIssues")
                    .description("Convert issues into domain issues and board links")
                    .domain_types(&[DomainType::Ticket]),
                entry(tasks::convert_issues),
            ),
        ]
    }

    async fn prepare_task_data(
        &self,
        options: &Value,
        env: &TaskEnv,
    ) -> lakeflow_core::Result<GithubTaskData> {
        let options: GithubOptions = decode_options(NAME, options)?;
        let rules = IssueTypeRules::compile(&options.transformation_rules)?;
        let client = ConnectorClient::new(env, options.connection_id, ApiAuth::from_connection)?;
        Ok(GithubTaskData {
            params: GithubParams {
                connection_id: options.connection_id,
                owner: options.owner.clone(),
                repo: options.repo.clone(),
            },
            options,
            client,
            rules,
            batch_size: env.batch_size(),
        })
    }

    fn scope_planner(&self) -> Option<Arc<dyn ScopePlanner>> {
        Some(Arc::new(GithubScopePlanner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_type_rules() {
        let rules = IssueTypeRules::compile(&TransformationRules {
            issue_type_bug: Some("^(bug|defect)$".into()),
            issue_type_incident: Some("incident".into()),
            issue_type_requirement: None,
        })
        .unwrap();
        let labels = |ls: &[&str]| ls.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(rules.classify(&labels(&["defect", "incident"])), issue_type::BUG);
        assert_eq!(rules.classify(&labels(&["p1-incident"])), issue_type::INCIDENT);
        assert_eq!(rules.classify(&labels(&["docs"])), issue_type::TASK);
    }

    #[test]
    fn test_invalid_rule_rejected() {
        let err = IssueTypeRules::compile(&TransformationRules {
            issue_type_bug: Some("[".into()),
            ..Default::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("issueTypeBug"));
    }

    #[test]
    fn test_code_subtasks_are_repo_steps() {
        let names: Vec<String> = Github
            .subtasks()
            .into_iter()
            .filter(|s| s.meta.serves_any(&[DomainType::Code]))
            .map(|s| s.meta.name)
            .collect();
        assert_eq!(names, vec!["CollectRepo", "ExtractRepo", "ConvertRepo"]);
    }
}

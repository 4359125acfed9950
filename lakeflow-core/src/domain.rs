//! Normalized domain entities shared across plugins.
//!
//! Converters write these; enrichment plugins (refdiff, dora) read them back.
//! Ids are generated with [`DomainIdGenerator`](crate::stage::DomainIdGenerator)
//! except where the natural key is already global (commit shas).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stage::Entity;

pub mod issue_type {
    pub const REQUIREMENT: &str = "REQUIREMENT";
    pub const BUG: &str = "BUG";
    pub const INCIDENT: &str = "INCIDENT";
    pub const TASK: &str = "TASK";
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueStatus {
    #[default]
    Todo,
    InProgress,
    Done,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub id: String,
    pub url: String,
    pub issue_key: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub issue_type: String,
    pub status: IssueStatus,
    /// Status as reported by the source tool.
    pub original_status: String,
    #[serde(default)]
    pub story_point: f64,
    #[serde(default)]
    pub priority: String,
    #[serde(default)]
    pub creator_name: String,
    #[serde(default)]
    pub assignee_name: String,
    #[serde(default)]
    pub parent_issue_id: Option<String>,
    pub created_date: Option<DateTime<Utc>>,
    pub updated_date: Option<DateTime<Utc>>,
    pub resolution_date: Option<DateTime<Utc>>,
    /// Minutes between creation and resolution.
    pub lead_time_minutes: Option<i64>,
}

impl Issue {
    pub fn compute_lead_time(&mut self) {
        self.lead_time_minutes = match (self.created_date, self.resolution_date) {
            (Some(created), Some(resolved)) if resolved >= created => {
                Some((resolved - created).num_minutes())
            }
            _ => None,
        };
    }
}

impl Entity for Issue {
    const TABLE: &'static str = "issues";

    fn primary_key(&self) -> String {
        self.id.clone()
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_date
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Board {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub url: String,
    pub created_date: Option<DateTime<Utc>>,
}

impl Entity for Board {
    const TABLE: &'static str = "boards";

    fn primary_key(&self) -> String {
        self.id.clone()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardIssue {
    pub board_id: String,
    pub issue_id: String,
}

impl Entity for BoardIssue {
    const TABLE: &'static str = "board_issues";

    fn primary_key(&self) -> String {
        format!("{}|{}", self.board_id, self.issue_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sprint {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub url: String,
    pub status: String,
    pub original_board_id: String,
    pub started_date: Option<DateTime<Utc>>,
    pub ended_date: Option<DateTime<Utc>>,
    pub completed_date: Option<DateTime<Utc>>,
    pub updated_date: Option<DateTime<Utc>>,
}

impl Entity for Sprint {
    const TABLE: &'static str = "sprints";

    fn primary_key(&self) -> String {
        self.id.clone()
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_date
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repo {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub forked_from: String,
    pub created_date: Option<DateTime<Utc>>,
    pub updated_date: Option<DateTime<Utc>>,
}

impl Entity for Repo {
    const TABLE: &'static str = "repos";

    fn primary_key(&self) -> String {
        self.id.clone()
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_date
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    pub sha: String,
    pub repo_id: String,
    pub message: String,
    pub author_name: String,
    pub author_email: String,
    pub authored_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parents: Vec<String>,
}

impl Entity for Commit {
    const TABLE: &'static str = "commits";

    fn primary_key(&self) -> String {
        self.sha.clone()
    }
}

pub mod ref_type {
    pub const TAG: &str = "TAG";
    pub const BRANCH: &str = "BRANCH";
}

/// A branch or tag. `id` is `<repoId>:<full ref name>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ref {
    pub id: String,
    pub repo_id: String,
    pub name: String,
    pub commit_sha: String,
    pub ref_type: String,
    pub is_default: bool,
    pub created_date: Option<DateTime<Utc>>,
}

impl Ref {
    pub fn ref_id(repo_id: &str, full_name: &str) -> String {
        format!("{repo_id}:{full_name}")
    }
}

impl Entity for Ref {
    const TABLE: &'static str = "refs";

    fn primary_key(&self) -> String {
        self.id.clone()
    }
}

/// Two consecutive tags of a repo, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefPair {
    pub repo_id: String,
    pub new_ref_id: String,
    pub old_ref_id: String,
    pub new_ref_commit_sha: String,
    pub old_ref_commit_sha: String,
}

impl Entity for RefPair {
    const TABLE: &'static str = "ref_pairs";

    fn primary_key(&self) -> String {
        format!("{}|{}", self.new_ref_id, self.old_ref_id)
    }
}

pub mod cicd {
    pub const DEPLOYMENT: &str = "DEPLOYMENT";
    pub const PRODUCTION: &str = "PRODUCTION";
    pub const TESTING: &str = "TESTING";
    pub const SUCCESS: &str = "SUCCESS";
    pub const FAILURE: &str = "FAILURE";
    pub const ABORT: &str = "ABORT";
    pub const DONE: &str = "DONE";
    pub const IN_PROGRESS: &str = "IN_PROGRESS";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CicdTask {
    pub id: String,
    pub name: String,
    pub pipeline_id: String,
    pub result: String,
    pub status: String,
    #[serde(rename = "type")]
    pub task_type: String,
    /// `PRODUCTION` or `TESTING` once classified; `None` leaves it to enrichment.
    pub environment: Option<String>,
    pub duration_sec: u64,
    pub started_date: Option<DateTime<Utc>>,
    pub finished_date: Option<DateTime<Utc>>,
}

impl Entity for CicdTask {
    const TABLE: &'static str = "cicd_tasks";

    fn primary_key(&self) -> String {
        self.id.clone()
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.finished_date.or(self.started_date)
    }
}

/// A code-quality finding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CqIssue {
    pub id: String,
    pub project_key: String,
    pub rule: String,
    pub severity: String,
    pub component: String,
    pub line: Option<i64>,
    pub status: String,
    pub message: String,
    #[serde(rename = "type")]
    pub issue_type: String,
    pub created_date: Option<DateTime<Utc>>,
    pub updated_date: Option<DateTime<Utc>>,
}

impl Entity for CqIssue {
    const TABLE: &'static str = "cq_issues";

    fn primary_key(&self) -> String {
        self.id.clone()
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_date
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueCommit {
    pub issue_id: String,
    pub commit_sha: String,
}

impl Entity for IssueCommit {
    const TABLE: &'static str = "issue_commits";

    fn primary_key(&self) -> String {
        format!("{}|{}", self.issue_id, self.commit_sha)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_issue_lead_time() {
        let mut issue = Issue {
            created_date: Some(Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap()),
            resolution_date: Some(Utc.with_ymd_and_hms(2023, 1, 2, 1, 30, 0).unwrap()),
            ..Default::default()
        };
        issue.compute_lead_time();
        assert_eq!(issue.lead_time_minutes, Some(24 * 60 + 90));

        issue.resolution_date = None;
        issue.compute_lead_time();
        assert_eq!(issue.lead_time_minutes, None);
    }

    #[test]
    fn test_issue_serialization() {
        let issue = Issue {
            id: "zentao:ZentaoStory:1:5".into(),
            issue_type: issue_type::REQUIREMENT.into(),
            status: IssueStatus::InProgress,
            ..Default::default()
        };
        let value = serde_json::to_value(&issue).unwrap();
        assert_eq!(value["type"], json!("REQUIREMENT"));
        assert_eq!(value["status"], json!("IN_PROGRESS"));
        assert!(value.get("issueKey").is_some());
    }

    #[test]
    fn test_composite_keys() {
        let bi = BoardIssue {
            board_id: "b".into(),
            issue_id: "i".into(),
        };
        assert_eq!(Entity::primary_key(&bi), "b|i");
        assert_eq!(Ref::ref_id("github:GithubRepo:1:9", "refs/tags/v1"), "github:GithubRepo:1:9:refs/tags/v1");
    }
}

//! GitHub API payloads and tool-layer rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lakeflow_core::stage::Entity;
use lakeflow_core::time::flexible;

#[derive(Debug, Clone, Deserialize)]
pub struct ApiUser {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiLabel {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiParent {
    pub full_name: String,
}

/// `GET repos/{owner}/{repo}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiRepo {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub clone_url: String,
    pub description: Option<String>,
    pub language: Option<String>,
    pub parent: Option<ApiParent>,
    #[serde(default, with = "flexible")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, with = "flexible")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// One element of `GET repos/{owner}/{repo}/issues`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiIssue {
    pub id: u64,
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub state: String,
    #[serde(default)]
    pub labels: Vec<ApiLabel>,
    pub user: Option<ApiUser>,
    pub assignee: Option<ApiUser>,
    #[serde(default)]
    pub html_url: String,
    /// Present when the "issue" is actually a pull request.
    pub pull_request: Option<serde_json::Value>,
    #[serde(default, with = "flexible")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, with = "flexible")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, with = "flexible")]
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubRepo {
    pub connection_id: u64,
    pub github_id: u64,
    pub name: String,
    pub full_name: String,
    pub html_url: String,
    pub clone_url: String,
    pub description: String,
    pub language: String,
    pub parent_full_name: String,
    pub created_date: Option<DateTime<Utc>>,
    pub updated_date: Option<DateTime<Utc>>,
}

impl Entity for GithubRepo {
    const TABLE: &'static str = "_tool_github_repos";

    fn primary_key(&self) -> String {
        format!("{}:{}", self.connection_id, self.github_id)
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_date
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubIssue {
    pub connection_id: u64,
    pub github_id: u64,
    pub repo_full_name: String,
    pub number: u64,
    pub title: String,
    pub body: String,
    pub state: String,
    pub labels: Vec<String>,
    /// Standard type derived from labels at extraction time.
    #[serde(rename = "type")]
    pub issue_type: String,
    pub author: String,
    pub assignee: String,
    pub url: String,
    pub created_date: Option<DateTime<Utc>>,
    pub updated_date: Option<DateTime<Utc>>,
    pub closed_date: Option<DateTime<Utc>>,
}

impl Entity for GithubIssue {
    const TABLE: &'static str = "_tool_github_issues";

    fn primary_key(&self) -> String {
        format!("{}:{}", self.connection_id, self.github_id)
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_date
    }
}

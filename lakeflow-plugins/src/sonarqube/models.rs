use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lakeflow_core::stage::Entity;
use lakeflow_core::time::flexible;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiProject {
    pub key: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, with = "flexible")]
    pub last_analysis_date: Option<DateTime<Utc>>,
}

/// `GET projects/search`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiProjectSearch {
    #[serde(default)]
    pub components: Vec<ApiProject>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiPaging {
    pub page_index: usize,
    pub page_size: usize,
    pub total: usize,
}

/// Envelope of `GET issues/search`; only the paging block is read here.
/// Older servers omit it when everything fits on one page.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiIssuePage {
    #[serde(default)]
    pub paging: Option<ApiPaging>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiIssue {
    pub key: String,
    pub rule: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub component: String,
    #[serde(default)]
    pub project: String,
    pub line: Option<i64>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(rename = "type", default)]
    pub issue_type: String,
    #[serde(default, with = "flexible")]
    pub creation_date: Option<DateTime<Utc>>,
    #[serde(default, with = "flexible")]
    pub update_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SonarqubeIssue {
    pub connection_id: u64,
    pub issue_key: String,
    pub project_key: String,
    pub rule: String,
    pub severity: String,
    pub component: String,
    pub line: Option<i64>,
    pub status: String,
    pub message: String,
    #[serde(rename = "type")]
    pub issue_type: String,
    pub creation_date: Option<DateTime<Utc>>,
    pub update_date: Option<DateTime<Utc>>,
}

impl Entity for SonarqubeIssue {
    const TABLE: &'static str = "_tool_sonarqube_issues";

    fn primary_key(&self) -> String {
        format!("{}:{}", self.connection_id, self.issue_key)
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.update_date
    }
}

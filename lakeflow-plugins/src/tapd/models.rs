use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lakeflow_core::stage::Entity;
use lakeflow_core::time::flexible;

use crate::common::string_or_number;

/// `{"Iteration": {...}}` element of `GET iterations`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiIteration {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub name: String,
    #[serde(default, with = "flexible")]
    pub startdate: Option<DateTime<Utc>>,
    #[serde(default, with = "flexible")]
    pub enddate: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub creator: String,
    #[serde(default, with = "flexible")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, with = "flexible")]
    pub modified: Option<DateTime<Utc>>,
    #[serde(default, with = "flexible")]
    pub completed: Option<DateTime<Utc>>,
}

/// `{"Story": {...}}` element of `GET stories`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiStory {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub creator: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub iteration_id: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub parent_id: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub size: String,
    #[serde(default, with = "flexible")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, with = "flexible")]
    pub modified: Option<DateTime<Utc>>,
    #[serde(default, with = "flexible")]
    pub completed: Option<DateTime<Utc>>,
}

/// `{"WorkitemCommitInfo": {...}}` element of `GET code_commit_infos`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiStoryCommit {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub commit_id: String,
    #[serde(default)]
    pub hook_user_name: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub web_url: String,
    #[serde(default, rename = "ref")]
    pub git_ref: String,
    #[serde(default, with = "flexible")]
    pub commit_time: Option<DateTime<Utc>>,
    #[serde(default, with = "flexible")]
    pub created: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TapdIteration {
    pub connection_id: u64,
    pub workspace_id: u64,
    pub id: String,
    pub name: String,
    pub status: String,
    pub creator: String,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
}

impl Entity for TapdIteration {
    const TABLE: &'static str = "_tool_tapd_iterations";

    fn primary_key(&self) -> String {
        format!("{}:{}", self.connection_id, self.id)
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.modified
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TapdStory {
    pub connection_id: u64,
    pub workspace_id: u64,
    pub id: String,
    pub name: String,
    pub description: String,
    pub status: String,
    pub creator: String,
    pub owner: String,
    pub iteration_id: String,
    pub parent_id: String,
    pub priority: String,
    pub size: f64,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
}

impl Entity for TapdStory {
    const TABLE: &'static str = "_tool_tapd_stories";

    fn primary_key(&self) -> String {
        format!("{}:{}", self.connection_id, self.id)
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.modified
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TapdStoryCommit {
    pub connection_id: u64,
    pub workspace_id: u64,
    pub id: String,
    pub story_id: String,
    pub commit_id: String,
    pub hook_user_name: String,
    pub message: String,
    pub web_url: String,
    pub git_ref: String,
    pub commit_time: Option<DateTime<Utc>>,
    pub created: Option<DateTime<Utc>>,
}

impl Entity for TapdStoryCommit {
    const TABLE: &'static str = "_tool_tapd_story_commits";

    fn primary_key(&self) -> String {
        format!("{}:{}", self.connection_id, self.id)
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.created
    }
}

/// Input item for the story-commit collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleStory {
    pub id: String,
}

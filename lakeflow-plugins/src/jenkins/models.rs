use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lakeflow_core::stage::Entity;

/// `GET job/<path>/api/json` as seen by the planner.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiJob {
    pub name: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub color: String,
}

/// One element of `allBuilds`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiBuild {
    pub number: u64,
    /// Start time, epoch milliseconds.
    #[serde(default)]
    pub timestamp: i64,
    /// Milliseconds; zero while building.
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub building: bool,
    pub result: Option<String>,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JenkinsBuild {
    pub connection_id: u64,
    pub job_name: String,
    pub number: u64,
    pub display_name: String,
    pub url: String,
    pub result: String,
    pub building: bool,
    pub duration_ms: u64,
    pub start_time: Option<DateTime<Utc>>,
}

impl JenkinsBuild {
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        if self.building {
            return None;
        }
        let duration = chrono::Duration::milliseconds(i64::try_from(self.duration_ms).ok()?);
        self.start_time.map(|start| start + duration)
    }
}

impl Entity for JenkinsBuild {
    const TABLE: &'static str = "_tool_jenkins_builds";

    fn primary_key(&self) -> String {
        format!("{}:{}#{}", self.connection_id, self.job_name, self.number)
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }
}

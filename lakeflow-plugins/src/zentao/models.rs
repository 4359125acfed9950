use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use lakeflow_core::stage::Entity;
use lakeflow_core::time::flexible;

/// Zentao sends people either as `{"account": .., "realname": ..}` or as a
/// bare account string.
pub fn account_name(value: &Value) -> String {
    match value {
        Value::Object(map) => map
            .get("realname")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .or_else(|| map.get("account").and_then(Value::as_str))
            .unwrap_or_default()
            .to_string(),
        Value::String(s) => s.clone(),
        _ => String::new(),
    }
}

/// Per-status story counts of a product. Unknown keys are ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoryCounts {
    pub active: u32,
    pub reviewing: u32,
    pub draft: u32,
    pub closed: u32,
    pub changing: u32,
}

impl StoryCounts {
    pub fn total(&self) -> u32 {
        self.active + self.reviewing + self.draft + self.closed + self.changing
    }
}

/// `GET products/{id}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiProduct {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub code: String,
    #[serde(rename = "type", default)]
    pub product_type: String,
    #[serde(default)]
    pub status: String,
    #[serde(rename = "desc", default)]
    pub description: String,
    #[serde(default, with = "flexible")]
    pub created_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stories: StoryCounts,
    #[serde(default)]
    pub plans: u32,
    #[serde(default)]
    pub releases: u32,
    #[serde(default)]
    pub bugs: u32,
}

/// One element of `GET products/{id}/stories`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiStory {
    pub id: u64,
    pub product: u64,
    #[serde(default)]
    pub parent: i64,
    pub title: String,
    #[serde(rename = "type", default)]
    pub story_type: String,
    #[serde(default)]
    pub stage: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub pri: u32,
    #[serde(default)]
    pub estimate: f64,
    #[serde(default)]
    pub opened_by: Value,
    #[serde(default)]
    pub assigned_to: Value,
    #[serde(default, with = "flexible")]
    pub opened_date: Option<DateTime<Utc>>,
    #[serde(default, with = "flexible")]
    pub last_edited_date: Option<DateTime<Utc>>,
    #[serde(default, with = "flexible")]
    pub closed_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZentaoProduct {
    pub connection_id: u64,
    pub id: u64,
    pub name: String,
    pub code: String,
    /// `product/<type>`, matching the scope naming.
    #[serde(rename = "type")]
    pub product_type: String,
    pub status: String,
    pub description: String,
    pub created_date: Option<DateTime<Utc>>,
    pub stories: StoryCounts,
    pub plans: u32,
    pub releases: u32,
    pub bugs: u32,
}

impl Entity for ZentaoProduct {
    const TABLE: &'static str = "_tool_zentao_products";

    fn primary_key(&self) -> String {
        format!("{}:{}", self.connection_id, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZentaoStory {
    pub connection_id: u64,
    pub id: u64,
    pub product: u64,
    pub parent: i64,
    pub title: String,
    #[serde(rename = "type")]
    pub story_type: String,
    pub stage: String,
    pub status: String,
    pub pri: u32,
    pub estimate: f64,
    pub opened_by_name: String,
    pub assigned_to_name: String,
    pub opened_date: Option<DateTime<Utc>>,
    pub last_edited_date: Option<DateTime<Utc>>,
    pub closed_date: Option<DateTime<Utc>>,
}

impl Entity for ZentaoStory {
    const TABLE: &'static str = "_tool_zentao_stories";

    fn primary_key(&self) -> String {
        format!("{}:{}", self.connection_id, self.id)
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.last_edited_date
    }
}

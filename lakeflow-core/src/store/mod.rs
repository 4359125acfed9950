//! Layered persistence: raw payloads, tool rows, and domain rows.
//!
//! Raw rows are opaque API payloads appended by collectors, scoped by a
//! canonical params key inside a shared per-entity table. Tool and domain
//! rows are typed records stored as JSON, upserted by primary key and tagged
//! with the raw table and params they were derived from.

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::error::StoreError;

pub use sqlite::SqliteStore;

/// One persisted API payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    pub id: i64,
    /// Canonical JSON of the scope params.
    pub params: String,
    pub data: Vec<u8>,
    pub url: String,
    /// Serialized upstream input item, empty when the collector had none.
    pub input: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl RawRow {
    /// Decode the payload as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.data)
    }

    /// Decode the input item, if one was recorded.
    pub fn input_json<T: serde::de::DeserializeOwned>(
        &self,
    ) -> Result<Option<T>, serde_json::Error> {
        if self.input.is_empty() {
            return Ok(None);
        }
        serde_json::from_slice(&self.input).map(Some)
    }
}

/// A payload about to be appended.
#[derive(Debug, Clone, Default)]
pub struct NewRawRow {
    pub data: Vec<u8>,
    pub url: String,
    pub input: Vec<u8>,
}

/// One typed tool or domain row in storage form.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub id: String,
    pub params: String,
    pub raw_table: String,
    pub raw_id: Option<i64>,
    pub updated_at: Option<DateTime<Utc>>,
    pub data: Value,
}

/// Selects a subset of a typed table.
#[derive(Debug, Clone, Default)]
pub struct RowFilter {
    pub params: Option<String>,
    pub updated_after: Option<DateTime<Utc>>,
}

impl RowFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn params(params: impl Into<String>) -> Self {
        Self {
            params: Some(params.into()),
            updated_after: None,
        }
    }

    pub fn updated_after(mut self, since: Option<DateTime<Utc>>) -> Self {
        self.updated_after = since;
        self
    }
}

/// Identifies one raw table and the params scoping a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDataArgs {
    /// Entity table suffix, e.g. `github_api_issues`.
    pub table: String,
    pub params: Value,
}

impl RawDataArgs {
    pub fn new<P: Serialize>(table: impl Into<String>, params: &P) -> Result<Self, serde_json::Error> {
        Ok(Self {
            table: table.into(),
            params: serde_json::to_value(params)?,
        })
    }

    /// Physical raw table name.
    pub fn raw_table(&self) -> String {
        raw_table_name(&self.table)
    }

    /// Canonical params key; object keys serialize in sorted order.
    pub fn params_key(&self) -> String {
        canonical_json(&self.params)
    }
}

/// Serialize JSON with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    fn sorted(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut entries: Vec<_> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                Value::Object(
                    entries
                        .into_iter()
                        .map(|(k, v)| (k.clone(), sorted(v)))
                        .collect(),
                )
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    sorted(value).to_string()
}

/// `_raw_<plugin>_<entity>` naming for raw tables.
pub fn raw_table_name(table: &str) -> String {
    if table.starts_with("_raw_") {
        table.to_string()
    } else {
        format!("_raw_{table}")
    }
}

/// Append-only store for raw API payloads.
#[async_trait]
pub trait RawDataStore: Send + Sync {
    async fn ensure_raw_table(&self, table: &str) -> Result<(), StoreError>;

    /// Delete every row of `table` recorded under `params`. Returns the count removed.
    async fn truncate_raw(&self, table: &str, params: &str) -> Result<usize, StoreError>;

    /// Append rows in a single transaction.
    async fn append_raw(
        &self,
        table: &str,
        params: &str,
        rows: Vec<NewRawRow>,
    ) -> Result<usize, StoreError>;

    /// Rows of `(table, params)` with `id > after_id`, ascending, at most `limit`.
    async fn raw_rows_after(
        &self,
        table: &str,
        params: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<RawRow>, StoreError>;

    async fn count_raw(&self, table: &str, params: &str) -> Result<usize, StoreError>;
}

/// Upsert store for typed tool and domain rows.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Insert or replace rows by primary key in a single transaction.
    async fn upsert_rows(&self, table: &str, rows: Vec<StoredRow>) -> Result<usize, StoreError>;

    /// Delete rows previously derived from `(raw_table, params)`.
    async fn delete_by_origin(
        &self,
        table: &str,
        raw_table: &str,
        params: &str,
    ) -> Result<usize, StoreError>;

    /// Keyset scan by primary key, ascending.
    async fn rows_after(
        &self,
        table: &str,
        filter: &RowFilter,
        after_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StoredRow>, StoreError>;

    async fn get_row(&self, table: &str, id: &str) -> Result<Option<StoredRow>, StoreError>;

    /// Latest `updated_at` among rows recorded under `params`.
    async fn latest_updated_at(
        &self,
        table: &str,
        params: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn count_rows(&self, table: &str, filter: &RowFilter) -> Result<usize, StoreError>;
}

/// Both storage layers behind one handle.
pub trait Store: RawDataStore + EntityStore {}

impl<T: RawDataStore + EntityStore> Store for T {}

/// Reject anything that is not a plain SQL identifier.
pub(crate) fn validate_table(table: &str) -> Result<(), StoreError> {
    let mut chars = table.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') && table.len() <= 128 {
        Ok(())
    } else {
        Err(StoreError::InvalidTable {
            table: table.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_params_key_is_canonical() {
        #[derive(Serialize)]
        struct A {
            repo: &'static str,
            connection_id: u64,
        }
        #[derive(Serialize)]
        struct B {
            connection_id: u64,
            repo: &'static str,
        }
        let a = RawDataArgs::new("github_api_issues", &A { repo: "lake", connection_id: 1 }).unwrap();
        let b = RawDataArgs::new("github_api_issues", &B { connection_id: 1, repo: "lake" }).unwrap();
        assert_eq!(a.params_key(), b.params_key());
        assert_eq!(a.params_key(), r#"{"connection_id":1,"repo":"lake"}"#);
    }

    #[test]
    fn test_raw_table_name() {
        assert_eq!(raw_table_name("tapd_api_stories"), "_raw_tapd_api_stories");
        assert_eq!(raw_table_name("_raw_tapd_api_stories"), "_raw_tapd_api_stories");
    }

    #[test]
    fn test_validate_table() {
        assert!(validate_table("_tool_github_issues").is_ok());
        assert!(validate_table("issues").is_ok());
        assert!(validate_table("").is_err());
        assert!(validate_table("1abc").is_err());
        assert!(validate_table("issues; DROP TABLE x").is_err());
        assert!(validate_table("a-b").is_err());
    }

    #[test]
    fn test_raw_row_decoding() {
        let row = RawRow {
            id: 1,
            params: "{}".into(),
            data: br#"{"id":5}"#.to_vec(),
            url: "https://x".into(),
            input: Vec::new(),
            created_at: Utc::now(),
        };
        let data: Value = row.json().unwrap();
        assert_eq!(data, json!({"id": 5}));
        let input: Option<Value> = row.input_json().unwrap();
        assert!(input.is_none());
    }
}

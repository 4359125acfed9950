//! Helpers shared by the connector plugins.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use lakeflow_core::collector::parse_json_field;
use lakeflow_core::domain::{Board, BoardIssue, Issue, Repo};
use lakeflow_core::error::{CollectorError, PluginError, StageError};
use lakeflow_core::fetcher::{ApiAuth, ApiResponse, RateLimitedFetcher};
use lakeflow_core::stage::Row;
use lakeflow_core::stage::extractor::extract_error;
use lakeflow_core::store::{EntityStore, RawRow, RowFilter, StoredRow};
use lakeflow_core::{Connection, TaskEnv};

/// A connection together with a fetcher bound to its rate limit.
pub struct ConnectorClient {
    pub connection: Connection,
    pub fetcher: RateLimitedFetcher,
}

impl ConnectorClient {
    pub fn new(
        env: &TaskEnv,
        connection_id: u64,
        auth: impl FnOnce(&Connection) -> ApiAuth,
    ) -> lakeflow_core::Result<Self> {
        let connection = env.connection(connection_id)?.clone();
        let fetcher = env.fetcher(&connection, auth(&connection))?;
        Ok(Self {
            connection,
            fetcher,
        })
    }
}

/// Decode a raw payload, blaming the raw row on failure.
pub fn decode_raw<T: DeserializeOwned>(table: &str, row: &RawRow) -> Result<T, StageError> {
    row.json().map_err(|e| extract_error(table, row, e))
}

/// Decode a raw payload wrapped as `{"<Wrapper>": {...}}`, or unwrapped.
pub fn decode_wrapped<T: DeserializeOwned>(
    table: &str,
    wrapper: &str,
    row: &RawRow,
) -> Result<T, StageError> {
    let mut value: Value = decode_raw(table, row)?;
    if let Some(inner) = value.get_mut(wrapper) {
        value = inner.take();
    }
    serde_json::from_value(value).map_err(|e| extract_error(table, row, e))
}

/// Parse a response whose body is a single JSON object.
pub fn parse_single_object(response: &ApiResponse) -> Result<Vec<Value>, CollectorError> {
    let body: Value = response
        .json()
        .map_err(|e| CollectorError::MalformedResponse {
            url: response.url.clone(),
            message: e.to_string(),
        })?;
    match body {
        Value::Object(_) => Ok(vec![body]),
        Value::Null => Ok(Vec::new()),
        _ => Err(CollectorError::MalformedResponse {
            url: response.url.clone(),
            message: "expected an object".into(),
        }),
    }
}

/// Parse the array at a JSON pointer, e.g. `/data`.
pub fn array_at(pointer: &'static str) -> impl Fn(&ApiResponse) -> Result<Vec<Value>, CollectorError> {
    move |response| parse_json_field(response, Some(pointer))
}

/// Compile an optional user-supplied pattern; blank means none.
pub fn optional_pattern(
    plugin: &str,
    field: &str,
    pattern: Option<&str>,
) -> Result<Option<Regex>, PluginError> {
    match pattern.map(str::trim).filter(|p| !p.is_empty()) {
        None => Ok(None),
        Some(p) => Regex::new(p).map(Some).map_err(|e| PluginError::InvalidOptions {
            plugin: plugin.to_string(),
            message: format!("{field}: {e}"),
        }),
    }
}

/// Upstream APIs that send ids as either strings or numbers.
pub fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

/// Milliseconds since the epoch, as Jenkins reports times.
pub fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    if ms <= 0 {
        return None;
    }
    DateTime::from_timestamp_millis(ms)
}

/// Read every row of `table` matching `filter`, decoded.
pub async fn load_all<T: DeserializeOwned>(
    store: &dyn EntityStore,
    table: &str,
    filter: &RowFilter,
    batch_size: usize,
) -> Result<Vec<(StoredRow, T)>, StageError> {
    let mut out = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let chunk = store
            .rows_after(table, filter, cursor.as_deref(), batch_size)
            .await?;
        let Some(last) = chunk.last() else {
            break;
        };
        cursor = Some(last.id.clone());
        for stored in chunk {
            let value = serde_json::from_value(stored.data.clone()).map_err(|e| StageError::Decode {
                table: table.to_string(),
                message: format!("row '{}': {e}", stored.id),
            })?;
            out.push((stored, value));
        }
    }
    Ok(out)
}

/// Ticket conversions emit an issue and its board link.
#[derive(Debug, Clone, PartialEq)]
pub enum TicketRow {
    Issue(Issue),
    BoardIssue(BoardIssue),
}

impl Row for TicketRow {
    fn table(&self) -> &'static str {
        match self {
            TicketRow::Issue(r) => r.table(),
            TicketRow::BoardIssue(r) => r.table(),
        }
    }

    fn primary_key(&self) -> String {
        match self {
            TicketRow::Issue(r) => Row::primary_key(r),
            TicketRow::BoardIssue(r) => Row::primary_key(r),
        }
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        match self {
            TicketRow::Issue(r) => Row::updated_at(r),
            TicketRow::BoardIssue(r) => Row::updated_at(r),
        }
    }

    fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            TicketRow::Issue(r) => r.to_value(),
            TicketRow::BoardIssue(r) => r.to_value(),
        }
    }
}

/// Scope conversions emit a repo, a board, or both.
#[derive(Debug, Clone, PartialEq)]
pub enum ScopeRow {
    Repo(Repo),
    Board(Board),
}

impl Row for ScopeRow {
    fn table(&self) -> &'static str {
        match self {
            ScopeRow::Repo(r) => r.table(),
            ScopeRow::Board(r) => r.table(),
        }
    }

    fn primary_key(&self) -> String {
        match self {
            ScopeRow::Repo(r) => Row::primary_key(r),
            ScopeRow::Board(r) => Row::primary_key(r),
        }
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        match self {
            ScopeRow::Repo(r) => Row::updated_at(r),
            ScopeRow::Board(r) => Row::updated_at(r),
        }
    }

    fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            ScopeRow::Repo(r) => r.to_value(),
            ScopeRow::Board(r) => r.to_value(),
        }
    }
}

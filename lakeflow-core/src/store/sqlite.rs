//! SQLite implementation of the raw and entity stores.
//!
//! A single connection sits behind a mutex; every call runs on the blocking
//! pool via `spawn_blocking`. Each append or upsert batch is one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params, params_from_iter, types::Value as SqlValue};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::{
    EntityStore, NewRawRow, RawDataStore, RawRow, RowFilter, StoredRow, validate_table,
};
use crate::error::StoreError;
use crate::time::to_storage;

/// Embedded SQL store shared by all tasks of a run.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open (or create) a database file.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = rusqlite::Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")?;
        Ok(Self::from_connection(conn))
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self::from_connection(rusqlite::Connection::open_in_memory()?))
    }

    fn from_connection(conn: rusqlite::Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Join {
            message: e.to_string(),
        })?
    }
}

fn create_raw_table(conn: &rusqlite::Connection, table: &str) -> Result<(), StoreError> {
    validate_table(table)?;
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS \"{table}\" (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            params TEXT NOT NULL,
            data BLOB NOT NULL,
            url TEXT NOT NULL,
            input BLOB NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS \"{table}_params\" ON \"{table}\" (params, id);"
    ))?;
    Ok(())
}

fn create_entity_table(conn: &rusqlite::Connection, table: &str) -> Result<(), StoreError> {
    validate_table(table)?;
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS \"{table}\" (
            id TEXT PRIMARY KEY,
            params TEXT NOT NULL,
            raw_table TEXT NOT NULL,
            raw_id INTEGER,
            updated_at TEXT,
            data TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS \"{table}_origin\" ON \"{table}\" (raw_table, params);
        CREATE INDEX IF NOT EXISTS \"{table}_updated\" ON \"{table}\" (params, updated_at);"
    ))?;
    Ok(())
}

fn parse_ts(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

fn filter_clause(filter: &RowFilter, values: &mut Vec<SqlValue>) -> String {
    let mut clauses = Vec::new();
    if let Some(params) = &filter.params {
        values.push(SqlValue::Text(params.clone()));
        clauses.push(format!("params = ?{}", values.len()));
    }
    if let Some(since) = &filter.updated_after {
        values.push(SqlValue::Text(to_storage(since)));
        clauses.push(format!("updated_at > ?{}", values.len()));
    }
    clauses.join(" AND ")
}

#[async_trait]
impl RawDataStore for SqliteStore {
    async fn ensure_raw_table(&self, table: &str) -> Result<(), StoreError> {
        let table = table.to_string();
        self.with_conn(move |conn| create_raw_table(conn, &table))
            .await
    }

    async fn truncate_raw(&self, table: &str, params: &str) -> Result<usize, StoreError> {
        let (table, params) = (table.to_string(), params.to_string());
        self.with_conn(move |conn| {
            create_raw_table(conn, &table)?;
            let n = conn.execute(
                &format!("DELETE FROM \"{table}\" WHERE params = ?1"),
                params![params],
            )?;
            Ok(n)
        })
        .await
    }

    async fn append_raw(
        &self,
        table: &str,
        params: &str,
        rows: Vec<NewRawRow>,
    ) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let (table, params) = (table.to_string(), params.to_string());
        self.with_conn(move |conn| {
            create_raw_table(conn, &table)?;
            let created_at = to_storage(&Utc::now());
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(&format!(
                    "INSERT INTO \"{table}\" (params, data, url, input, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)"
                ))?;
                for row in &rows {
                    stmt.execute(params![params, row.data, row.url, row.input, created_at])?;
                }
            }
            tx.commit()?;
            Ok(rows.len())
        })
        .await
    }

    async fn raw_rows_after(
        &self,
        table: &str,
        params: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<RawRow>, StoreError> {
        let (table, params) = (table.to_string(), params.to_string());
        self.with_conn(move |conn| {
            create_raw_table(conn, &table)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT id, params, data, url, input, created_at FROM \"{table}\"
                 WHERE params = ?1 AND id > ?2 ORDER BY id LIMIT ?3"
            ))?;
            let rows = stmt
                .query_map(params![params, after_id, limit as i64], |row| {
                    Ok(RawRow {
                        id: row.get(0)?,
                        params: row.get(1)?,
                        data: row.get(2)?,
                        url: row.get(3)?,
                        input: row.get(4)?,
                        created_at: parse_ts(row.get(5)?).unwrap_or_default(),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn count_raw(&self, table: &str, params: &str) -> Result<usize, StoreError> {
        let (table, params) = (table.to_string(), params.to_string());
        self.with_conn(move |conn| {
            create_raw_table(conn, &table)?;
            let n: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM \"{table}\" WHERE params = ?1"),
                params![params],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
        .await
    }
}

#[async_trait]
impl EntityStore for SqliteStore {
    async fn upsert_rows(&self, table: &str, rows: Vec<StoredRow>) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let table = table.to_string();
        self.with_conn(move |conn| {
            create_entity_table(conn, &table)?;
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(&format!(
                    "INSERT INTO \"{table}\" (id, params, raw_table, raw_id, updated_at, data)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(id) DO UPDATE SET
                        params = excluded.params,
                        raw_table = excluded.raw_table,
                        raw_id = excluded.raw_id,
                        updated_at = excluded.updated_at,
                        data = excluded.data"
                ))?;
                for row in &rows {
                    stmt.execute(params![
                        row.id,
                        row.params,
                        row.raw_table,
                        row.raw_id,
                        row.updated_at.as_ref().map(to_storage),
                        serde_json::to_string(&row.data)?,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(rows.len())
        })
        .await
    }

    async fn delete_by_origin(
        &self,
        table: &str,
        raw_table: &str,
        params: &str,
    ) -> Result<usize, StoreError> {
        let (table, raw_table, params) =
            (table.to_string(), raw_table.to_string(), params.to_string());
        self.with_conn(move |conn| {
            create_entity_table(conn, &table)?;
            let n = conn.execute(
                &format!("DELETE FROM \"{table}\" WHERE raw_table = ?1 AND params = ?2"),
                params![raw_table, params],
            )?;
            Ok(n)
        })
        .await
    }

    async fn rows_after(
        &self,
        table: &str,
        filter: &RowFilter,
        after_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StoredRow>, StoreError> {
        let table = table.to_string();
        let filter = filter.clone();
        let after_id = after_id.map(str::to_string);
        self.with_conn(move |conn| {
            create_entity_table(conn, &table)?;
            let mut values = Vec::new();
            let mut clause = filter_clause(&filter, &mut values);
            if let Some(after) = after_id {
                values.push(SqlValue::Text(after));
                if !clause.is_empty() {
                    clause.push_str(" AND ");
                }
                clause.push_str(&format!("id > ?{}", values.len()));
            }
            values.push(SqlValue::Integer(limit as i64));
            let limit_idx = values.len();
            let where_sql = if clause.is_empty() {
                String::new()
            } else {
                format!("WHERE {clause}")
            };
            let mut stmt = conn.prepare(&format!(
                "SELECT id, params, raw_table, raw_id, updated_at, data FROM \"{table}\"
                 {where_sql} ORDER BY id LIMIT ?{limit_idx}"
            ))?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|(id, params, raw_table, raw_id, updated_at, data)| -> Result<StoredRow, StoreError> {
                    Ok(StoredRow {
                        id,
                        params,
                        raw_table,
                        raw_id,
                        updated_at: parse_ts(updated_at),
                        data: serde_json::from_str(&data)?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn get_row(&self, table: &str, id: &str) -> Result<Option<StoredRow>, StoreError> {
        let (table, id) = (table.to_string(), id.to_string());
        self.with_conn(move |conn| {
            create_entity_table(conn, &table)?;
            let found = conn
                .query_row(
                    &format!(
                        "SELECT id, params, raw_table, raw_id, updated_at, data
                         FROM \"{table}\" WHERE id = ?1"
                    ),
                    params![id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Option<i64>>(3)?,
                            row.get::<_, Option<String>>(4)?,
                            row.get::<_, String>(5)?,
                        ))
                    },
                )
                .optional()?;
            match found {
                Some((id, params, raw_table, raw_id, updated_at, data)) => Ok(Some(StoredRow {
                    id,
                    params,
                    raw_table,
                    raw_id,
                    updated_at: parse_ts(updated_at),
                    data: serde_json::from_str(&data)?,
                })),
                None => Ok(None),
            }
        })
        .await
    }

    async fn latest_updated_at(
        &self,
        table: &str,
        params: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let (table, params) = (table.to_string(), params.to_string());
        self.with_conn(move |conn| {
            create_entity_table(conn, &table)?;
            let latest: Option<String> = conn.query_row(
                &format!("SELECT MAX(updated_at) FROM \"{table}\" WHERE params = ?1"),
                params![params],
                |row| row.get(0),
            )?;
            Ok(parse_ts(latest))
        })
        .await
    }

    async fn count_rows(&self, table: &str, filter: &RowFilter) -> Result<usize, StoreError> {
        let table = table.to_string();
        let filter = filter.clone();
        self.with_conn(move |conn| {
            create_entity_table(conn, &table)?;
            let mut values = Vec::new();
            let clause = filter_clause(&filter, &mut values);
            let where_sql = if clause.is_empty() {
                String::new()
            } else {
                format!("WHERE {clause}")
            };
            let n: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM \"{table}\" {where_sql}"),
                params_from_iter(values.iter()),
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
        .await
    }
}

//! Extraction and conversion stages.
//!
//! Both stages stream rows in chunks through a pure mapping function that can
//! emit any number of outputs per input, and write outputs through a
//! [`BatchSaveDivider`] so re-running a stage replaces what it produced before.

pub mod converter;
pub mod didgen;
pub mod extractor;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::error::StoreError;
use crate::store::{Store, StoredRow};

pub use converter::DataConverter;
pub use didgen::{DomainId, DomainIdGenerator};
pub use extractor::ApiExtractor;

/// A typed record with its own table.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TABLE: &'static str;

    fn primary_key(&self) -> String;

    /// Source-side modification time, used as the incremental watermark.
    fn updated_at(&self) -> Option<DateTime<Utc>> {
        None
    }
}

/// Anything a stage can write: a single entity or a closed enum over several.
pub trait Row: Send + 'static {
    fn table(&self) -> &'static str;
    fn primary_key(&self) -> String;
    fn updated_at(&self) -> Option<DateTime<Utc>>;
    fn to_value(&self) -> Result<serde_json::Value, serde_json::Error>;
}

impl<E: Entity> Row for E {
    fn table(&self) -> &'static str {
        E::TABLE
    }

    fn primary_key(&self) -> String {
        Entity::primary_key(self)
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        Entity::updated_at(self)
    }

    fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// Where a stage's outputs came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub raw_table: String,
    pub params: String,
}

impl Origin {
    pub fn new(raw_table: impl Into<String>, params: impl Into<String>) -> Self {
        Self {
            raw_table: raw_table.into(),
            params: params.into(),
        }
    }
}

/// Batches output rows per table and clears stale rows on first touch.
///
/// The first time a table is written in a run, rows previously produced from
/// the same origin are deleted, so repeated runs over the same raw data
/// converge to the same table contents.
pub struct BatchSaveDivider {
    store: Arc<dyn Store>,
    origin: Origin,
    batch_size: usize,
    batches: BTreeMap<&'static str, Vec<StoredRow>>,
    touched: HashSet<&'static str>,
    saved: usize,
}

impl BatchSaveDivider {
    pub fn new(store: Arc<dyn Store>, origin: Origin, batch_size: usize) -> Self {
        Self {
            store,
            origin,
            batch_size: batch_size.max(1),
            batches: BTreeMap::new(),
            touched: HashSet::new(),
            saved: 0,
        }
    }

    /// Queue a row, flushing its table's batch when full.
    pub async fn push<R: Row + ?Sized>(
        &mut self,
        row: &R,
        raw_id: Option<i64>,
    ) -> Result<(), StoreError> {
        let table = row.table();
        if self.touched.insert(table) {
            let removed = self
                .store
                .delete_by_origin(table, &self.origin.raw_table, &self.origin.params)
                .await?;
            if removed > 0 {
                tracing::debug!(table, removed, "Cleared rows from previous run");
            }
        }

        let stored = StoredRow {
            id: row.primary_key(),
            params: self.origin.params.clone(),
            raw_table: self.origin.raw_table.clone(),
            raw_id,
            updated_at: row.updated_at(),
            data: row.to_value()?,
        };
        let batch = self.batches.entry(table).or_default();
        batch.push(stored);
        if batch.len() >= self.batch_size {
            let rows = std::mem::take(batch);
            self.saved += self.store.upsert_rows(table, rows).await?;
        }
        Ok(())
    }

    /// Mark a table as produced even if no rows end up in it.
    pub async fn touch(&mut self, table: &'static str) -> Result<(), StoreError> {
        if self.touched.insert(table) {
            self.store
                .delete_by_origin(table, &self.origin.raw_table, &self.origin.params)
                .await?;
        }
        Ok(())
    }

    /// Flush all pending batches; returns the total rows written.
    pub async fn close(mut self) -> Result<usize, StoreError> {
        let batches = std::mem::take(&mut self.batches);
        for (table, rows) in batches {
            if !rows.is_empty() {
                self.saved += self.store.upsert_rows(table, rows).await?;
            }
        }
        Ok(self.saved)
    }
}

/// Counters reported by a stage run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageStats {
    pub inputs: usize,
    pub outputs: usize,
}

//! Incremental collection windows.
//!
//! The watermark is never stored separately: it is the latest `updated_at`
//! among tool rows already extracted for the same params.

use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::store::EntityStore;

/// Lower time bound and mode for one collector run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionWindow {
    /// Only records updated after this instant are requested.
    pub since: Option<DateTime<Utc>>,
    /// Incremental runs append raw rows instead of truncating them first.
    pub incremental: bool,
}

impl CollectionWindow {
    /// Collect everything, replacing prior raw rows.
    pub fn full() -> Self {
        Self::default()
    }

    /// Decide the window for a run.
    ///
    /// An explicit `since` wins and forces a full (truncating) run over that
    /// range. Otherwise the watermark from `tool_table` makes the run
    /// incremental; without one the run is a full sync.
    pub async fn resolve(
        store: &dyn EntityStore,
        tool_table: &str,
        params: &str,
        explicit_since: Option<DateTime<Utc>>,
    ) -> Result<Self, StoreError> {
        if let Some(since) = explicit_since {
            return Ok(Self {
                since: Some(since),
                incremental: false,
            });
        }
        let watermark = store.latest_updated_at(tool_table, params).await?;
        match watermark {
            Some(since) => {
                tracing::info!(table = tool_table, since = %since, "Resuming incremental collection");
                Ok(Self {
                    since: Some(since),
                    incremental: true,
                })
            }
            None => Ok(Self::full()),
        }
    }
}

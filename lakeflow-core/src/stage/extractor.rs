//! Raw payloads to tool rows.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{BatchSaveDivider, Origin, Row, StageStats};
use crate::error::StageError;
use crate::progress::Progress;
use crate::store::{RawDataArgs, RawRow, Store};

pub type ExtractFn<O> = Arc<dyn Fn(&RawRow) -> Result<Vec<O>, StageError> + Send + Sync>;

const DEFAULT_BATCH_SIZE: usize = 500;

/// Streams one raw table through an extraction function.
///
/// Every output row records the id of the raw row it came from. Rows an
/// earlier run produced from the same raw table and params are replaced.
pub struct ApiExtractor<O> {
    raw: RawDataArgs,
    store: Arc<dyn Store>,
    extract: ExtractFn<O>,
    batch_size: usize,
    produces: Vec<&'static str>,
    cancel: CancellationToken,
    progress: Progress,
}

impl<O: Row> ApiExtractor<O> {
    pub fn new(
        raw: RawDataArgs,
        store: Arc<dyn Store>,
        extract: impl Fn(&RawRow) -> Result<Vec<O>, StageError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            raw,
            store,
            extract: Arc::new(extract),
            batch_size: DEFAULT_BATCH_SIZE,
            produces: Vec::new(),
            cancel: CancellationToken::new(),
            progress: Progress::new(),
        }
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Tables to clear even when the raw table turns out empty.
    pub fn produces(mut self, tables: &[&'static str]) -> Self {
        self.produces.extend_from_slice(tables);
        self
    }

    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    pub async fn execute(self) -> Result<StageStats, StageError> {
        let raw_table = self.raw.raw_table();
        let params = self.raw.params_key();
        self.store.ensure_raw_table(&raw_table).await?;

        let total = self.store.count_raw(&raw_table, &params).await?;
        self.progress.set_total(total);
        info!(table = %raw_table, rows = total, "Extracting");

        let mut divider = BatchSaveDivider::new(
            Arc::clone(&self.store),
            Origin::new(raw_table.clone(), params.clone()),
            self.batch_size,
        );
        for table in &self.produces {
            divider.touch(table).await?;
        }

        let mut stats = StageStats::default();
        let mut cursor = 0i64;
        loop {
            if self.cancel.is_cancelled() {
                return Err(StageError::Cancelled);
            }
            let chunk = self
                .store
                .raw_rows_after(&raw_table, &params, cursor, self.batch_size)
                .await?;
            let Some(last) = chunk.last() else {
                break;
            };
            cursor = last.id;

            for row in &chunk {
                let outputs = (self.extract)(row)?;
                stats.inputs += 1;
                stats.outputs += outputs.len();
                for output in &outputs {
                    divider.push(output, Some(row.id)).await?;
                }
            }
            self.progress.inc(chunk.len());
            debug!(table = %raw_table, cursor, "Extracted chunk");
        }

        divider.close().await?;
        info!(
            table = %raw_table,
            inputs = stats.inputs,
            outputs = stats.outputs,
            "Extraction finished"
        );
        Ok(stats)
    }
}

/// Wrap a JSON decoding failure with the raw row it came from.
pub fn extract_error(table: &str, row: &RawRow, err: impl std::fmt::Display) -> StageError {
    StageError::Extract {
        table: table.to_string(),
        raw_id: row.id,
        message: err.to_string(),
    }
}

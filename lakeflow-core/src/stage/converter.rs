//! Tool rows to domain rows.

use std::marker::PhantomData;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{BatchSaveDivider, Entity, Origin, Row, StageStats};
use crate::error::StageError;
use crate::progress::Progress;
use crate::store::{RawDataArgs, RowFilter, Store};

pub type ConvertFn<I, O> = Arc<dyn Fn(I) -> Result<Vec<O>, StageError> + Send + Sync>;

const DEFAULT_BATCH_SIZE: usize = 500;

/// Scans the tool table of `I` for one params key and maps rows to domain rows.
///
/// Outputs inherit the raw provenance of their input row.
pub struct DataConverter<I, O> {
    raw: RawDataArgs,
    store: Arc<dyn Store>,
    convert: ConvertFn<I, O>,
    batch_size: usize,
    produces: Vec<&'static str>,
    cancel: CancellationToken,
    progress: Progress,
    _input: PhantomData<fn() -> I>,
}

impl<I: Entity, O: Row> DataConverter<I, O> {
    pub fn new(
        raw: RawDataArgs,
        store: Arc<dyn Store>,
        convert: impl Fn(I) -> Result<Vec<O>, StageError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            raw,
            store,
            convert: Arc::new(convert),
            batch_size: DEFAULT_BATCH_SIZE,
            produces: Vec::new(),
            cancel: CancellationToken::new(),
            progress: Progress::new(),
            _input: PhantomData,
        }
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Tables to clear even when no tool rows exist.
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
        let params = self.raw.params_key();
        let filter = RowFilter::params(params.clone());
        let total = self.store.count_rows(I::TABLE, &filter).await?;
        self.progress.set_total(total);
        info!(table = I::TABLE, rows = total, "Converting");

        let mut divider = BatchSaveDivider::new(
            Arc::clone(&self.store),
            Origin::new(self.raw.raw_table(), params),
            self.batch_size,
        );
        for table in &self.produces {
            divider.touch(table).await?;
        }

        let mut stats = StageStats::default();
        let mut cursor: Option<String> = None;
        loop {
            if self.cancel.is_cancelled() {
                return Err(StageError::Cancelled);
            }
            let chunk = self
                .store
                .rows_after(I::TABLE, &filter, cursor.as_deref(), self.batch_size)
                .await?;
            let Some(last) = chunk.last() else {
                break;
            };
            cursor = Some(last.id.clone());

            for stored in chunk.iter() {
                let input: I =
                    serde_json::from_value(stored.data.clone()).map_err(|e| StageError::Decode {
                        table: I::TABLE.to_string(),
                        message: format!("row '{}': {e}", stored.id),
                    })?;
                let outputs = (self.convert)(input)?;
                stats.inputs += 1;
                stats.outputs += outputs.len();
                for output in &outputs {
                    divider.push(output, stored.raw_id).await?;
                }
            }
            self.progress.inc(chunk.len());
            debug!(table = I::TABLE, cursor = ?cursor, "Converted chunk");
        }

        divider.close().await?;
        info!(
            table = I::TABLE,
            inputs = stats.inputs,
            outputs = stats.outputs,
            "Conversion finished"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::testing::Widget;
    use crate::store::{EntityStore, SqliteStore, StoredRow};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct Gadget {
        id: String,
        title: String,
    }

    impl Entity for Gadget {
        const TABLE: &'static str = "gadgets";

        fn primary_key(&self) -> String {
            self.id.clone()
        }
    }

    fn raw() -> RawDataArgs {
        RawDataArgs::new("demo_api_widgets", &json!({"connectionId": 1})).unwrap()
    }

    async fn seed_tool_rows(store: &SqliteStore, params: &str, ids: &[u64]) {
        let rows = ids
            .iter()
            .map(|id| StoredRow {
                id: id.to_string(),
                params: params.to_string(),
                raw_table: "_raw_demo_api_widgets".into(),
                raw_id: Some(*id as i64 + 100),
                updated_at: None,
                data: json!({"id": id, "name": format!("w{id}")}),
            })
            .collect();
        store.upsert_rows(Widget::TABLE, rows).await.unwrap();
    }

    fn to_gadget(w: Widget) -> Result<Vec<Gadget>, StageError> {
        Ok(vec![Gadget {
            id: format!("demo:Widget:1:{}", w.id),
            title: w.name,
        }])
    }

    #[tokio::test]
    async fn test_convert_only_scans_matching_params() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let args = raw();
        seed_tool_rows(&store, &args.params_key(), &[1, 2, 3]).await;
        seed_tool_rows(&store, r#"{"connectionId":2}"#, &[4]).await;

        let stats = DataConverter::new(args, store.clone(), to_gadget)
            .batch_size(2)
            .execute()
            .await
            .unwrap();
        assert_eq!(stats, StageStats { inputs: 3, outputs: 3 });

        let gadget = store.get_row("gadgets", "demo:Widget:1:2").await.unwrap().unwrap();
        assert_eq!(gadget.raw_id, Some(102));
        assert_eq!(gadget.data["title"], "w2");
        assert!(store.get_row("gadgets", "demo:Widget:1:4").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_convert_error_stops_stage() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let args = raw();
        seed_tool_rows(&store, &args.params_key(), &[1]).await;

        let err = DataConverter::new(args, store, |w: Widget| -> Result<Vec<Gadget>, StageError> {
            Err(StageError::Convert {
                table: Widget::TABLE.into(),
                id: w.id.to_string(),
                message: "bad".into(),
            })
        })
        .execute()
        .await
        .unwrap_err();
        assert!(err.to_string().contains("'1'"));
    }
}

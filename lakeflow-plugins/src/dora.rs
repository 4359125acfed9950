//! DORA enrichment: marks production deployments among CI/CD tasks.
//!
//! Tasks whose connector already classified the environment are left alone.

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use lakeflow_core::domain::{CicdTask, cicd};
use lakeflow_core::error::StageError;
use lakeflow_core::plugin::decode_options;
use lakeflow_core::stage::Entity;
use lakeflow_core::store::{RowFilter, StoredRow};
use lakeflow_core::{DomainType, Plugin, Result, SubTask, SubTaskContext, SubTaskMeta, TaskEnv, entry};

use crate::common::{load_all, optional_pattern};

pub const NAME: &str = "dora";

pub const DEFAULT_PRODUCTION_PATTERN: &str = "(?i)prod";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoraOptions {
    #[serde(default)]
    pub production_pattern: Option<String>,
}

pub struct DoraTaskData {
    pub production: Regex,
    pub batch_size: usize,
}

/// The task with its environment set, or `None` when nothing changes.
pub fn enrich_environment(task: &CicdTask, production: &Regex) -> Option<CicdTask> {
    if task.environment.is_some() || !production.is_match(&task.name) {
        return None;
    }
    Some(CicdTask {
        environment: Some(cicd::PRODUCTION.to_string()),
        ..task.clone()
    })
}

fn enrich_task_env(ctx: &SubTaskContext<DoraTaskData>) -> BoxFuture<'_, Result<()>> {
    async move {
        let data = &ctx.data;
        let tasks = load_all::<CicdTask>(
            ctx.store.as_ref(),
            CicdTask::TABLE,
            &RowFilter::all(),
            data.batch_size,
        )
        .await?;
        let scanned = tasks.len();

        let mut updated = 0;
        let mut batch: Vec<StoredRow> = Vec::new();
        for (stored, task) in tasks {
            let Some(enriched) = enrich_environment(&task, &data.production) else {
                continue;
            };
            // Provenance columns stay as the converter wrote them.
            batch.push(StoredRow {
                data: serde_json::to_value(&enriched)?,
                ..stored
            });
            if batch.len() >= data.batch_size {
                if ctx.cancel.is_cancelled() {
                    return Err(StageError::Cancelled.into());
                }
                updated += ctx
                    .store
                    .upsert_rows(CicdTask::TABLE, std::mem::take(&mut batch))
                    .await?;
            }
        }
        if !batch.is_empty() {
            updated += ctx.store.upsert_rows(CicdTask::TABLE, batch).await?;
        }
        info!(scanned, updated, "Enriched task environments");
        Ok(())
    }
    .boxed()
}

#[derive(Debug, Default)]
pub struct Dora;

#[async_trait]
impl Plugin for Dora {
    type TaskData = DoraTaskData;

    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Enrich CI/CD tasks for DORA metrics"
    }

    fn root_package_path(&self) -> &'static str {
        "lakeflow/plugins/dora"
    }

    fn subtasks(&self) -> Vec<SubTask<DoraTaskData>> {
        vec![SubTask::new(
            SubTaskMeta::new("EnrichTaskEnv")
                .description("Mark CI/CD tasks that deploy to production")
                .domain_types(&[DomainType::Cicd]),
            entry(enrich_task_env),
        )]
    }

    async fn prepare_task_data(&self, options: &Value, env: &TaskEnv) -> Result<DoraTaskData> {
        let options: DoraOptions = decode_options(NAME, options)?;
        let production = optional_pattern(NAME, "productionPattern", options.production_pattern.as_deref())?;
        let production = match production {
            Some(re) => re,
            None => Regex::new(DEFAULT_PRODUCTION_PATTERN).map_err(|e| {
                lakeflow_core::error::PluginError::InvalidOptions {
                    plugin: NAME.to_string(),
                    message: e.to_string(),
                }
            })?,
        };
        Ok(DoraTaskData {
            production,
            batch_size: env.batch_size(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(name: &str, environment: Option<&str>) -> CicdTask {
        CicdTask {
            id: format!("jenkins:JenkinsBuild:1:{name}#1"),
            name: name.into(),
            environment: environment.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_enrich_environment() {
        let production = Regex::new(DEFAULT_PRODUCTION_PATTERN).unwrap();
        let enriched = enrich_environment(&task("deploy-Prod", None), &production).unwrap();
        assert_eq!(enriched.environment.as_deref(), Some(cicd::PRODUCTION));

        assert!(enrich_environment(&task("unit-test", None), &production).is_none());
        assert!(enrich_environment(&task("deploy-prod", Some(cicd::TESTING)), &production).is_none());
    }
}

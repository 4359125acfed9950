use futures::FutureExt;
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::info;

use lakeflow_core::collector::{ApiCollector, UrlTemplate};
use lakeflow_core::domain::{CicdTask, cicd};
use lakeflow_core::stage::{ApiExtractor, DataConverter, DomainIdGenerator, Entity};
use lakeflow_core::store::RawDataArgs;
use lakeflow_core::{Result, SubTaskContext};

use super::models::{ApiBuild, JenkinsBuild};
use super::{JenkinsTaskData, NAME, job_path};
use crate::common::{array_at, decode_raw, from_millis};

pub const RAW_BUILD_TABLE: &str = "jenkins_api_builds";

const BUILD_FIELDS: &str = "number,timestamp,duration,building,result,displayName,url";

type Ctx = SubTaskContext<JenkinsTaskData>;

fn raw_args(data: &JenkinsTaskData) -> Result<RawDataArgs> {
    Ok(RawDataArgs::new(RAW_BUILD_TABLE, &data.params)?)
}

/// Normalize a Jenkins build result.
pub fn build_result(result: &str) -> String {
    match result {
        "SUCCESS" => cicd::SUCCESS.to_string(),
        "FAILURE" | "UNSTABLE" => cicd::FAILURE.to_string(),
        "ABORTED" => cicd::ABORT.to_string(),
        other => other.to_string(),
    }
}

pub(super) fn collect_builds(ctx: &Ctx) -> BoxFuture<'_, Result<()>> {
    async move {
        let data = &ctx.data;
        let path = format!("{}/api/json", job_path(&data.params.job_full_name));
        let stats = ApiCollector::<()>::new(
            raw_args(data)?,
            data.client.fetcher.clone(),
            Arc::clone(&ctx.store),
            UrlTemplate::func(move |_| Ok(path.clone())),
            array_at("/allBuilds"),
        )
        .page_size(100)
        .query(|req| {
            let skip = req.pager.skip;
            Ok(vec![(
                "tree".to_string(),
                format!("allBuilds[{BUILD_FIELDS}]{{{skip},{}}}", skip + req.pager.size),
            )])
        })
        .progress(ctx.progress.clone())
        .execute()
        .await?;
        info!(
            job = %data.params.job_full_name,
            requests = stats.requests,
            rows = stats.rows,
            "Collected builds"
        );
        Ok(())
    }
    .boxed()
}

pub(super) fn extract_builds(ctx: &Ctx) -> BoxFuture<'_, Result<()>> {
    async move {
        let data = &ctx.data;
        let connection_id = data.params.connection_id;
        let job_name = data.params.job_full_name.clone();
        ApiExtractor::new(raw_args(data)?, Arc::clone(&ctx.store), move |row| {
            let api: ApiBuild = decode_raw(RAW_BUILD_TABLE, row)?;
            Ok(vec![JenkinsBuild {
                connection_id,
                job_name: job_name.clone(),
                number: api.number,
                display_name: api.display_name,
                url: api.url,
                result: api.result.unwrap_or_default(),
                building: api.building,
                duration_ms: u64::try_from(api.duration).unwrap_or(0),
                start_time: from_millis(api.timestamp),
            }])
        })
        .batch_size(data.batch_size)
        .produces(&[JenkinsBuild::TABLE])
        .cancellation(ctx.cancel.clone())
        .progress(ctx.progress.clone())
        .execute()
        .await?;
        Ok(())
    }
    .boxed()
}

pub(super) fn convert_builds(ctx: &Ctx) -> BoxFuture<'_, Result<()>> {
    async move {
        let data = &ctx.data;
        let rules = data.rules.clone();
        let build_ids = DomainIdGenerator::new(NAME, "JenkinsBuild");
        let pipeline_id = DomainIdGenerator::new(NAME, "JenkinsJob")
            .generate(data.params.connection_id, &data.params.job_full_name);
        DataConverter::<JenkinsBuild, CicdTask>::new(
            raw_args(data)?,
            Arc::clone(&ctx.store),
            move |build| {
                let finished = build.finished_at();
                Ok(vec![CicdTask {
                    id: build_ids.generate(
                        build.connection_id,
                        format!("{}#{}", build.job_name, build.number),
                    ),
                    pipeline_id: pipeline_id.clone(),
                    result: build_result(&build.result),
                    status: if build.building {
                        cicd::IN_PROGRESS.to_string()
                    } else {
                        cicd::DONE.to_string()
                    },
                    task_type: rules.task_type(&build.job_name).to_string(),
                    environment: rules.environment(&build.job_name).map(str::to_string),
                    duration_sec: build.duration_ms / 1000,
                    started_date: build.start_time,
                    finished_date: finished,
                    name: build.job_name,
                }])
            },
        )
        .batch_size(data.batch_size)
        .cancellation(ctx.cancel.clone())
        .progress(ctx.progress.clone())
        .execute()
        .await?;
        Ok(())
    }
    .boxed()
}

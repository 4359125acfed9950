//! Pairs consecutive release tags of a repository.
//!
//! Tags are filtered by `tagsPattern`, sorted by `tagsOrder`, truncated to
//! `tagsLimit`, and every adjacent pair becomes a [`RefPair`] with the earlier
//! tag in sort order as the new side.

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use regex::Regex;
use semver::Version;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::info;

use lakeflow_core::domain::{Ref, RefPair, ref_type};
use lakeflow_core::plugin::decode_options;
use lakeflow_core::stage::{BatchSaveDivider, Entity, Origin};
use lakeflow_core::store::{RawDataArgs, RowFilter};
use lakeflow_core::{DomainType, Plugin, Result, SubTask, SubTaskContext, SubTaskMeta, TaskEnv, entry};

use crate::common::{load_all, optional_pattern};

pub const NAME: &str = "refdiff";

const ORIGIN_TABLE: &str = "refdiff";

/// How tags are ordered before pairing; the first tag is the newest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TagsOrder {
    Alphabetically,
    ReverseAlphabetically,
    Semver,
    #[default]
    ReverseSemver,
}

impl<'de> Deserialize<'de> for TagsOrder {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw.as_deref().unwrap_or_default() {
            "" | "reverse semver" => Ok(TagsOrder::ReverseSemver),
            "semver" => Ok(TagsOrder::Semver),
            "alphabetically" => Ok(TagsOrder::Alphabetically),
            "reverse alphabetically" => Ok(TagsOrder::ReverseAlphabetically),
            other => Err(serde::de::Error::custom(format!("unknown tagsOrder '{other}'"))),
        }
    }
}

fn tags_limit<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<usize>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => {
            let limit = n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64))
                .ok_or_else(|| serde::de::Error::custom(format!("invalid tagsLimit {n}")))?;
            // Zero means no limit.
            Ok((limit > 0).then_some(limit as usize))
        }
        Some(other) => Err(serde::de::Error::custom(format!("invalid tagsLimit {other}"))),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefdiffOptions {
    pub repo_id: String,
    #[serde(default)]
    pub tags_pattern: Option<String>,
    #[serde(default, deserialize_with = "tags_limit")]
    pub tags_limit: Option<usize>,
    #[serde(default)]
    pub tags_order: TagsOrder,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefdiffParams<'a> {
    repo_id: &'a str,
}

pub struct RefdiffTaskData {
    pub options: RefdiffOptions,
    pub pattern: Option<Regex>,
    pub batch_size: usize,
}

fn semver_of(name: &str) -> Option<Version> {
    let trimmed = name.strip_prefix(['v', 'V']).unwrap_or(name);
    Version::parse(trimmed).ok()
}

/// Ascending semver; tags that are not versions sort below all versions.
fn compare_semver(a: &Ref, b: &Ref) -> Ordering {
    match (semver_of(&a.name), semver_of(&b.name)) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.name.cmp(&b.name)),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => a.name.cmp(&b.name),
    }
}

/// Select, order and pair the tags of one repository.
pub fn compute_ref_pairs(
    refs: Vec<Ref>,
    repo_id: &str,
    pattern: Option<&Regex>,
    order: TagsOrder,
    limit: Option<usize>,
) -> Vec<RefPair> {
    let mut tags: Vec<Ref> = refs
        .into_iter()
        .filter(|r| r.repo_id == repo_id && r.ref_type == ref_type::TAG)
        .filter(|r| pattern.is_none_or(|p| p.is_match(&r.name)))
        .collect();
    match order {
        TagsOrder::Alphabetically => tags.sort_by(|a, b| a.name.cmp(&b.name)),
        TagsOrder::ReverseAlphabetically => tags.sort_by(|a, b| b.name.cmp(&a.name)),
        TagsOrder::Semver => tags.sort_by(compare_semver),
        TagsOrder::ReverseSemver => tags.sort_by(|a, b| compare_semver(b, a)),
    }
    if let Some(limit) = limit {
        tags.truncate(limit);
    }
    tags.windows(2)
        .map(|pair| RefPair {
            repo_id: repo_id.to_string(),
            new_ref_id: pair[0].id.clone(),
            old_ref_id: pair[1].id.clone(),
            new_ref_commit_sha: pair[0].commit_sha.clone(),
            old_ref_commit_sha: pair[1].commit_sha.clone(),
        })
        .collect()
}

fn calculate_ref_pairs(ctx: &SubTaskContext<RefdiffTaskData>) -> BoxFuture<'_, Result<()>> {
    async move {
        let data = &ctx.data;
        let repo_id = data.options.repo_id.as_str();
        let refs: Vec<Ref> = load_all::<Ref>(
            ctx.store.as_ref(),
            Ref::TABLE,
            &RowFilter::all(),
            data.batch_size,
        )
        .await?
        .into_iter()
        .map(|(_, r)| r)
        .collect();
        let pairs = compute_ref_pairs(
            refs,
            repo_id,
            data.pattern.as_ref(),
            data.options.tags_order,
            data.options.tags_limit,
        );

        let params = RawDataArgs::new(ORIGIN_TABLE, &RefdiffParams { repo_id })?;
        let mut divider = BatchSaveDivider::new(
            Arc::clone(&ctx.store),
            Origin::new(ORIGIN_TABLE, params.params_key()),
            data.batch_size,
        );
        divider.touch(RefPair::TABLE).await?;
        for pair in &pairs {
            divider.push(pair, None).await?;
        }
        divider.close().await?;
        info!(repo = repo_id, pairs = pairs.len(), "Calculated ref pairs");
        Ok(())
    }
    .boxed()
}

#[derive(Debug, Default)]
pub struct Refdiff;

#[async_trait]
impl Plugin for Refdiff {
    type TaskData = RefdiffTaskData;

    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Pair consecutive tags of a repository"
    }

    fn root_package_path(&self) -> &'static str {
        "lakeflow/plugins/refdiff"
    }

    fn subtasks(&self) -> Vec<SubTask<RefdiffTaskData>> {
        vec![SubTask::new(
            SubTaskMeta::new("CalculateRefPairs")
                .description("Compute tag pairs from extracted refs")
                .domain_types(&[DomainType::Code])
                .required(),
            entry(calculate_ref_pairs),
        )]
    }

    async fn prepare_task_data(&self, options: &Value, env: &TaskEnv) -> Result<RefdiffTaskData> {
        let options: RefdiffOptions = decode_options(NAME, options)?;
        let pattern = optional_pattern(NAME, "tagsPattern", options.tags_pattern.as_deref())?;
        Ok(RefdiffTaskData {
            options,
            pattern,
            batch_size: env.batch_size(),
        })
    }
}

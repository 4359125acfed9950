use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::info;

use lakeflow_core::collector::{ApiCollector, CollectionWindow, RequestData, UrlTemplate};
use lakeflow_core::domain::{BoardIssue, Issue, IssueCommit, IssueStatus, Sprint, issue_type};
use lakeflow_core::error::CollectorError;
use lakeflow_core::fetcher::Query;
use lakeflow_core::stage::extractor::extract_error;
use lakeflow_core::stage::{ApiExtractor, DataConverter, DomainIdGenerator, Entity};
use lakeflow_core::store::{RawDataArgs, RowFilter};
use lakeflow_core::{Result, SubTaskContext};

use super::models::{
    ApiIteration, ApiStory, ApiStoryCommit, SimpleStory, TapdIteration, TapdStory,
    TapdStoryCommit,
};
use super::{NAME, TapdTaskData};
use crate::common::{TicketRow, array_at, decode_wrapped, load_all};

pub const RAW_ITERATION_TABLE: &str = "tapd_api_iterations";
pub const RAW_STORY_TABLE: &str = "tapd_api_stories";
pub const RAW_STORY_COMMIT_TABLE: &str = "tapd_api_story_commits";

const PAGE_SIZE: usize = 100;

type Ctx = SubTaskContext<TapdTaskData>;

fn raw_args(data: &TapdTaskData, table: &str) -> Result<RawDataArgs> {
    Ok(RawDataArgs::new(table, &data.params)?)
}

fn workspace_ids() -> DomainIdGenerator {
    DomainIdGenerator::new(NAME, "TapdWorkspace")
}

fn story_ids() -> DomainIdGenerator {
    DomainIdGenerator::new(NAME, "TapdStory")
}

/// The `modified` query value for records changed after `since`.
pub fn modified_filter(since: DateTime<Utc>) -> String {
    format!(">{}", since.format("%Y-%m-%d %H:%M:%S"))
}

/// Map a story workflow status onto the normalized status.
pub fn story_status(status: &str) -> IssueStatus {
    match status {
        "done" | "resolved" | "rejected" | "closed" => IssueStatus::Done,
        "" | "planning" | "open" | "new" => IssueStatus::Todo,
        _ => IssueStatus::InProgress,
    }
}

fn paged_query<I>(workspace_id: u64, req: &RequestData<I>) -> std::result::Result<Query, CollectorError> {
    let mut query = vec![
        ("workspace_id".to_string(), workspace_id.to_string()),
        ("page".to_string(), req.pager.page.to_string()),
        ("limit".to_string(), req.pager.size.to_string()),
        ("order".to_string(), "created asc".to_string()),
    ];
    if let Some(since) = req.since {
        query.push(("modified".to_string(), modified_filter(since)));
    }
    Ok(query)
}

async fn collect_paged(ctx: &Ctx, raw_table: &str, tool_table: &str, path: &str) -> Result<()> {
    let data = &ctx.data;
    let raw = raw_args(data, raw_table)?;
    let window = CollectionWindow::resolve(
        ctx.store.as_ref(),
        tool_table,
        &raw.params_key(),
        data.options.since,
    )
    .await?;
    let workspace_id = data.params.workspace_id;
    let stats = ApiCollector::<()>::new(
        raw,
        data.client.fetcher.clone(),
        Arc::clone(&ctx.store),
        UrlTemplate::pattern(path),
        array_at("/data"),
    )
    .page_size(PAGE_SIZE)
    .window(window)
    .query(move |req| paged_query(workspace_id, req))
    .progress(ctx.progress.clone())
    .execute()
    .await?;
    info!(
        workspace = workspace_id,
        path,
        requests = stats.requests,
        rows = stats.rows,
        incremental = stats.incremental,
        "Collected"
    );
    Ok(())
}

pub(super) fn collect_iterations(ctx: &Ctx) -> BoxFuture<'_, Result<()>> {
    collect_paged(ctx, RAW_ITERATION_TABLE, TapdIteration::TABLE, "iterations").boxed()
}

pub(super) fn extract_iterations(ctx: &Ctx) -> BoxFuture<'_, Result<()>> {
    async move {
        let data = &ctx.data;
        let connection_id = data.params.connection_id;
        let workspace_id = data.params.workspace_id;
        ApiExtractor::new(
            raw_args(data, RAW_ITERATION_TABLE)?,
            Arc::clone(&ctx.store),
            move |row| {
                let api: ApiIteration = decode_wrapped(RAW_ITERATION_TABLE, "Iteration", row)?;
                Ok(vec![TapdIteration {
                    connection_id,
                    workspace_id,
                    id: api.id,
                    name: api.name,
                    status: api.status,
                    creator: api.creator,
                    start_date: api.startdate,
                    end_date: api.enddate,
                    completed: api.completed,
                    created: api.created,
                    modified: api.modified,
                }])
            },
        )
        .batch_size(data.batch_size)
        .produces(&[TapdIteration::TABLE])
        .cancellation(ctx.cancel.clone())
        .progress(ctx.progress.clone())
        .execute()
        .await?;
        Ok(())
    }
    .boxed()
}

pub(super) fn convert_iterations(ctx: &Ctx) -> BoxFuture<'_, Result<()>> {
    async move {
        let data = &ctx.data;
        let board_id = workspace_ids().generate(data.params.connection_id, data.params.workspace_id);
        let ids = DomainIdGenerator::new(NAME, "TapdIteration");
        DataConverter::<TapdIteration, Sprint>::new(
            raw_args(data, RAW_ITERATION_TABLE)?,
            Arc::clone(&ctx.store),
            move |iteration| {
                let status = if iteration.status == "done" {
                    "CLOSED"
                } else {
                    "ACTIVE"
                };
                Ok(vec![Sprint {
                    id: ids.generate(iteration.connection_id, &iteration.id),
                    name: iteration.name,
                    url: String::new(),
                    status: status.to_string(),
                    original_board_id: board_id.clone(),
                    started_date: iteration.start_date,
                    ended_date: iteration.end_date,
                    completed_date: iteration.completed,
                    updated_date: iteration.modified,
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

pub(super) fn collect_stories(ctx: &Ctx) -> BoxFuture<'_, Result<()>> {
    collect_paged(ctx, RAW_STORY_TABLE, TapdStory::TABLE, "stories").boxed()
}

pub(super) fn extract_stories(ctx: &Ctx) -> BoxFuture<'_, Result<()>> {
    async move {
        let data = &ctx.data;
        let connection_id = data.params.connection_id;
        let workspace_id = data.params.workspace_id;
        ApiExtractor::new(
            raw_args(data, RAW_STORY_TABLE)?,
            Arc::clone(&ctx.store),
            move |row| {
                let api: ApiStory = decode_wrapped(RAW_STORY_TABLE, "Story", row)?;
                Ok(vec![TapdStory {
                    connection_id,
                    workspace_id,
                    id: api.id,
                    name: api.name,
                    description: api.description.unwrap_or_default(),
                    status: api.status,
                    creator: api.creator,
                    owner: api.owner.unwrap_or_default(),
                    iteration_id: api.iteration_id,
                    parent_id: api.parent_id,
                    priority: api.priority.unwrap_or_default(),
                    size: api.size.trim().parse().unwrap_or(0.0),
                    created: api.created,
                    modified: api.modified,
                    completed: api.completed,
                }])
            },
        )
        .batch_size(data.batch_size)
        .produces(&[TapdStory::TABLE])
        .cancellation(ctx.cancel.clone())
        .progress(ctx.progress.clone())
        .execute()
        .await?;
        Ok(())
    }
    .boxed()
}

pub(super) fn convert_stories(ctx: &Ctx) -> BoxFuture<'_, Result<()>> {
    async move {
        let data = &ctx.data;
        let board_id = workspace_ids().generate(data.params.connection_id, data.params.workspace_id);
        let ids = story_ids();
        let endpoint = data.client.connection.endpoint.trim_end_matches('/').to_string();
        DataConverter::<TapdStory, TicketRow>::new(
            raw_args(data, RAW_STORY_TABLE)?,
            Arc::clone(&ctx.store),
            move |story| {
                let id = ids.generate(story.connection_id, &story.id);
                let parent = match story.parent_id.as_str() {
                    "" | "0" => None,
                    parent => Some(ids.generate(story.connection_id, parent)),
                };
                let mut issue = Issue {
                    id: id.clone(),
                    url: format!(
                        "{endpoint}/{}/prong/stories/view/{}",
                        story.workspace_id, story.id
                    ),
                    issue_key: story.id,
                    title: story.name,
                    description: story.description,
                    issue_type: issue_type::REQUIREMENT.to_string(),
                    status: story_status(&story.status),
                    original_status: story.status,
                    story_point: story.size,
                    priority: story.priority,
                    creator_name: story.creator,
                    assignee_name: story.owner,
                    parent_issue_id: parent,
                    created_date: story.created,
                    updated_date: story.modified,
                    resolution_date: story.completed,
                    ..Default::default()
                };
                issue.compute_lead_time();
                Ok(vec![
                    TicketRow::Issue(issue),
                    TicketRow::BoardIssue(BoardIssue {
                        board_id: board_id.clone(),
                        issue_id: id,
                    }),
                ])
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

pub(super) fn collect_story_commits(ctx: &Ctx) -> BoxFuture<'_, Result<()>> {
    async move {
        let data = &ctx.data;
        let raw = raw_args(data, RAW_STORY_COMMIT_TABLE)?;
        let params_key = raw.params_key();
        let window = CollectionWindow::resolve(
            ctx.store.as_ref(),
            TapdStoryCommit::TABLE,
            &params_key,
            data.options.since,
        )
        .await?;
        // One request per story touched since the last commit collection.
        let stories = load_all::<TapdStory>(
            ctx.store.as_ref(),
            TapdStory::TABLE,
            &RowFilter::params(params_key).updated_after(window.since),
            data.batch_size,
        )
        .await?;
        let inputs: Vec<SimpleStory> = stories
            .into_iter()
            .map(|(_, story)| SimpleStory { id: story.id })
            .collect();
        let story_count = inputs.len();

        let workspace_id = data.params.workspace_id;
        let stats = ApiCollector::<SimpleStory>::new(
            raw,
            data.client.fetcher.clone(),
            Arc::clone(&ctx.store),
            UrlTemplate::pattern("code_commit_infos"),
            array_at("/data"),
        )
        .input(inputs)
        .window(window)
        .query(move |req| {
            let story = req.input.as_ref().ok_or_else(|| CollectorError::Template {
                message: "story commit request without a story".into(),
            })?;
            Ok(vec![
                ("workspace_id".to_string(), workspace_id.to_string()),
                ("type".to_string(), "story".to_string()),
                ("object_id".to_string(), story.id.clone()),
                ("order".to_string(), "created asc".to_string()),
            ])
        })
        .progress(ctx.progress.clone())
        .execute()
        .await?;
        info!(
            stories = story_count,
            requests = stats.requests,
            rows = stats.rows,
            incremental = stats.incremental,
            "Collected story commits"
        );
        Ok(())
    }
    .boxed()
}

pub(super) fn extract_story_commits(ctx: &Ctx) -> BoxFuture<'_, Result<()>> {
    async move {
        let data = &ctx.data;
        let connection_id = data.params.connection_id;
        let workspace_id = data.params.workspace_id;
        ApiExtractor::new(
            raw_args(data, RAW_STORY_COMMIT_TABLE)?,
            Arc::clone(&ctx.store),
            move |row| {
                let story = row
                    .input_json::<SimpleStory>()
                    .map_err(|e| extract_error(RAW_STORY_COMMIT_TABLE, row, e))?
                    .ok_or_else(|| {
                        extract_error(RAW_STORY_COMMIT_TABLE, row, "missing story input")
                    })?;
                let api: ApiStoryCommit =
                    decode_wrapped(RAW_STORY_COMMIT_TABLE, "WorkitemCommitInfo", row)?;
                Ok(vec![TapdStoryCommit {
                    connection_id,
                    workspace_id,
                    id: api.id,
                    story_id: story.id,
                    commit_id: api.commit_id,
                    hook_user_name: api.hook_user_name,
                    message: api.message,
                    web_url: api.web_url,
                    git_ref: api.git_ref,
                    commit_time: api.commit_time,
                    created: api.created,
                }])
            },
        )
        .batch_size(data.batch_size)
        .produces(&[TapdStoryCommit::TABLE])
        .cancellation(ctx.cancel.clone())
        .progress(ctx.progress.clone())
        .execute()
        .await?;
        Ok(())
    }
    .boxed()
}

pub(super) fn convert_story_commits(ctx: &Ctx) -> BoxFuture<'_, Result<()>> {
    async move {
        let data = &ctx.data;
        let ids = story_ids();
        DataConverter::<TapdStoryCommit, IssueCommit>::new(
            raw_args(data, RAW_STORY_COMMIT_TABLE)?,
            Arc::clone(&ctx.store),
            move |commit| {
                Ok(vec![IssueCommit {
                    issue_id: ids.generate(commit.connection_id, &commit.story_id),
                    commit_sha: commit.commit_id,
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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use lakeflow_core::collector::Pager;
    use serde_json::Value;

    #[test]
    fn test_modified_filter_format() {
        let since = Utc.with_ymd_and_hms(2022, 3, 1, 8, 5, 0).unwrap();
        assert_eq!(modified_filter(since), ">2022-03-01 08:05:00");
    }

    #[test]
    fn test_paged_query_adds_modified_only_with_since() {
        let mut req = RequestData::<()> {
            pager: Pager::new(2, 100),
            params: Value::Null,
            input: None,
            since: None,
        };
        let query = paged_query(991, &req).unwrap();
        assert!(query.iter().all(|(k, _)| k != "modified"));
        assert!(query.contains(&("page".to_string(), "2".to_string())));

        req.since = Some(Utc.with_ymd_and_hms(2022, 3, 1, 0, 0, 0).unwrap());
        let query = paged_query(991, &req).unwrap();
        assert!(query.contains(&("modified".to_string(), ">2022-03-01 00:00:00".to_string())));
    }

    #[test]
    fn test_story_status_mapping() {
        assert_eq!(story_status("done"), IssueStatus::Done);
        assert_eq!(story_status("planning"), IssueStatus::Todo);
        assert_eq!(story_status("developing"), IssueStatus::InProgress);
    }
}

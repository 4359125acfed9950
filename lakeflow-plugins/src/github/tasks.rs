use chrono::SecondsFormat;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::info;

use lakeflow_core::collector::{ApiCollector, CollectionWindow, UrlTemplate, parse_json_array};
use lakeflow_core::domain::{Board, BoardIssue, Issue, IssueStatus, Repo};
use lakeflow_core::plugin::execution_failed;
use lakeflow_core::stage::{ApiExtractor, DataConverter, DomainIdGenerator, Entity};
use lakeflow_core::store::{RawDataArgs, RowFilter};
use lakeflow_core::{Result, SubTaskContext};

use super::models::{ApiIssue, ApiRepo, GithubIssue, GithubRepo};
use super::{GithubTaskData, NAME};
use crate::common::{ScopeRow, TicketRow, decode_raw, load_all, parse_single_object};

pub const RAW_REPO_TABLE: &str = "github_api_repositories";
pub const RAW_ISSUE_TABLE: &str = "github_api_issues";

type Ctx = SubTaskContext<GithubTaskData>;

fn raw_args(data: &GithubTaskData, table: &str) -> Result<RawDataArgs> {
    Ok(RawDataArgs::new(table, &data.params)?)
}

fn repo_ids() -> DomainIdGenerator {
    DomainIdGenerator::new(NAME, "GithubRepo")
}

pub(super) fn collect_repo(ctx: &Ctx) -> BoxFuture<'_, Result<()>> {
    async move {
        let data = &ctx.data;
        let stats = ApiCollector::<()>::new(
            raw_args(data, RAW_REPO_TABLE)?,
            data.client.fetcher.clone(),
            Arc::clone(&ctx.store),
            UrlTemplate::pattern("repos/{{ params.owner }}/{{ params.repo }}"),
            parse_single_object,
        )
        .progress(ctx.progress.clone())
        .execute()
        .await?;
        info!(
            owner = %data.params.owner,
            repo = %data.params.repo,
            rows = stats.rows,
            "Collected repository"
        );
        Ok(())
    }
    .boxed()
}

pub(super) fn extract_repo(ctx: &Ctx) -> BoxFuture<'_, Result<()>> {
    async move {
        let data = &ctx.data;
        let connection_id = data.params.connection_id;
        ApiExtractor::new(
            raw_args(data, RAW_REPO_TABLE)?,
            Arc::clone(&ctx.store),
            move |row| {
                let api: ApiRepo = decode_raw(RAW_REPO_TABLE, row)?;
                Ok(vec![GithubRepo {
                    connection_id,
                    github_id: api.id,
                    full_name: api.full_name,
                    name: api.name,
                    html_url: api.html_url,
                    clone_url: api.clone_url,
                    description: api.description.unwrap_or_default(),
                    language: api.language.unwrap_or_default(),
                    parent_full_name: api.parent.map(|p| p.full_name).unwrap_or_default(),
                    created_date: api.created_at,
                    updated_date: api.updated_at,
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

pub(super) fn convert_repo(ctx: &Ctx) -> BoxFuture<'_, Result<()>> {
    async move {
        let data = &ctx.data;
        let ids = repo_ids();
        DataConverter::<GithubRepo, ScopeRow>::new(
            raw_args(data, RAW_REPO_TABLE)?,
            Arc::clone(&ctx.store),
            move |repo| {
                let id = ids.generate(repo.connection_id, repo.github_id);
                Ok(vec![
                    ScopeRow::Repo(Repo {
                        id: id.clone(),
                        name: repo.full_name.clone(),
                        url: repo.html_url.clone(),
                        description: repo.description.clone(),
                        language: repo.language,
                        forked_from: repo.parent_full_name,
                        created_date: repo.created_date,
                        updated_date: repo.updated_date,
                    }),
                    ScopeRow::Board(Board {
                        id,
                        name: repo.full_name,
                        description: repo.description,
                        url: format!("{}/issues", repo.html_url),
                        created_date: repo.created_date,
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

pub(super) fn collect_issues(ctx: &Ctx) -> BoxFuture<'_, Result<()>> {
    async move {
        let data = &ctx.data;
        let raw = raw_args(data, RAW_ISSUE_TABLE)?;
        let window =
            CollectionWindow::resolve(ctx.store.as_ref(), GithubIssue::TABLE, &raw.params_key(), None)
                .await?;
        let stats = ApiCollector::<()>::new(
            raw,
            data.client.fetcher.clone(),
            Arc::clone(&ctx.store),
            UrlTemplate::pattern("repos/{{ params.owner }}/{{ params.repo }}/issues"),
            parse_json_array,
        )
        .page_size(100)
        .window(window)
        .query(|req| {
            let mut query = vec![
                ("state".to_string(), "all".to_string()),
                ("direction".to_string(), "asc".to_string()),
                ("page".to_string(), req.pager.page.to_string()),
                ("per_page".to_string(), req.pager.size.to_string()),
            ];
            if let Some(since) = req.since {
                query.push((
                    "since".to_string(),
                    since.to_rfc3339_opts(SecondsFormat::Secs, true),
                ));
            }
            Ok(query)
        })
        .progress(ctx.progress.clone())
        .execute()
        .await?;
        info!(
            requests = stats.requests,
            rows = stats.rows,
            incremental = stats.incremental,
            "Collected issues"
        );
        Ok(())
    }
    .boxed()
}

pub(super) fn extract_issues(ctx: &Ctx) -> BoxFuture<'_, Result<()>> {
    async move {
        let data = &ctx.data;
        let connection_id = data.params.connection_id;
        let repo_full_name = format!("{}/{}", data.params.owner, data.params.repo);
        let rules = data.rules.clone();
        ApiExtractor::new(
            raw_args(data, RAW_ISSUE_TABLE)?,
            Arc::clone(&ctx.store),
            move |row| {
                let api: ApiIssue = decode_raw(RAW_ISSUE_TABLE, row)?;
                // The issues endpoint also lists pull requests.
                if api.pull_request.is_some() {
                    return Ok(Vec::new());
                }
                let labels: Vec<String> = api.labels.into_iter().map(|l| l.name).collect();
                Ok(vec![GithubIssue {
                    connection_id,
                    github_id: api.id,
                    repo_full_name: repo_full_name.clone(),
                    number: api.number,
                    title: api.title,
                    body: api.body.unwrap_or_default(),
                    state: api.state,
                    issue_type: rules.classify(&labels).to_string(),
                    labels,
                    author: api.user.map(|u| u.login).unwrap_or_default(),
                    assignee: api.assignee.map(|u| u.login).unwrap_or_default(),
                    url: api.html_url,
                    created_date: api.created_at,
                    updated_date: api.updated_at,
                    closed_date: api.closed_at,
                }])
            },
        )
        .batch_size(data.batch_size)
        .produces(&[GithubIssue::TABLE])
        .cancellation(ctx.cancel.clone())
        .progress(ctx.progress.clone())
        .execute()
        .await?;
        Ok(())
    }
    .boxed()
}

pub(super) fn convert_issues(ctx: &Ctx) -> BoxFuture<'_, Result<()>> {
    async move {
        let data = &ctx.data;
        let raw = raw_args(data, RAW_ISSUE_TABLE)?;
        // Repo and issue rows share the same params key.
        let repos = load_all::<GithubRepo>(
            ctx.store.as_ref(),
            GithubRepo::TABLE,
            &RowFilter::params(raw.params_key()),
            data.batch_size,
        )
        .await?;
        let Some((_, repo)) = repos.into_iter().next() else {
            return Err(execution_failed(
                NAME,
                format!(
                    "repository {}/{} has not been extracted yet",
                    data.params.owner, data.params.repo
                ),
            ));
        };
        let board_id = repo_ids().generate(repo.connection_id, repo.github_id);
        let issue_ids = DomainIdGenerator::new(NAME, "GithubIssue");

        DataConverter::<GithubIssue, TicketRow>::new(raw, Arc::clone(&ctx.store), move |issue| {
            let id = issue_ids.generate(issue.connection_id, issue.github_id);
            let mut domain = Issue {
                id: id.clone(),
                url: issue.url,
                issue_key: issue.number.to_string(),
                title: issue.title,
                description: issue.body,
                issue_type: issue.issue_type,
                status: if issue.state == "closed" {
                    IssueStatus::Done
                } else {
                    IssueStatus::Todo
                },
                original_status: issue.state,
                creator_name: issue.author,
                assignee_name: issue.assignee,
                created_date: issue.created_date,
                updated_date: issue.updated_date,
                resolution_date: issue.closed_date,
                ..Default::default()
            };
            domain.compute_lead_time();
            Ok(vec![
                TicketRow::Issue(domain),
                TicketRow::BoardIssue(BoardIssue {
                    board_id: board_id.clone(),
                    issue_id: id,
                }),
            ])
        })
        .batch_size(data.batch_size)
        .cancellation(ctx.cancel.clone())
        .progress(ctx.progress.clone())
        .execute()
        .await?;
        Ok(())
    }
    .boxed()
}

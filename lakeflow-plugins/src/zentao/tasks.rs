use futures::FutureExt;
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::info;

use lakeflow_core::collector::{ApiCollector, UrlTemplate};
use lakeflow_core::domain::{Board, BoardIssue, Issue, IssueStatus, issue_type};
use lakeflow_core::stage::{ApiExtractor, DataConverter, DomainIdGenerator, Entity};
use lakeflow_core::store::RawDataArgs;
use lakeflow_core::{Result, SubTaskContext};

use super::models::{ApiProduct, ApiStory, ZentaoProduct, ZentaoStory, account_name};
use super::{NAME, ZentaoTaskData};
use crate::common::{TicketRow, array_at, decode_raw, parse_single_object};

pub const RAW_PRODUCT_TABLE: &str = "zentao_api_products";
pub const RAW_STORY_TABLE: &str = "zentao_api_stories";

type Ctx = SubTaskContext<ZentaoTaskData>;

fn raw_args(data: &ZentaoTaskData, table: &str) -> Result<RawDataArgs> {
    Ok(RawDataArgs::new(table, &data.params)?)
}

fn product_ids() -> DomainIdGenerator {
    DomainIdGenerator::new(NAME, "ZentaoProduct")
}

fn web_url(endpoint: &str, page: &str) -> String {
    let base = endpoint.trim_end_matches('/');
    let base = base.strip_suffix("/api.php/v1").unwrap_or(base);
    format!("{base}/{page}")
}

/// Map a story stage onto the normalized status.
pub fn story_status(stage: &str) -> IssueStatus {
    match stage {
        "closed" => IssueStatus::Done,
        "wait" | "" => IssueStatus::Todo,
        _ => IssueStatus::InProgress,
    }
}

pub(super) fn collect_product(ctx: &Ctx) -> BoxFuture<'_, Result<()>> {
    async move {
        let data = &ctx.data;
        let stats = ApiCollector::<()>::new(
            raw_args(data, RAW_PRODUCT_TABLE)?,
            data.client.fetcher.clone(),
            Arc::clone(&ctx.store),
            UrlTemplate::pattern("products/{{ params.productId }}"),
            parse_single_object,
        )
        .progress(ctx.progress.clone())
        .execute()
        .await?;
        info!(product = data.params.product_id, rows = stats.rows, "Collected product");
        Ok(())
    }
    .boxed()
}

pub(super) fn extract_product(ctx: &Ctx) -> BoxFuture<'_, Result<()>> {
    async move {
        let data = &ctx.data;
        let connection_id = data.params.connection_id;
        ApiExtractor::new(
            raw_args(data, RAW_PRODUCT_TABLE)?,
            Arc::clone(&ctx.store),
            move |row| {
                let api: ApiProduct = decode_raw(RAW_PRODUCT_TABLE, row)?;
                Ok(vec![ZentaoProduct {
                    connection_id,
                    id: api.id,
                    name: api.name,
                    code: api.code,
                    product_type: format!("product/{}", api.product_type),
                    status: api.status,
                    description: api.description,
                    created_date: api.created_date,
                    stories: api.stories,
                    plans: api.plans,
                    releases: api.releases,
                    bugs: api.bugs,
                }])
            },
        )
        .batch_size(data.batch_size)
        .produces(&[ZentaoProduct::TABLE])
        .cancellation(ctx.cancel.clone())
        .progress(ctx.progress.clone())
        .execute()
        .await?;
        Ok(())
    }
    .boxed()
}

pub(super) fn convert_product(ctx: &Ctx) -> BoxFuture<'_, Result<()>> {
    async move {
        let data = &ctx.data;
        let ids = product_ids();
        let endpoint = data.client.connection.endpoint.clone();
        DataConverter::<ZentaoProduct, Board>::new(
            raw_args(data, RAW_PRODUCT_TABLE)?,
            Arc::clone(&ctx.store),
            move |product| {
                Ok(vec![Board {
                    id: ids.generate(product.connection_id, product.id),
                    url: web_url(&endpoint, &format!("product-browse-{}.html", product.id)),
                    name: product.name,
                    description: product.description,
                    created_date: product.created_date,
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
    async move {
        let data = &ctx.data;
        let stats = ApiCollector::<()>::new(
            raw_args(data, RAW_STORY_TABLE)?,
            data.client.fetcher.clone(),
            Arc::clone(&ctx.store),
            UrlTemplate::pattern("products/{{ params.productId }}/stories"),
            array_at("/stories"),
        )
        .page_size(100)
        .query(|req| {
            Ok(vec![
                ("page".to_string(), req.pager.page.to_string()),
                ("limit".to_string(), req.pager.size.to_string()),
            ])
        })
        .progress(ctx.progress.clone())
        .execute()
        .await?;
        info!(
            product = data.params.product_id,
            requests = stats.requests,
            rows = stats.rows,
            "Collected stories"
        );
        Ok(())
    }
    .boxed()
}

pub(super) fn extract_stories(ctx: &Ctx) -> BoxFuture<'_, Result<()>> {
    async move {
        let data = &ctx.data;
        let connection_id = data.params.connection_id;
        ApiExtractor::new(
            raw_args(data, RAW_STORY_TABLE)?,
            Arc::clone(&ctx.store),
            move |row| {
                let api: ApiStory = decode_raw(RAW_STORY_TABLE, row)?;
                Ok(vec![ZentaoStory {
                    connection_id,
                    id: api.id,
                    product: api.product,
                    parent: api.parent,
                    title: api.title,
                    story_type: api.story_type,
                    stage: api.stage,
                    status: api.status,
                    pri: api.pri,
                    estimate: api.estimate,
                    opened_by_name: account_name(&api.opened_by),
                    assigned_to_name: account_name(&api.assigned_to),
                    opened_date: api.opened_date,
                    last_edited_date: api.last_edited_date,
                    closed_date: api.closed_date,
                }])
            },
        )
        .batch_size(data.batch_size)
        .produces(&[ZentaoStory::TABLE])
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
        let board_id = product_ids().generate(data.params.connection_id, data.params.product_id);
        let story_ids = DomainIdGenerator::new(NAME, "ZentaoStory");
        let endpoint = data.client.connection.endpoint.clone();
        DataConverter::<ZentaoStory, TicketRow>::new(
            raw_args(data, RAW_STORY_TABLE)?,
            Arc::clone(&ctx.store),
            move |story| {
                let id = story_ids.generate(story.connection_id, story.id);
                let mut issue = Issue {
                    id: id.clone(),
                    url: web_url(&endpoint, &format!("story-view-{}.html", story.id)),
                    issue_key: story.id.to_string(),
                    title: story.title,
                    issue_type: issue_type::REQUIREMENT.to_string(),
                    status: story_status(&story.stage),
                    original_status: story.stage,
                    story_point: story.estimate,
                    priority: story.pri.to_string(),
                    creator_name: story.opened_by_name,
                    assignee_name: story.assigned_to_name,
                    parent_issue_id: (story.parent > 0)
                        .then(|| story_ids.generate(story.connection_id, story.parent)),
                    created_date: story.opened_date,
                    updated_date: story.last_edited_date,
                    resolution_date: story.closed_date,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_story_status_mapping() {
        assert_eq!(story_status("closed"), IssueStatus::Done);
        assert_eq!(story_status("wait"), IssueStatus::Todo);
        assert_eq!(story_status("developing"), IssueStatus::InProgress);
        assert_eq!(story_status("tested"), IssueStatus::InProgress);
    }

    #[test]
    fn test_web_url_strips_api_suffix() {
        assert_eq!(
            web_url("https://zentao.example.com/api.php/v1/", "story-view-7.html"),
            "https://zentao.example.com/story-view-7.html"
        );
        assert_eq!(
            web_url("https://zentao.example.com", "product-browse-1.html"),
            "https://zentao.example.com/product-browse-1.html"
        );
    }
}

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use lakeflow_core::collector::{ApiCollector, UrlTemplate, parse_json_field};
use lakeflow_core::domain::CqIssue;
use lakeflow_core::error::CollectorError;
use lakeflow_core::fetcher::ApiResponse;
use lakeflow_core::stage::{ApiExtractor, DataConverter, DomainIdGenerator};
use lakeflow_core::store::RawDataArgs;
use lakeflow_core::{Result, SubTaskContext};

use super::models::{ApiIssue, ApiIssuePage, SonarqubeIssue};
use super::{NAME, SonarqubeTaskData};
use crate::common::decode_raw;

pub const RAW_ISSUES_TABLE: &str = "sonarqube_api_issues";

const PAGE_SIZE: usize = 100;

type Ctx = SubTaskContext<SonarqubeTaskData>;

fn raw_args(data: &SonarqubeTaskData) -> Result<RawDataArgs> {
    Ok(RawDataArgs::new(RAW_ISSUES_TABLE, &data.params)?)
}

/// Page count from the `paging` block of the first page.
fn total_pages(response: &ApiResponse, page_size: usize) -> std::result::Result<usize, CollectorError> {
    let page: ApiIssuePage = response
        .json()
        .map_err(|e| CollectorError::MalformedResponse {
            url: response.url.clone(),
            message: e.to_string(),
        })?;
    let Some(paging) = page.paging else {
        return Ok(1);
    };
    let size = if page_size > 0 { page_size } else { paging.page_size.max(1) };
    Ok(paging.total.div_ceil(size).max(1))
}

/// Parse one page of issues, refusing any issue newer than the last analysis.
fn parse_issues(
    response: &ApiResponse,
    project_key: &str,
    last_analysis: Option<DateTime<Utc>>,
) -> std::result::Result<Vec<Value>, CollectorError> {
    let issues = parse_json_field(response, Some("/issues"))?;
    let Some(boundary) = last_analysis else {
        return Ok(issues);
    };
    for issue in &issues {
        let key = issue.get("key").and_then(Value::as_str).unwrap_or("?");
        // An issue without a readable timestamp cannot be checked against the boundary.
        let Some(updated) = issue
            .get("updateDate")
            .and_then(Value::as_str)
            .and_then(lakeflow_core::time::parse_flexible)
        else {
            return Err(CollectorError::MalformedResponse {
                url: response.url.clone(),
                message: format!("issue {key} has no parseable updateDate"),
            });
        };
        if updated > boundary {
            return Err(CollectorError::StaleData {
                scope: project_key.to_string(),
                message: format!(
                    "issue {key} was updated at {updated}, after the last analysis at {boundary}"
                ),
            });
        }
    }
    Ok(issues)
}

pub(super) fn collect_issues(ctx: &Ctx) -> BoxFuture<'_, Result<()>> {
    async move {
        let data = &ctx.data;
        let project_key = data.params.project_key.clone();
        let guard_key = project_key.clone();
        let last_analysis = data.last_analysis_date;
        let stats = ApiCollector::<()>::new(
            raw_args(data)?,
            data.client.fetcher.clone(),
            Arc::clone(&ctx.store),
            UrlTemplate::pattern("issues/search"),
            move |response| parse_issues(response, &guard_key, last_analysis),
        )
        .page_size(PAGE_SIZE)
        .query(move |req| {
            Ok(vec![
                ("componentKeys".to_string(), project_key.clone()),
                ("p".to_string(), req.pager.page.to_string()),
                ("ps".to_string(), req.pager.size.to_string()),
            ])
        })
        .total_pages(|response, req| total_pages(response, req.pager.size))
        .progress(ctx.progress.clone())
        .execute()
        .await?;
        info!(
            project = %data.params.project_key,
            requests = stats.requests,
            rows = stats.rows,
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
        let project_key = data.params.project_key.clone();
        ApiExtractor::new(raw_args(data)?, Arc::clone(&ctx.store), move |row| {
            let api: ApiIssue = decode_raw(RAW_ISSUES_TABLE, row)?;
            Ok(vec![SonarqubeIssue {
                connection_id,
                issue_key: api.key,
                project_key: if api.project.is_empty() {
                    project_key.clone()
                } else {
                    api.project
                },
                rule: api.rule,
                severity: api.severity,
                component: api.component,
                line: api.line,
                status: api.status,
                message: api.message,
                issue_type: api.issue_type,
                creation_date: api.creation_date,
                update_date: api.update_date,
            }])
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

pub(super) fn convert_issues(ctx: &Ctx) -> BoxFuture<'_, Result<()>> {
    async move {
        let data = &ctx.data;
        let ids = DomainIdGenerator::new(NAME, "SonarqubeIssue");
        DataConverter::<SonarqubeIssue, CqIssue>::new(
            raw_args(data)?,
            Arc::clone(&ctx.store),
            move |issue| {
                Ok(vec![CqIssue {
                    id: ids.generate(issue.connection_id, &issue.issue_key),
                    project_key: issue.project_key,
                    rule: issue.rule,
                    severity: issue.severity,
                    component: issue.component,
                    line: issue.line,
                    status: issue.status,
                    message: issue.message,
                    issue_type: issue.issue_type,
                    created_date: issue.creation_date,
                    updated_date: issue.update_date,
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
    use serde_json::json;

    fn page(body: Value) -> ApiResponse {
        ApiResponse::json_ok("https://sonar.example.com/api/issues/search", &body)
    }

    #[test]
    fn test_total_pages_rounds_up() {
        let response = page(json!({"paging": {"pageIndex": 1, "pageSize": 100, "total": 201}, "issues": []}));
        assert_eq!(total_pages(&response, 100).unwrap(), 3);
        let empty = page(json!({"paging": {"pageIndex": 1, "pageSize": 100, "total": 0}, "issues": []}));
        assert_eq!(total_pages(&empty, 100).unwrap(), 1);
    }

    #[test]
    fn test_stale_issue_rejected() {
        let boundary = Utc.with_ymd_and_hms(2023, 5, 1, 12, 0, 0).unwrap();
        let fresh = page(json!({"issues": [{"key": "a", "updateDate": "2023-05-01T11:00:00+0000"}]}));
        assert_eq!(parse_issues(&fresh, "lake", Some(boundary)).unwrap().len(), 1);

        let stale = page(json!({"issues": [
            {"key": "a", "updateDate": "2023-05-01T11:00:00+0000"},
            {"key": "b", "updateDate": "2023-05-02T09:00:00+0000"}
        ]}));
        let err = parse_issues(&stale, "lake", Some(boundary)).unwrap_err();
        assert!(matches!(err, CollectorError::StaleData { ref scope, .. } if scope == "lake"));
        assert!(err.to_string().contains("full sync"));

        assert_eq!(parse_issues(&stale, "lake", None).unwrap().len(), 2);
    }

    #[test]
    fn test_unreadable_update_date_rejected_when_guarded() {
        let boundary = Utc.with_ymd_and_hms(2023, 5, 1, 12, 0, 0).unwrap();
        let missing = page(json!({"issues": [
            {"key": "a", "updateDate": "2023-05-01T11:00:00+0000"},
            {"key": "b"}
        ]}));
        let err = parse_issues(&missing, "lake", Some(boundary)).unwrap_err();
        assert!(matches!(err, CollectorError::MalformedResponse { ref message, .. } if message.contains("issue b")));

        let garbled = page(json!({"issues": [{"key": "c", "updateDate": "yesterday"}]}));
        let err = parse_issues(&garbled, "lake", Some(boundary)).unwrap_err();
        assert!(matches!(err, CollectorError::MalformedResponse { .. }));

        assert_eq!(parse_issues(&missing, "lake", None).unwrap().len(), 2);
    }

    #[test]
    fn test_missing_paging_means_one_page() {
        let response = page(json!({"issues": [{"key": "a"}]}));
        assert_eq!(total_pages(&response, 100).unwrap(), 1);
    }
}

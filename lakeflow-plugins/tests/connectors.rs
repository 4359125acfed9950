//! Connector tasks run end to end against scripted APIs.

mod common;

use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use lakeflow_core::domain::{CicdTask, CqIssue, Issue, IssueStatus, Sprint};
use lakeflow_core::store::{RawDataArgs, RawDataStore};
use lakeflow_core::SubTaskStatus;
use lakeflow_plugins::sonarqube::{RAW_ISSUES_TABLE, SonarqubeParams};
use lakeflow_plugins::zentao::models::ZentaoProduct;

use common::{MockClient, connection, count, env, not_found, ok, query, rows, run_task};

fn by_id<T, F: Fn(&T) -> &str>(items: &[T], id: &str, key: F) -> usize {
    items.iter().position(|i| key(i) == id).unwrap()
}

// ── GitHub ──

fn github_issue(id: u64, state: &str, updated_at: &str) -> Value {
    json!({
        "id": id,
        "number": id,
        "title": format!("issue {id}"),
        "state": state,
        "labels": [{"name": "bug"}],
        "user": {"login": "octocat"},
        "html_url": format!("https://github.com/apache/lake/issues/{id}"),
        "created_at": "2023-01-01T00:00:00Z",
        "updated_at": updated_at,
        "closed_at": if state == "closed" { json!(updated_at) } else { Value::Null }
    })
}

fn github_repo() -> Value {
    json!({
        "id": 384111310,
        "name": "lake",
        "full_name": "apache/lake",
        "html_url": "https://github.com/apache/lake",
        "clone_url": "https://github.com/apache/lake.git",
        "created_at": "2021-07-08T12:00:00Z"
    })
}

fn github_options() -> Value {
    json!({
        "connectionId": 1,
        "owner": "apache",
        "repo": "lake",
        "transformationRules": {"issueTypeBug": "^bug$"}
    })
}

#[tokio::test]
async fn test_github_rerun_converges() {
    let client = MockClient::new(|path, _| match path {
        "repos/apache/lake" => ok(path, github_repo()),
        "repos/apache/lake/issues" => ok(
            path,
            json!([
                github_issue(1, "open", "2023-01-02T00:00:00Z"),
                github_issue(2, "closed", "2023-01-03T00:00:00Z"),
                {
                    "id": 3, "number": 3, "title": "a pull request", "state": "open",
                    "html_url": "https://github.com/apache/lake/pull/3",
                    "pull_request": {"url": "https://api.github.com/repos/apache/lake/pulls/3"}
                }
            ]),
        ),
        _ => not_found(path),
    });
    let (store, env) = env(client.clone(), vec![connection(1, "github", "https://api.github.com/")]);

    let first = run_task(&env, "github", github_options()).await;
    assert!(first.succeeded(), "{:?}", first.subtasks);
    let issues_after_first: Vec<Issue> = rows(store.as_ref(), "issues").await;
    assert_eq!(issues_after_first.len(), 2);
    assert_eq!(count(store.as_ref(), "_tool_github_issues").await, 2);
    assert_eq!(count(store.as_ref(), "board_issues").await, 2);
    assert_eq!(count(store.as_ref(), "repos").await, 1);
    assert_eq!(count(store.as_ref(), "boards").await, 1);

    let second = run_task(&env, "github", github_options()).await;
    assert!(second.succeeded());
    let issues_after_second: Vec<Issue> = rows(store.as_ref(), "issues").await;
    assert_eq!(issues_after_first, issues_after_second);
    assert_eq!(count(store.as_ref(), "board_issues").await, 2);

    let closed = &issues_after_second[by_id(&issues_after_second, "github:GithubIssue:1:2", |i| i.id.as_str())];
    assert_eq!(closed.status, IssueStatus::Done);
    assert_eq!(closed.issue_type, "BUG");
    assert_eq!(closed.lead_time_minutes, Some(2 * 24 * 60));
}

#[tokio::test]
async fn test_github_incremental_run_adds_and_updates() {
    let client = MockClient::new(|path, q| match path {
        "repos/apache/lake" => ok(path, github_repo()),
        "repos/apache/lake/issues" if query(q, "since").is_some() => ok(
            path,
            json!([
                github_issue(2, "closed", "2023-02-01T00:00:00Z"),
                github_issue(4, "open", "2023-02-02T00:00:00Z")
            ]),
        ),
        "repos/apache/lake/issues" => ok(
            path,
            json!([
                github_issue(1, "open", "2023-01-02T00:00:00Z"),
                github_issue(2, "open", "2023-01-03T00:00:00Z")
            ]),
        ),
        _ => not_found(path),
    });
    let (store, env) = env(client.clone(), vec![connection(1, "github", "https://api.github.com/")]);

    run_task(&env, "github", github_options()).await;
    let first_queries = client.queries_for("repos/apache/lake/issues");
    assert_eq!(first_queries.len(), 1);
    assert_eq!(query(&first_queries[0], "since"), None);

    client.reset();
    let report = run_task(&env, "github", github_options()).await;
    assert!(report.succeeded());
    let queries = client.queries_for("repos/apache/lake/issues");
    assert_eq!(query(&queries[0], "since"), Some("2023-01-03T00:00:00Z"));

    let issues: Vec<Issue> = rows(store.as_ref(), "issues").await;
    assert_eq!(issues.len(), 3);
    let updated = &issues[by_id(&issues, "github:GithubIssue:1:2", |i| i.id.as_str())];
    assert_eq!(updated.status, IssueStatus::Done);
    assert!(issues.iter().any(|i| i.id == "github:GithubIssue:1:1"));
    assert!(issues.iter().any(|i| i.id == "github:GithubIssue:1:4"));
}

// ── SonarQube ──

fn sonar_client(issue_updated: &'static str) -> Arc<MockClient> {
    MockClient::new(move |path, _| match path {
        "projects/search" => ok(
            path,
            json!({"components": [{"key": "lake", "name": "Lake", "lastAnalysisDate": "2023-05-01T12:00:00+0000"}]}),
        ),
        "issues/search" => ok(
            path,
            json!({
                "paging": {"pageIndex": 1, "pageSize": 100, "total": 1},
                "issues": [{
                    "key": "AX-1", "rule": "rust:S100", "severity": "MAJOR",
                    "component": "lake:src/main.rs", "project": "lake", "line": 7,
                    "status": "OPEN", "message": "rename this", "type": "CODE_SMELL",
                    "creationDate": "2023-04-01T00:00:00+0000", "updateDate": issue_updated
                }]
            }),
        ),
        _ => not_found(path),
    })
}

#[tokio::test]
async fn test_sonarqube_collects_analyzed_issues() {
    let (store, env) = env(
        sonar_client("2023-05-01T11:00:00+0000"),
        vec![connection(3, "sonarqube", "https://sonar.example.com/api/")],
    );
    let report = run_task(&env, "sonarqube", json!({"connectionId": 3, "projectKey": "lake"})).await;
    assert!(report.succeeded());
    let issues: Vec<CqIssue> = rows(store.as_ref(), "cq_issues").await;
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].id, "sonarqube:SonarqubeIssue:3:AX-1");
    assert_eq!(issues[0].line, Some(7));
}

#[tokio::test]
async fn test_sonarqube_stale_issue_aborts_collection() {
    let (store, env) = env(
        sonar_client("2023-05-02T08:00:00+0000"),
        vec![connection(3, "sonarqube", "https://sonar.example.com/api/")],
    );
    let report = run_task(&env, "sonarqube", json!({"connectionId": 3, "projectKey": "lake"})).await;

    assert!(!report.succeeded());
    assert_eq!(report.status_of("CollectIssues"), Some(SubTaskStatus::Failed));
    assert_eq!(report.status_of("ExtractIssues"), Some(SubTaskStatus::Skipped));
    let error = report.subtasks[0].error.clone().unwrap();
    assert!(error.contains("full sync"), "{error}");

    let raw = RawDataArgs::new(
        RAW_ISSUES_TABLE,
        &SonarqubeParams {
            connection_id: 3,
            project_key: "lake".into(),
        },
    )
    .unwrap();
    assert_eq!(store.count_raw(&raw.raw_table(), &raw.params_key()).await.unwrap(), 0);
    assert_eq!(count(store.as_ref(), "cq_issues").await, 0);
}

#[tokio::test]
async fn test_sonarqube_without_paging_block_reads_one_page() {
    let client = MockClient::new(|path, _| match path {
        "projects/search" => ok(path, json!({"components": [{"key": "lake", "name": "Lake"}]})),
        "issues/search" => ok(
            path,
            json!({"issues": [{
                "key": "AX-2", "rule": "rust:S101", "component": "lake:src/lib.rs",
                "status": "OPEN", "message": "simplify", "type": "BUG",
                "creationDate": "2023-04-01T00:00:00+0000", "updateDate": "2023-04-02T00:00:00+0000"
            }]}),
        ),
        _ => not_found(path),
    });
    let (store, env) = env(
        Arc::clone(&client),
        vec![connection(3, "sonarqube", "https://sonar.example.com/api/")],
    );
    let report = run_task(&env, "sonarqube", json!({"connectionId": 3, "projectKey": "lake"})).await;

    assert!(report.succeeded(), "{:?}", report.subtasks);
    assert_eq!(client.queries_for("issues/search").len(), 1);
    let issues: Vec<CqIssue> = rows(store.as_ref(), "cq_issues").await;
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].id, "sonarqube:SonarqubeIssue:3:AX-2");
}

// ── Zentao ──

#[tokio::test]
async fn test_zentao_product_and_stories() {
    let client = MockClient::new(|path, _| match path {
        "products/22" => ok(
            path,
            json!({
                "id": 22, "name": "Lake", "code": "lake", "type": "normal", "status": "normal",
                "desc": "data lake", "createdDate": "2022-01-01T08:00:00Z",
                "stories": {"active": 2, "draft": 1, "closed": 4, "": 0, "changed": 9},
                "plans": 1, "releases": 2, "bugs": 3
            }),
        ),
        "products/22/stories" => ok(
            path,
            json!({
                "page": 1, "total": 2, "limit": 100,
                "stories": [
                    {
                        "id": 101, "product": 22, "parent": 0, "title": "login", "type": "story",
                        "stage": "closed", "status": "closed", "pri": 2, "estimate": 3.0,
                        "openedBy": {"account": "li", "realname": "Li Lei"},
                        "assignedTo": "han",
                        "openedDate": "2022-02-01T08:00:00Z",
                        "lastEditedDate": "2022-02-03T08:00:00Z",
                        "closedDate": "2022-02-03T08:00:00Z"
                    },
                    {
                        "id": 102, "product": 22, "parent": 101, "title": "logout", "type": "story",
                        "stage": "developing", "status": "active", "pri": 3,
                        "openedBy": "li", "assignedTo": null,
                        "openedDate": "2022-02-02T08:00:00Z"
                    }
                ]
            }),
        ),
        _ => not_found(path),
    });
    let (store, env) = env(
        client,
        vec![connection(4, "zentao", "https://zentao.example.com/api.php/v1")],
    );
    let report = run_task(&env, "zentao", json!({"connectionId": 4, "productId": 22})).await;
    assert!(report.succeeded(), "{:?}", report.subtasks);

    let products: Vec<ZentaoProduct> = rows(store.as_ref(), "_tool_zentao_products").await;
    assert_eq!(products[0].stories.total(), 7);
    assert_eq!(products[0].product_type, "product/normal");

    let issues: Vec<Issue> = rows(store.as_ref(), "issues").await;
    assert_eq!(issues.len(), 2);
    let done = &issues[by_id(&issues, "zentao:ZentaoStory:4:101", |i| i.id.as_str())];
    assert_eq!(done.status, IssueStatus::Done);
    assert_eq!(done.creator_name, "Li Lei");
    assert_eq!(done.url, "https://zentao.example.com/story-view-101.html");
    let child = &issues[by_id(&issues, "zentao:ZentaoStory:4:102", |i| i.id.as_str())];
    assert_eq!(child.status, IssueStatus::InProgress);
    assert_eq!(child.parent_issue_id.as_deref(), Some("zentao:ZentaoStory:4:101"));
    assert_eq!(count(store.as_ref(), "board_issues").await, 2);
    assert_eq!(count(store.as_ref(), "boards").await, 1);
}

// ── TAPD ──

fn tapd_story(id: &str, status: &str, modified: &str) -> Value {
    json!({"Story": {
        "id": id, "name": format!("story {id}"), "status": status, "creator": "wang",
        "iteration_id": "7", "parent_id": "0", "size": "2",
        "created": "2022-03-01 09:00:00", "modified": modified
    }})
}

fn tapd_commit(id: &str, sha: &str, created: &str) -> Value {
    json!({"WorkitemCommitInfo": {
        "id": id, "commit_id": sha, "hook_user_name": "wang", "message": "fix",
        "ref": "refs/heads/main", "commit_time": created, "created": created
    }})
}

#[tokio::test]
async fn test_tapd_incremental_story_commits() {
    let second_run = Arc::new(AtomicBool::new(false));
    let flag = second_run.clone();
    let client = MockClient::new(move |path, q| {
        let later = flag.load(Ordering::SeqCst);
        match path {
            "iterations" => ok(
                path,
                json!({"status": 1, "data": [{"Iteration": {
                    "id": "7", "name": "sprint 7", "status": "done",
                    "startdate": "2022-03-01", "enddate": "2022-03-14",
                    "modified": "2022-03-14 18:00:00"
                }}]}),
            ),
            "stories" if later => ok(
                path,
                json!({"status": 1, "data": [tapd_story("2", "resolved", "2022-03-10 10:00:00")]}),
            ),
            "stories" => ok(
                path,
                json!({"status": 1, "data": [
                    tapd_story("1", "open", "2022-03-02 10:00:00"),
                    tapd_story("2", "developing", "2022-03-03 10:00:00")
                ]}),
            ),
            "code_commit_infos" => {
                let data = match (query(q, "object_id"), later) {
                    (Some("1"), _) => json!([tapd_commit("c1", "aaa111", "2022-03-05 00:00:00")]),
                    (Some("2"), true) => json!([tapd_commit("c2", "bbb222", "2022-03-10 09:00:00")]),
                    _ => json!([]),
                };
                ok(path, json!({"status": 1, "data": data}))
            }
            _ => not_found(path),
        }
    });
    let (store, env) = env(client.clone(), vec![connection(5, "tapd", "https://www.tapd.cn")]);
    let options = json!({"connectionId": 5, "workspaceId": 991});

    let first = run_task(&env, "tapd", options.clone()).await;
    assert!(first.succeeded(), "{:?}", first.subtasks);
    assert_eq!(client.queries_for("code_commit_infos").len(), 2);
    assert_eq!(count(store.as_ref(), "issue_commits").await, 1);

    let sprints: Vec<Sprint> = rows(store.as_ref(), "sprints").await;
    assert_eq!(sprints.len(), 1);
    assert_eq!(sprints[0].status, "CLOSED");

    second_run.store(true, Ordering::SeqCst);
    client.reset();
    let second = run_task(&env, "tapd", options).await;
    assert!(second.succeeded(), "{:?}", second.subtasks);

    let stories = client.queries_for("stories");
    assert_eq!(query(&stories[0], "modified"), Some(">2022-03-03 10:00:00"));
    // Only the story modified after the last commit collection is revisited.
    let commits = client.queries_for("code_commit_infos");
    assert_eq!(commits.len(), 1);
    assert_eq!(query(&commits[0], "object_id"), Some("2"));

    let issues: Vec<Issue> = rows(store.as_ref(), "issues").await;
    assert_eq!(issues.len(), 2);
    let resolved = &issues[by_id(&issues, "tapd:TapdStory:5:2", |i| i.id.as_str())];
    assert_eq!(resolved.status, IssueStatus::Done);
    assert_eq!(resolved.url, "https://www.tapd.cn/991/prong/stories/view/2");
    assert_eq!(count(store.as_ref(), "issue_commits").await, 2);
}

// ── Jenkins ──

fn jenkins_client() -> Arc<MockClient> {
    MockClient::new(|path, _| match path {
        "job/deploy-prod/api/json" => ok(
            path,
            json!({"allBuilds": [
                {"number": 2, "timestamp": 1672531200000i64, "duration": 0, "building": true,
                 "result": null, "displayName": "#2", "url": "https://ci.example.com/job/deploy-prod/2/"},
                {"number": 1, "timestamp": 1672444800000i64, "duration": 90500, "building": false,
                 "result": "UNSTABLE", "displayName": "#1", "url": "https://ci.example.com/job/deploy-prod/1/"}
            ]}),
        ),
        _ => not_found(path),
    })
}

#[tokio::test]
async fn test_jenkins_builds_then_dora_enrichment() {
    let client = jenkins_client();
    let (store, env) = env(client.clone(), vec![connection(6, "jenkins", "https://ci.example.com/")]);
    let report = run_task(
        &env,
        "jenkins",
        json!({
            "connectionId": 6,
            "jobFullName": "deploy-prod",
            "transformationRules": {"deploymentPattern": "deploy"}
        }),
    )
    .await;
    assert!(report.succeeded(), "{:?}", report.subtasks);
    let queries = client.queries_for("job/deploy-prod/api/json");
    assert_eq!(queries.len(), 1);
    assert_eq!(
        query(&queries[0], "tree"),
        Some("allBuilds[number,timestamp,duration,building,result,displayName,url]{0,100}")
    );

    let tasks: Vec<CicdTask> = rows(store.as_ref(), "cicd_tasks").await;
    assert_eq!(tasks.len(), 2);
    let finished = &tasks[by_id(&tasks, "jenkins:JenkinsBuild:6:deploy-prod#1", |t| t.id.as_str())];
    assert_eq!(finished.result, "FAILURE");
    assert_eq!(finished.status, "DONE");
    assert_eq!(finished.task_type, "DEPLOYMENT");
    assert_eq!(finished.duration_sec, 90);
    assert_eq!(finished.pipeline_id, "jenkins:JenkinsJob:6:deploy-prod");
    assert!(finished.finished_date.is_some());
    assert!(tasks.iter().all(|t| t.environment.is_none()));

    let running = &tasks[by_id(&tasks, "jenkins:JenkinsBuild:6:deploy-prod#2", |t| t.id.as_str())];
    assert_eq!(running.status, "IN_PROGRESS");
    assert_eq!(running.finished_date, None);

    let enriched = run_task(&env, "dora", json!({})).await;
    assert!(enriched.succeeded());
    let tasks: Vec<CicdTask> = rows(store.as_ref(), "cicd_tasks").await;
    assert!(tasks.iter().all(|t| t.environment.as_deref() == Some("PRODUCTION")));
}

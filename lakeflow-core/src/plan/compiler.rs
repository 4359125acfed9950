//! Blueprint scopes to an ordered, cross-plugin pipeline plan.
//!
//! Layout of a compiled plan:
//!
//! - stage 0: the owning connector task, plus `gitextractor` when code was
//!   requested and the connector resolved a repository;
//! - stage 1: `refdiff`, only when the transformation has a `refdiff` block;
//! - trailing stage: `dora` / `EnrichTaskEnv`, appended once when any scope
//!   asked for CI/CD data or set a `productionPattern`.
//!
//! All option validation happens before any remote lookup, and every lookup
//! runs at most once per scope key within one compile.

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use super::memo::MemoizedLookup;
use super::{BlueprintScope, PipelinePlan, PipelineTask};
use crate::error::CompileError;
use crate::fetcher::{ApiAuth, ApiClient};
use crate::registry::PluginRegistry;
use crate::types::{Connection, DomainType};

pub const GITEXTRACTOR: &str = "gitextractor";
pub const REFDIFF: &str = "refdiff";
pub const DORA: &str = "dora";
pub const ENRICH_TASK_ENV: &str = "EnrichTaskEnv";

pub const TAGS_ORDERS: [&str; 5] = [
    "",
    "alphabetically",
    "reverse alphabetically",
    "semver",
    "reverse semver",
];

/// A repository a connector resolved for a scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryRef {
    /// Domain id of the repo, e.g. `github:GithubRepo:1:12345`.
    pub repo_id: String,
    /// Clone URL with credentials already embedded.
    pub clone_url: String,
}

/// What a remote lookup contributed to one scope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedScope {
    /// Extra options merged into the connector task.
    pub options: Map<String, Value>,
    pub repository: Option<RepositoryRef>,
}

/// Connector-specific scope validation and remote resolution.
#[async_trait]
pub trait ScopePlanner: Send + Sync {
    /// Memoization key for a scope; malformed scope options fail here.
    fn scope_key(&self, scope: &BlueprintScope) -> Result<String, CompileError>;

    /// Whether resolved scopes can carry a repository for code retrieval.
    fn provides_repository(&self) -> bool {
        false
    }

    /// Credentials for lookups made while compiling.
    fn auth(&self, connection: &Connection) -> ApiAuth {
        ApiAuth::from_connection(connection)
    }

    async fn resolve_scope(
        &self,
        scope: &BlueprintScope,
        connection: &Connection,
        client: &dyn ApiClient,
    ) -> Result<ResolvedScope, CompileError>;
}

/// Locally validated view of one scope.
struct CheckedScope {
    types: Vec<DomainType>,
    key: Option<String>,
    refdiff: Option<Map<String, Value>>,
    rules: Map<String, Value>,
    enrich: bool,
}

/// Compiles blueprints against a registry.
pub struct PlanCompiler<'r> {
    registry: &'r PluginRegistry,
}

impl<'r> PlanCompiler<'r> {
    pub fn new(registry: &'r PluginRegistry) -> Self {
        Self { registry }
    }

    /// Compile `scopes` of connector `plugin` into a plan.
    pub async fn compile(
        &self,
        plugin: &str,
        scopes: &[BlueprintScope],
        connection: &Connection,
        client: &dyn ApiClient,
    ) -> Result<PipelinePlan, CompileError> {
        let connector = self
            .registry
            .get(plugin)
            .ok_or_else(|| CompileError::MissingPlugin {
                plugin: plugin.to_string(),
            })?;
        let planner = connector.scope_planner();
        let metas = connector.subtask_metas();

        let checked = scopes
            .iter()
            .map(|scope| self.check_scope(scope, planner.as_deref()))
            .collect::<Result<Vec<_>, _>>()?;

        let lookups = MemoizedLookup::<ResolvedScope>::new();
        let mut plan = PipelinePlan::new();
        for (scope, checked) in scopes.iter().zip(&checked) {
            let resolved = match (&planner, &checked.key) {
                (Some(planner), Some(key)) => {
                    lookups
                        .get_or_try_init(key, || planner.resolve_scope(scope, connection, client))
                        .await?
                }
                _ => ResolvedScope::default(),
            };

            let mut stage0 = Vec::new();
            let mut stage1 = Vec::new();

            let subtasks: Vec<String> = metas
                .iter()
                .filter(|m| m.serves_any(&checked.types))
                .map(|m| m.name.clone())
                .collect();
            if !subtasks.is_empty() {
                let mut options = Map::new();
                options.insert("connectionId".into(), json!(connection.id));
                options.extend(scope.options.clone());
                options.extend(resolved.options.clone());
                options.insert(
                    "transformationRules".into(),
                    Value::Object(checked.rules.clone()),
                );
                stage0.push(PipelineTask::new(plugin, subtasks, options));
            }

            let wants_code = checked.types.contains(&DomainType::Code);
            match (&resolved.repository, wants_code) {
                (Some(repo), true) => {
                    let mut options = Map::new();
                    options.insert("proxy".into(), json!(connection.proxy));
                    options.insert("repoId".into(), json!(repo.repo_id));
                    options.insert("url".into(), json!(repo.clone_url));
                    stage0.push(PipelineTask::new(GITEXTRACTOR, Vec::new(), options));

                    if let Some(refdiff) = &checked.refdiff {
                        let mut options = refdiff.clone();
                        options.insert("repoId".into(), json!(repo.repo_id));
                        stage1.push(PipelineTask::new(REFDIFF, Vec::new(), options));
                    }
                }
                _ if checked.refdiff.is_some() => {
                    return Err(CompileError::UnsupportedCombination {
                        message: format!(
                            "refdiff needs a repository, but none was resolved for scope '{}'",
                            checked.key.as_deref().unwrap_or_default()
                        ),
                    });
                }
                _ => {}
            }

            debug!(
                scope = checked.key.as_deref().unwrap_or_default(),
                stage0 = stage0.len(),
                stage1 = stage1.len(),
                "Planned scope"
            );
            plan.merge(PipelinePlan(vec![stage0, stage1]));
        }

        let mut plan = plan.compact();
        if checked.iter().any(|c| c.enrich) {
            plan.push_stage(vec![PipelineTask::new(
                DORA,
                vec![ENRICH_TASK_ENV.to_string()],
                Map::new(),
            )]);
        }
        info!(
            plugin,
            scopes = scopes.len(),
            stages = plan.len(),
            lookups = lookups.resolved(),
            "Compiled pipeline plan"
        );
        Ok(plan)
    }

    fn check_scope(
        &self,
        scope: &BlueprintScope,
        planner: Option<&dyn ScopePlanner>,
    ) -> Result<CheckedScope, CompileError> {
        let types = scope.domain_types();
        let key = planner.map(|p| p.scope_key(scope)).transpose()?;

        let mut rules = scope.transformation.clone();
        let refdiff = match rules.remove(REFDIFF) {
            None | Some(Value::Null) => None,
            Some(Value::Object(block)) => Some(check_refdiff(block)?),
            Some(other) => {
                return Err(CompileError::InvalidOptions {
                    message: format!("refdiff must be an object, got {other}"),
                });
            }
        };

        let production_pattern = match rules.get("productionPattern") {
            None | Some(Value::Null) => "",
            Some(Value::String(p)) => p.as_str(),
            Some(other) => {
                return Err(CompileError::InvalidOptions {
                    message: format!("productionPattern must be a string, got {other}"),
                });
            }
        };
        check_pattern("productionPattern", production_pattern)?;

        let wants_code = types.contains(&DomainType::Code);
        let provides_repository = planner.is_some_and(|p| p.provides_repository());
        if refdiff.is_some() && !(wants_code && provides_repository) {
            return Err(CompileError::UnsupportedCombination {
                message: "refdiff requires the CODE entity on a connector that resolves repositories"
                    .into(),
            });
        }

        if wants_code && provides_repository {
            self.require(GITEXTRACTOR)?;
        }
        if refdiff.is_some() {
            self.require(REFDIFF)?;
        }
        let enrich = types.contains(&DomainType::Cicd) || !production_pattern.is_empty();
        if enrich {
            self.require(DORA)?;
        }

        Ok(CheckedScope {
            types,
            key,
            refdiff,
            rules,
            enrich,
        })
    }

    fn require(&self, plugin: &str) -> Result<(), CompileError> {
        if self.registry.contains(plugin) {
            Ok(())
        } else {
            Err(CompileError::MissingPlugin {
                plugin: plugin.to_string(),
            })
        }
    }
}

fn check_refdiff(block: Map<String, Value>) -> Result<Map<String, Value>, CompileError> {
    match block.get("tagsOrder") {
        None | Some(Value::Null) => {}
        Some(Value::String(order)) if TAGS_ORDERS.contains(&order.as_str()) => {}
        Some(other) => {
            return Err(CompileError::InvalidOptions {
                message: format!(
                    "tagsOrder must be one of {:?}, got {other}",
                    &TAGS_ORDERS[1..]
                ),
            });
        }
    }

    match block.get("tagsLimit") {
        None | Some(Value::Null) => {}
        Some(Value::Number(n))
            if n.as_u64().is_some()
                || n.as_f64().is_some_and(|f| f >= 0.0 && f.fract() == 0.0) => {}
        Some(other) => {
            return Err(CompileError::InvalidOptions {
                message: format!("tagsLimit must be a non-negative integer, got {other}"),
            });
        }
    }

    match block.get("tagsPattern") {
        None | Some(Value::Null) => {}
        Some(Value::String(p)) => check_pattern("tagsPattern", p)?,
        Some(other) => {
            return Err(CompileError::InvalidOptions {
                message: format!("tagsPattern must be a string, got {other}"),
            });
        }
    }
    Ok(block)
}

fn check_pattern(field: &str, pattern: &str) -> Result<(), CompileError> {
    if pattern.is_empty() {
        return Ok(());
    }
    Regex::new(pattern)
        .map(|_| ())
        .map_err(|e| CompileError::InvalidPattern {
            field: field.to_string(),
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::ApiResponse;
    use crate::fetcher::testing::MockApiClient;
    use crate::plugin::{Plugin, TaskEnv};
    use crate::subtask::{SubTask, SubTaskContext, SubTaskMeta, entry};
    use futures::FutureExt;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn noop(_: &SubTaskContext<()>) -> futures::future::BoxFuture<'_, crate::error::Result<()>> {
        async { Ok(()) }.boxed()
    }

    /// Resolves `{owner, repo}` scopes through `repos/<owner>/<repo>`.
    struct RepoPlanner;

    #[async_trait]
    impl ScopePlanner for RepoPlanner {
        fn scope_key(&self, scope: &BlueprintScope) -> Result<String, CompileError> {
            match (scope.option_str("owner"), scope.option_str("repo")) {
                (Some(owner), Some(repo)) => Ok(format!("{owner}/{repo}")),
                _ => Err(CompileError::InvalidOptions {
                    message: "owner and repo are required".into(),
                }),
            }
        }

        fn provides_repository(&self) -> bool {
            true
        }

        async fn resolve_scope(
            &self,
            scope: &BlueprintScope,
            connection: &Connection,
            client: &dyn ApiClient,
        ) -> Result<ResolvedScope, CompileError> {
            let key = self.scope_key(scope)?;
            let response = client
                .get(&format!("repos/{key}"), &[], &Default::default())
                .await
                .and_then(crate::fetcher::classify_response)
                .map_err(|e| CompileError::Lookup {
                    scope: key.clone(),
                    message: e.to_string(),
                })?;
            let body: Value = response.json().map_err(|e| CompileError::Lookup {
                scope: key.clone(),
                message: e.to_string(),
            })?;
            Ok(ResolvedScope {
                options: Map::new(),
                repository: Some(RepositoryRef {
                    repo_id: format!("demo:DemoRepo:{}:{}", connection.id, body["id"]),
                    clone_url: body["clone_url"].as_str().unwrap_or_default().to_string(),
                }),
            })
        }
    }

    struct Fake {
        name: &'static str,
        steps: Vec<SubTaskMeta>,
        planner: bool,
    }

    #[async_trait]
    impl Plugin for Fake {
        type TaskData = ();

        fn name(&self) -> &'static str {
            self.name
        }

        fn description(&self) -> &'static str {
            "fake"
        }

        fn root_package_path(&self) -> &'static str {
            "lakeflow/plugins/fake"
        }

        fn subtasks(&self) -> Vec<SubTask<()>> {
            self.steps
                .iter()
                .cloned()
                .map(|m| SubTask::new(m, entry(noop)))
                .collect()
        }

        async fn prepare_task_data(&self, _: &Value, _: &TaskEnv) -> crate::error::Result<()> {
            Ok(())
        }

        fn scope_planner(&self) -> Option<Arc<dyn ScopePlanner>> {
            self.planner.then(|| Arc::new(RepoPlanner) as Arc<dyn ScopePlanner>)
        }
    }

    fn registry(companions: &[&'static str]) -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        registry
            .register(Fake {
                name: "demo",
                steps: vec![
                    SubTaskMeta::new("CollectRepo").domain_types(&[DomainType::Code]),
                    SubTaskMeta::new("CollectIssues").domain_types(&[DomainType::Ticket]),
                    SubTaskMeta::new("CollectRuns").domain_types(&[DomainType::Cicd]),
                ],
                planner: true,
            })
            .unwrap();
        for name in companions {
            registry
                .register(Fake {
                    name,
                    steps: vec![SubTaskMeta::new("Run").domain_types(&[DomainType::Code])],
                    planner: false,
                })
                .unwrap();
        }
        registry
    }

    fn full_registry() -> PluginRegistry {
        registry(&[GITEXTRACTOR, REFDIFF, DORA])
    }

    fn client() -> MockApiClient {
        MockApiClient::new(|path, _| {
            let id = if path.ends_with("lake") { 12345 } else { 777 };
            ApiResponse::json_ok("", &json!({"id": id, "clone_url": format!("https://x/{id}.git")}))
        })
    }

    fn connection() -> Connection {
        Connection {
            id: 1,
            name: "demo".into(),
            plugin: "demo".into(),
            endpoint: "https://api.example.com/".into(),
            ..Default::default()
        }
    }

    fn scope(value: Value) -> BlueprintScope {
        serde_json::from_value(value).unwrap()
    }

    fn code_scope(repo: &str) -> BlueprintScope {
        scope(json!({
            "entities": ["CODE"],
            "options": {"owner": "apache", "repo": repo},
            "transformation": {
                "prType": "type/(.*)$",
                "refdiff": {"tagsPattern": "v.*", "tagsLimit": 10, "tagsOrder": "reverse semver"},
                "productionPattern": "deploy"
            }
        }))
    }

    #[tokio::test]
    async fn test_code_scope_plan_layout() {
        let registry = full_registry();
        let client = client();
        let plan = PlanCompiler::new(&registry)
            .compile("demo", &[code_scope("lake")], &connection(), &client)
            .await
            .unwrap();

        let expected: PipelinePlan = serde_json::from_value(json!([
            [
                {
                    "plugin": "demo",
                    "subtasks": ["CollectRepo"],
                    "options": {
                        "connectionId": 1,
                        "owner": "apache",
                        "repo": "lake",
                        "transformationRules": {"prType": "type/(.*)$", "productionPattern": "deploy"}
                    }
                },
                {
                    "plugin": "gitextractor",
                    "subtasks": [],
                    "options": {"proxy": "", "repoId": "demo:DemoRepo:1:12345", "url": "https://x/12345.git"}
                }
            ],
            [
                {
                    "plugin": "refdiff",
                    "subtasks": [],
                    "options": {"repoId": "demo:DemoRepo:1:12345", "tagsLimit": 10, "tagsOrder": "reverse semver", "tagsPattern": "v.*"}
                }
            ],
            [
                {"plugin": "dora", "subtasks": ["EnrichTaskEnv"], "options": {}}
            ]
        ]))
        .unwrap();
        assert_eq!(plan, expected);
    }

    #[tokio::test]
    async fn test_same_scope_key_looked_up_once() {
        let registry = full_registry();
        let client = client();
        let plan = PlanCompiler::new(&registry)
            .compile(
                "demo",
                &[code_scope("lake"), code_scope("lake")],
                &connection(),
                &client,
            )
            .await
            .unwrap();
        assert_eq!(client.request_count(), 1);
        assert_eq!(plan.stages()[0].len(), 4);
        assert_eq!(plan.stages()[1].len(), 2);
        // The enrichment stage is appended once.
        assert_eq!(plan.stages()[2].len(), 1);
        assert_eq!(plan.len(), 3);
    }

    #[tokio::test]
    async fn test_distinct_scopes_merge_by_index() {
        let registry = full_registry();
        let client = client();
        let plan = PlanCompiler::new(&registry)
            .compile(
                "demo",
                &[code_scope("lake"), code_scope("other")],
                &connection(),
                &client,
            )
            .await
            .unwrap();
        assert_eq!(client.request_count(), 2);
        let repo_ids: Vec<_> = plan.stages()[1]
            .iter()
            .map(|t| t.options["repoId"].clone())
            .collect();
        assert_eq!(
            repo_ids,
            vec![json!("demo:DemoRepo:1:12345"), json!("demo:DemoRepo:1:777")]
        );
    }

    #[tokio::test]
    async fn test_compile_is_deterministic() {
        let registry = full_registry();
        let scopes = [code_scope("lake"), code_scope("other")];
        let a = PlanCompiler::new(&registry)
            .compile("demo", &scopes, &connection(), &client())
            .await
            .unwrap();
        let b = PlanCompiler::new(&registry)
            .compile("demo", &scopes, &connection(), &client())
            .await
            .unwrap();
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[tokio::test]
    async fn test_ticket_only_scope() {
        let registry = registry(&[]);
        let client = client();
        let plan = PlanCompiler::new(&registry)
            .compile(
                "demo",
                &[scope(json!({"entities": ["TICKET", "NOPE"], "options": {"owner": "a", "repo": "b"}}))],
                &connection(),
                &client,
            )
            .await
            .unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.stages()[0].len(), 1);
        assert_eq!(plan.stages()[0][0].subtasks, vec!["CollectIssues"]);
        assert_eq!(plan.stages()[0][0].options["transformationRules"], json!({}));
    }

    #[tokio::test]
    async fn test_cicd_entity_appends_enrichment() {
        let registry = registry(&[DORA]);
        let plan = PlanCompiler::new(&registry)
            .compile(
                "demo",
                &[scope(json!({"entities": ["CICD"], "options": {"owner": "a", "repo": "b"}}))],
                &connection(),
                &client(),
            )
            .await
            .unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.stages()[1][0].plugin, DORA);
    }

    #[tokio::test]
    async fn test_unknown_tags_contribute_nothing() {
        let registry = registry(&[]);
        let plan = PlanCompiler::new(&registry)
            .compile(
                "demo",
                &[scope(json!({"entities": ["BOGUS"], "options": {"owner": "a", "repo": "b"}}))],
                &connection(),
                &client(),
            )
            .await
            .unwrap();
        assert!(plan.is_empty());
    }

    async fn compile_err(registry: &PluginRegistry, scope: BlueprintScope) -> (CompileError, usize) {
        let client = client();
        let err = PlanCompiler::new(registry)
            .compile("demo", &[scope], &connection(), &client)
            .await
            .unwrap_err();
        (err, client.request_count())
    }

    #[tokio::test]
    async fn test_invalid_option_combinations_fail_before_lookup() {
        let registry = full_registry();
        let cases = [
            json!({"entities": ["CODE"], "options": {"owner": "a", "repo": "b"},
                   "transformation": {"refdiff": {"tagsOrder": "random"}}}),
            json!({"entities": ["CODE"], "options": {"owner": "a", "repo": "b"},
                   "transformation": {"refdiff": {"tagsLimit": -1}}}),
            json!({"entities": ["CODE"], "options": {"owner": "a", "repo": "b"},
                   "transformation": {"refdiff": {"tagsLimit": "ten"}}}),
            json!({"entities": ["CODE"], "options": {"owner": "a", "repo": "b"},
                   "transformation": {"refdiff": "yes"}}),
            json!({"entities": ["CODE"], "options": {"owner": "a"}}),
        ];
        for case in cases {
            let (err, requests) = compile_err(&registry, scope(case.clone())).await;
            assert!(matches!(err, CompileError::InvalidOptions { .. }), "{case}: {err}");
            assert_eq!(requests, 0);
        }
    }

    #[tokio::test]
    async fn test_refdiff_without_code_is_unsupported() {
        let (err, requests) = compile_err(
            &full_registry(),
            scope(json!({"entities": ["TICKET"], "options": {"owner": "a", "repo": "b"},
                         "transformation": {"refdiff": {"tagsLimit": 3}}})),
        )
        .await;
        assert!(matches!(err, CompileError::UnsupportedCombination { .. }));
        assert_eq!(requests, 0);
    }

    #[tokio::test]
    async fn test_invalid_patterns() {
        let (err, _) = compile_err(
            &full_registry(),
            scope(json!({"entities": ["CICD"], "options": {"owner": "a", "repo": "b"},
                         "transformation": {"productionPattern": "(unclosed"}})),
        )
        .await;
        assert!(matches!(err, CompileError::InvalidPattern { ref field, .. } if field == "productionPattern"));

        let (err, _) = compile_err(
            &full_registry(),
            scope(json!({"entities": ["CODE"], "options": {"owner": "a", "repo": "b"},
                         "transformation": {"refdiff": {"tagsPattern": "[v"}}})),
        )
        .await;
        assert!(matches!(err, CompileError::InvalidPattern { ref field, .. } if field == "tagsPattern"));
    }

    #[tokio::test]
    async fn test_missing_companion_plugin() {
        let (err, requests) = compile_err(&registry(&[GITEXTRACTOR]), code_scope("lake")).await;
        assert!(matches!(err, CompileError::MissingPlugin { ref plugin } if plugin == REFDIFF));
        assert_eq!(requests, 0);

        let client = client();
        let err = PlanCompiler::new(&full_registry())
            .compile("jira", &[code_scope("lake")], &connection(), &client)
            .await
            .unwrap_err();
        assert!(matches!(err, CompileError::MissingPlugin { ref plugin } if plugin == "jira"));
    }

    #[tokio::test]
    async fn test_lookup_failure_surfaces() {
        let registry = full_registry();
        let client = MockApiClient::new(|_, _| ApiResponse {
            status: 404,
            url: "mock://repos".into(),
            headers: Default::default(),
            body: bytes::Bytes::from_static(b"{}"),
        });
        let err = PlanCompiler::new(&registry)
            .compile("demo", &[code_scope("lake")], &connection(), &client)
            .await
            .unwrap_err();
        assert!(matches!(err, CompileError::Lookup { ref scope, .. } if scope == "apache/lake"));
        assert!(err.to_string().contains("404"));
    }
}

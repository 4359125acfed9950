//! Pipeline plans and the blueprint scopes they are compiled from.

pub mod compiler;
pub mod memo;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::subtask::SubTaskSelection;
use crate::types::DomainType;

pub use compiler::{PlanCompiler, RepositoryRef, ResolvedScope, ScopePlanner};
pub use memo::MemoizedLookup;

fn is_false(value: &bool) -> bool {
    !*value
}

/// One plugin invocation inside a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineTask {
    pub plugin: String,
    /// Empty runs the plugin's enabled-by-default subtasks.
    #[serde(default)]
    pub subtasks: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_subtasks: Vec<String>,
    #[serde(default)]
    pub options: Map<String, Value>,
    /// A failure of this task does not stop later stages.
    #[serde(default, skip_serializing_if = "is_false")]
    pub skip_on_fail: bool,
}

impl PipelineTask {
    pub fn new(plugin: impl Into<String>, subtasks: Vec<String>, options: Map<String, Value>) -> Self {
        Self {
            plugin: plugin.into(),
            subtasks,
            exclude_subtasks: Vec::new(),
            options,
            skip_on_fail: false,
        }
    }

    pub fn skip_on_fail(mut self, skip: bool) -> Self {
        self.skip_on_fail = skip;
        self
    }

    pub fn selection(&self) -> SubTaskSelection {
        SubTaskSelection {
            include: self.subtasks.clone(),
            exclude: self.exclude_subtasks.clone(),
        }
    }

    /// Label used in logs and failure reports.
    pub fn label(&self) -> String {
        if self.subtasks.is_empty() {
            self.plugin.clone()
        } else {
            format!("{}[{}]", self.plugin, self.subtasks.join(","))
        }
    }
}

/// Tasks that may run concurrently.
pub type PipelineStage = Vec<PipelineTask>;

/// Ordered stages; a stage only relies on the effects of earlier stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelinePlan(pub Vec<PipelineStage>);

impl PipelinePlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stages(&self) -> &[PipelineStage] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(Vec::is_empty)
    }

    pub fn push_stage(&mut self, stage: PipelineStage) {
        self.0.push(stage);
    }

    /// Append `other`'s stage `i` to this plan's stage `i`.
    pub fn merge(&mut self, other: PipelinePlan) {
        for (index, stage) in other.0.into_iter().enumerate() {
            match self.0.get_mut(index) {
                Some(existing) => existing.extend(stage),
                None => self.0.push(stage),
            }
        }
    }

    /// Drop empty stages.
    pub fn compact(mut self) -> Self {
        self.0.retain(|stage| !stage.is_empty());
        self
    }

    /// Same stages with the same tasks, ignoring task order inside a stage.
    pub fn is_equivalent(&self, other: &PipelinePlan) -> bool {
        fn keys(stage: &PipelineStage) -> Vec<String> {
            let mut keys: Vec<String> = stage
                .iter()
                .map(|t| serde_json::to_string(t).unwrap_or_default())
                .collect();
            keys.sort();
            keys
        }
        self.0.len() == other.0.len()
            && self.0.iter().zip(&other.0).all(|(a, b)| keys(a) == keys(b))
    }

    pub fn tasks(&self) -> impl Iterator<Item = &PipelineTask> {
        self.0.iter().flatten()
    }
}

/// One user-requested scope of a blueprint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlueprintScope {
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub options: Map<String, Value>,
    #[serde(default)]
    pub transformation: Map<String, Value>,
}

impl BlueprintScope {
    /// Requested domain types; unknown tags are ignored.
    pub fn domain_types(&self) -> Vec<DomainType> {
        let mut types: Vec<DomainType> = self
            .entities
            .iter()
            .filter_map(|e| e.parse().ok())
            .collect();
        types.sort();
        types.dedup();
        types
    }

    pub fn requests(&self, domain: DomainType) -> bool {
        self.domain_types().contains(&domain)
    }

    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }
}

/// A blueprint file: one connector, one connection, many scopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blueprint {
    pub plugin: String,
    pub connection_id: u64,
    pub scopes: Vec<BlueprintScope>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(plugin: &str, options: Value) -> PipelineTask {
        let Value::Object(options) = options else {
            panic!("options must be an object");
        };
        PipelineTask::new(plugin, vec![], options)
    }

    #[test]
    fn test_plan_json_shape() {
        let plan = PipelinePlan(vec![vec![PipelineTask::new(
            "dora",
            vec!["EnrichTaskEnv".into()],
            Map::new(),
        )]]);
        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(
            json,
            json!([[{"plugin": "dora", "subtasks": ["EnrichTaskEnv"], "options": {}}]])
        );
        let back: PipelinePlan = serde_json::from_value(json).unwrap();
        assert_eq!(back, plan);
    }

    #[test]
    fn test_skip_on_fail_serialization() {
        let t = task("jenkins", json!({})).skip_on_fail(true);
        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(json["skipOnFail"], true);
    }

    #[test]
    fn test_merge_by_index() {
        let mut a = PipelinePlan(vec![vec![task("github", json!({"repo": "a"}))]]);
        let b = PipelinePlan(vec![
            vec![task("github", json!({"repo": "b"}))],
            vec![task("refdiff", json!({}))],
        ]);
        a.merge(b);
        assert_eq!(a.len(), 2);
        assert_eq!(a.stages()[0].len(), 2);
        assert_eq!(a.stages()[1][0].plugin, "refdiff");
    }

    #[test]
    fn test_equivalence_ignores_order_within_stage() {
        let x = task("github", json!({"repo": "a"}));
        let y = task("gitextractor", json!({"url": "u"}));
        let a = PipelinePlan(vec![vec![x.clone(), y.clone()]]);
        let b = PipelinePlan(vec![vec![y.clone(), x.clone()]]);
        let c = PipelinePlan(vec![vec![x], vec![y]]);
        assert!(a.is_equivalent(&b));
        assert!(!a.is_equivalent(&c));
    }

    #[test]
    fn test_scope_domain_types_ignore_unknown() {
        let scope: BlueprintScope = serde_json::from_value(json!({
            "entities": ["CODE", "BOGUS", "TICKET", "CODE"],
            "options": {"owner": "apache"}
        }))
        .unwrap();
        assert_eq!(scope.domain_types(), vec![DomainType::Code, DomainType::Ticket]);
        assert_eq!(scope.option_str("owner"), Some("apache"));
        assert!(scope.transformation.is_empty());
    }

    #[test]
    fn test_task_selection_and_label() {
        let mut t = task("github", json!({}));
        assert_eq!(t.label(), "github");
        t.subtasks = vec!["CollectIssues".into()];
        t.exclude_subtasks = vec!["ExtractIssues".into()];
        assert_eq!(t.label(), "github[CollectIssues]");
        let selection = t.selection();
        assert_eq!(selection.include, vec!["CollectIssues"]);
        assert_eq!(selection.exclude, vec!["ExtractIssues"]);
    }
}

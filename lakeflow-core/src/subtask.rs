//! SubTask state machine: sequences a plugin's named steps for one task.
//!
//! Subtasks run strictly in registration order. Each one moves
//! `Pending -> Running -> {Succeeded, Failed, Skipped}`; a failed required
//! subtask (or cancellation) skips everything after it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use crate::error::{LakeflowError, SubTaskError};
use crate::progress::Progress;
use crate::store::Store;
use crate::types::DomainType;

/// Declarative description of one subtask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubTaskMeta {
    pub name: String,
    pub enabled_by_default: bool,
    pub required: bool,
    pub domain_types: Vec<DomainType>,
    pub description: String,
}

impl SubTaskMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled_by_default: true,
            required: false,
            domain_types: Vec::new(),
            description: String::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn domain_types(mut self, types: &[DomainType]) -> Self {
        self.domain_types = types.to_vec();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn disabled_by_default(mut self) -> Self {
        self.enabled_by_default = false;
        self
    }

    pub fn serves_any(&self, types: &[DomainType]) -> bool {
        self.domain_types.iter().any(|t| types.contains(t))
    }
}

/// Everything a running subtask can reach.
pub struct SubTaskContext<D> {
    pub plugin: String,
    pub name: String,
    pub data: Arc<D>,
    pub store: Arc<dyn Store>,
    pub cancel: CancellationToken,
    pub progress: Progress,
}

/// The code behind a subtask.
#[async_trait]
pub trait SubTaskEntryPoint<D>: Send + Sync {
    async fn execute(&self, ctx: &SubTaskContext<D>) -> crate::error::Result<()>;
}

#[async_trait]
impl<D, F> SubTaskEntryPoint<D> for F
where
    D: Send + Sync + 'static,
    F: for<'a> Fn(
            &'a SubTaskContext<D>,
        ) -> futures::future::BoxFuture<'a, crate::error::Result<()>>
        + Send
        + Sync,
{
    async fn execute(&self, ctx: &SubTaskContext<D>) -> crate::error::Result<()> {
        (self)(ctx).await
    }
}

/// A registered subtask: metadata plus entry point.
pub struct SubTask<D> {
    pub meta: SubTaskMeta,
    pub entry_point: Arc<dyn SubTaskEntryPoint<D>>,
}

impl<D> SubTask<D> {
    pub fn new(meta: SubTaskMeta, entry_point: impl SubTaskEntryPoint<D> + 'static) -> Self {
        Self {
            meta,
            entry_point: Arc::new(entry_point),
        }
    }
}

impl<D> Clone for SubTask<D> {
    fn clone(&self) -> Self {
        Self {
            meta: self.meta.clone(),
            entry_point: Arc::clone(&self.entry_point),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubTaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl fmt::Display for SubTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubTaskStatus::Pending => write!(f, "pending"),
            SubTaskStatus::Running => write!(f, "running"),
            SubTaskStatus::Succeeded => write!(f, "succeeded"),
            SubTaskStatus::Failed => write!(f, "failed"),
            SubTaskStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Terminal state of one subtask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTaskReport {
    pub name: String,
    pub status: SubTaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub progress: usize,
}

impl SubTaskReport {
    fn skipped(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: SubTaskStatus::Skipped,
            error: None,
            duration_ms: 0,
            progress: 0,
        }
    }
}

/// Outcome of running one task's subtasks.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRunReport {
    pub plugin: String,
    pub subtasks: Vec<SubTaskReport>,
    /// Why the task failed, if it did. Optional subtask failures leave this empty.
    #[serde(skip)]
    pub failure: Option<SubTaskError>,
}

impl TaskRunReport {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    pub fn status_of(&self, name: &str) -> Option<SubTaskStatus> {
        self.subtasks.iter().find(|r| r.name == name).map(|r| r.status)
    }
}

/// Which subtasks a task asks for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubTaskSelection {
    /// Empty means every subtask enabled by default.
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl SubTaskSelection {
    pub fn defaults() -> Self {
        Self::default()
    }

    pub fn only<S: AsRef<str>>(names: &[S]) -> Self {
        Self {
            include: names.iter().map(|n| n.as_ref().to_string()).collect(),
            exclude: Vec::new(),
        }
    }

    pub fn excluding<S: AsRef<str>>(mut self, names: &[S]) -> Self {
        self.exclude
            .extend(names.iter().map(|n| n.as_ref().to_string()));
        self
    }
}

/// Runs the subtasks of one plugin in registration order.
pub struct SubTaskRunner<D> {
    plugin: String,
    subtasks: Vec<SubTask<D>>,
}

impl<D: Send + Sync + 'static> SubTaskRunner<D> {
    pub fn new(plugin: impl Into<String>, subtasks: Vec<SubTask<D>>) -> Self {
        Self {
            plugin: plugin.into(),
            subtasks,
        }
    }

    /// Decide which subtasks run, in registration order.
    ///
    /// Fails on any unknown name before anything runs. Required subtasks are
    /// always enabled.
    pub fn plan(&self, selection: &SubTaskSelection) -> Result<Vec<bool>, SubTaskError> {
        let known: HashSet<&str> = self.subtasks.iter().map(|s| s.meta.name.as_str()).collect();
        for name in selection.include.iter().chain(&selection.exclude) {
            if !known.contains(name.as_str()) {
                return Err(SubTaskError::UnknownSubTask {
                    plugin: self.plugin.clone(),
                    name: name.clone(),
                });
            }
        }

        Ok(self
            .subtasks
            .iter()
            .map(|s| {
                let meta = &s.meta;
                if meta.required {
                    return true;
                }
                let selected = if selection.include.is_empty() {
                    meta.enabled_by_default
                } else {
                    selection.include.iter().any(|n| *n == meta.name)
                };
                selected && !selection.exclude.iter().any(|n| *n == meta.name)
            })
            .collect())
    }

    /// Run the selected subtasks sequentially.
    ///
    /// Returns `Err` only when the selection names an unknown subtask; every
    /// other outcome is described by the report.
    pub async fn run(
        &self,
        selection: &SubTaskSelection,
        data: Arc<D>,
        store: Arc<dyn Store>,
        cancel: CancellationToken,
    ) -> Result<TaskRunReport, SubTaskError> {
        let enabled = self.plan(selection)?;
        let mut reports = Vec::with_capacity(self.subtasks.len());
        let mut failure: Option<SubTaskError> = None;

        for (subtask, enabled) in self.subtasks.iter().zip(enabled) {
            let name = subtask.meta.name.as_str();
            if failure.is_some() || !enabled {
                reports.push(SubTaskReport::skipped(name));
                continue;
            }

            let ctx = SubTaskContext {
                plugin: self.plugin.clone(),
                name: name.to_string(),
                data: Arc::clone(&data),
                store: Arc::clone(&store),
                cancel: cancel.clone(),
                progress: Progress::new(),
            };
            let span = info_span!("subtask", plugin = %self.plugin, subtask = name);
            let started = Instant::now();
            let outcome = async {
                info!("Running subtask");
                if cancel.is_cancelled() {
                    return Err(LakeflowError::SubTask(SubTaskError::Cancelled {
                        name: name.to_string(),
                    }));
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(LakeflowError::SubTask(SubTaskError::Cancelled {
                        name: name.to_string(),
                    })),
                    result = subtask.entry_point.execute(&ctx) => result,
                }
            }
            .instrument(span.clone())
            .await;

            let mut report = SubTaskReport {
                name: name.to_string(),
                status: SubTaskStatus::Succeeded,
                error: None,
                duration_ms: started.elapsed().as_millis() as u64,
                progress: ctx.progress.current(),
            };
            match outcome {
                Ok(()) => {
                    info!(parent: &span, duration_ms = report.duration_ms, "Subtask succeeded");
                }
                Err(e) if e.is_cancelled() || cancel.is_cancelled() => {
                    report.status = SubTaskStatus::Failed;
                    report.error = Some(e.to_string());
                    warn!(parent: &span, "Subtask cancelled");
                    failure = Some(SubTaskError::Cancelled {
                        name: name.to_string(),
                    });
                }
                Err(e) => {
                    report.status = SubTaskStatus::Failed;
                    report.error = Some(e.to_string());
                    if subtask.meta.required {
                        error!(parent: &span, error = %e, "Required subtask failed");
                        failure = Some(SubTaskError::RequiredFailed {
                            name: name.to_string(),
                            message: e.to_string(),
                        });
                    } else {
                        warn!(parent: &span, error = %e, "Optional subtask failed, continuing");
                    }
                }
            }
            reports.push(report);
        }

        Ok(TaskRunReport {
            plugin: self.plugin.clone(),
            subtasks: reports,
            failure,
        })
    }

    /// Report for a task whose data could not be prepared.
    ///
    /// The first enabled subtask carries the preparation error and the rest
    /// are skipped, so every subtask still ends in a terminal state.
    pub fn not_started(
        &self,
        selection: &SubTaskSelection,
        cause: &LakeflowError,
    ) -> Result<TaskRunReport, SubTaskError> {
        let enabled = self.plan(selection)?;
        let mut failure: Option<SubTaskError> = None;
        let mut reports = Vec::with_capacity(self.subtasks.len());
        for (subtask, enabled) in self.subtasks.iter().zip(enabled) {
            let name = subtask.meta.name.as_str();
            if failure.is_some() || !enabled {
                reports.push(SubTaskReport::skipped(name));
                continue;
            }
            failure = Some(if cause.is_cancelled() {
                SubTaskError::Cancelled {
                    name: name.to_string(),
                }
            } else {
                SubTaskError::PreparationFailed {
                    plugin: self.plugin.clone(),
                    message: cause.to_string(),
                }
            });
            reports.push(SubTaskReport {
                name: name.to_string(),
                status: SubTaskStatus::Failed,
                error: Some(cause.to_string()),
                duration_ms: 0,
                progress: 0,
            });
        }
        error!(plugin = %self.plugin, error = %cause, "Task preparation failed");

        Ok(TaskRunReport {
            plugin: self.plugin.clone(),
            subtasks: reports,
            failure: Some(failure.unwrap_or_else(|| SubTaskError::PreparationFailed {
                plugin: self.plugin.clone(),
                message: cause.to_string(),
            })),
        })
    }

    pub fn metas(&self) -> impl Iterator<Item = &SubTaskMeta> {
        self.subtasks.iter().map(|s| &s.meta)
    }
}

/// Box an async fn into a subtask entry point.
///
/// ```ignore
/// SubTask::new(meta, entry(|ctx| Box::pin(collect_issues(ctx))))
/// ```
pub fn entry<D, F>(f: F) -> F
where
    F: for<'a> Fn(&'a SubTaskContext<D>) -> futures::future::BoxFuture<'a, crate::error::Result<()>>
        + Send
        + Sync,
{
    f
}

//! Pipeline executor: stages in order, tasks of a stage concurrently.
//!
//! A stage finishes completely before the next starts. Sibling tasks always
//! run to completion; the pipeline stops after a stage in which a task failed
//! without `skip_on_fail`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::error::{ExecutorError, LakeflowError};
use crate::plan::{PipelinePlan, PipelineTask};
use crate::plugin::{PluginRunner, TaskEnv};
use crate::registry::PluginRegistry;
use crate::subtask::{SubTaskReport, TaskRunReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Succeeded,
    Failed,
    Cancelled,
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStatus::Succeeded => write!(f, "succeeded"),
            PipelineStatus::Failed => write!(f, "failed"),
            PipelineStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReport {
    pub plugin: String,
    pub label: String,
    pub status: TaskStatus,
    pub skip_on_fail: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub subtasks: Vec<SubTaskReport>,
    pub duration_ms: u64,
    #[serde(skip)]
    cancelled: bool,
}

impl TaskReport {
    fn skipped(task: &PipelineTask) -> Self {
        Self {
            plugin: task.plugin.clone(),
            label: task.label(),
            status: TaskStatus::Skipped,
            skip_on_fail: task.skip_on_fail,
            error: None,
            subtasks: Vec::new(),
            duration_ms: 0,
            cancelled: false,
        }
    }

    fn finished(task: &PipelineTask, outcome: Result<TaskRunReport, LakeflowError>, duration_ms: u64) -> Self {
        let mut report = Self::skipped(task);
        report.duration_ms = duration_ms;
        match outcome {
            Ok(run) => {
                report.cancelled = matches!(
                    run.failure,
                    Some(crate::error::SubTaskError::Cancelled { .. })
                );
                report.status = if run.succeeded() {
                    TaskStatus::Succeeded
                } else {
                    TaskStatus::Failed
                };
                report.error = run.failure.as_ref().map(ToString::to_string);
                report.subtasks = run.subtasks;
            }
            Err(e) => {
                report.cancelled = e.is_cancelled();
                report.status = TaskStatus::Failed;
                report.error = Some(e.to_string());
            }
        }
        report
    }

    /// Failed and not tolerated.
    pub fn blocks_pipeline(&self) -> bool {
        self.status == TaskStatus::Failed && !self.skip_on_fail
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub index: usize,
    pub tasks: Vec<TaskReport>,
}

/// Outcome of a pipeline run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub status: PipelineStatus,
    pub stages: Vec<StageReport>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub failure: Option<ExecutorError>,
}

impl PipelineReport {
    pub fn succeeded(&self) -> bool {
        self.status == PipelineStatus::Succeeded
    }

    /// Convert a failed run into its error.
    pub fn into_result(self) -> Result<Self, ExecutorError> {
        match self.failure.clone() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }

    pub fn task(&self, stage: usize, plugin: &str) -> Option<&TaskReport> {
        self.stages
            .get(stage)?
            .tasks
            .iter()
            .find(|t| t.plugin == plugin)
    }
}

/// Runs compiled plans against a registry.
pub struct PipelineExecutor {
    registry: Arc<PluginRegistry>,
    env: TaskEnv,
    max_concurrent_tasks: usize,
}

impl PipelineExecutor {
    pub fn new(registry: Arc<PluginRegistry>, env: TaskEnv) -> Self {
        let max_concurrent_tasks = env.config.executor.max_concurrent_tasks.max(1);
        Self {
            registry,
            env,
            max_concurrent_tasks,
        }
    }

    pub fn max_concurrent_tasks(mut self, limit: usize) -> Self {
        self.max_concurrent_tasks = limit.max(1);
        self
    }

    /// Execute `plan`.
    ///
    /// Fails up front if a task names an unregistered plugin; otherwise the
    /// returned report describes success, failure, or cancellation.
    pub async fn execute(&self, plan: &PipelinePlan) -> Result<PipelineReport, ExecutorError> {
        for task in plan.tasks() {
            if !self.registry.contains(&task.plugin) {
                return Err(ExecutorError::PluginNotFound {
                    plugin: task.plugin.clone(),
                });
            }
        }

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let limit = Arc::new(Semaphore::new(self.max_concurrent_tasks));
        let mut stages = Vec::with_capacity(plan.len());
        let mut failure: Option<ExecutorError> = None;
        info!(%run_id, stages = plan.len(), "Starting pipeline");

        for (index, stage) in plan.stages().iter().enumerate() {
            if failure.is_none() && self.env.cancel.is_cancelled() {
                failure = Some(ExecutorError::Cancelled);
            }
            if failure.is_some() {
                stages.push(StageReport {
                    index,
                    tasks: stage.iter().map(TaskReport::skipped).collect(),
                });
                continue;
            }

            let tasks = self.run_stage(index, stage, &limit).await;
            let blocking: Vec<String> = tasks
                .iter()
                .filter(|t| t.blocks_pipeline())
                .map(|t| t.label.clone())
                .collect();
            if tasks.iter().any(|t| t.cancelled) || self.env.cancel.is_cancelled() {
                warn!(%run_id, stage = index, "Pipeline cancelled");
                failure = Some(ExecutorError::Cancelled);
            } else if !blocking.is_empty() {
                error!(%run_id, stage = index, failed = ?blocking, "Stage failed");
                failure = Some(ExecutorError::StageFailed {
                    stage: index,
                    failed: blocking,
                });
            }
            stages.push(StageReport { index, tasks });
        }

        let status = match &failure {
            None => PipelineStatus::Succeeded,
            Some(ExecutorError::Cancelled) => PipelineStatus::Cancelled,
            Some(_) => PipelineStatus::Failed,
        };
        info!(%run_id, %status, "Pipeline finished");
        Ok(PipelineReport {
            run_id,
            status,
            stages,
            started_at,
            finished_at: Utc::now(),
            error: failure.as_ref().map(ToString::to_string),
            failure,
        })
    }

    async fn run_stage(
        &self,
        index: usize,
        stage: &[PipelineTask],
        limit: &Arc<Semaphore>,
    ) -> Vec<TaskReport> {
        let mut set = JoinSet::new();
        for (position, task) in stage.iter().enumerate() {
            let Some(runner) = self.registry.get(&task.plugin) else {
                continue;
            };
            let task = task.clone();
            let env = self.env.clone();
            let limit = Arc::clone(limit);
            let span = info_span!("task", stage = index, plugin = %task.plugin);
            set.spawn(
                async move {
                    let _permit = limit.acquire_owned().await;
                    let started = Instant::now();
                    info!(label = %task.label(), "Running task");
                    let outcome = run_task(runner, &task, &env).await;
                    let report =
                        TaskReport::finished(&task, outcome, started.elapsed().as_millis() as u64);
                    match report.status {
                        TaskStatus::Succeeded => info!(duration_ms = report.duration_ms, "Task succeeded"),
                        _ => warn!(error = report.error.as_deref().unwrap_or_default(), "Task failed"),
                    }
                    (position, report)
                }
                .instrument(span),
            );
        }

        let mut reports: Vec<Option<TaskReport>> = vec![None; stage.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((position, report)) => reports[position] = Some(report),
                Err(e) => error!(stage = index, error = %e, "Task worker failed"),
            }
        }
        reports
            .into_iter()
            .zip(stage)
            .map(|(report, task)| {
                report.unwrap_or_else(|| {
                    let mut report = TaskReport::skipped(task);
                    report.status = TaskStatus::Failed;
                    report.error = Some("task worker did not complete".into());
                    report
                })
            })
            .collect()
    }
}

async fn run_task(
    runner: Arc<dyn PluginRunner>,
    task: &PipelineTask,
    env: &TaskEnv,
) -> Result<TaskRunReport, LakeflowError> {
    runner.run_task(task, env).await
}

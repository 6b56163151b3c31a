//! The task ledger engine and the runner that maps ledger entries onto
//! scheduler handlers.

use crate::context::{EngineConfig, EngineContext};
use crate::expansion::{ExpanderKind, ExpansionOutcome};
use crate::scheduler::JobScheduler;
use crucible_core::ports::{check_children, TaskQueue, TaskRepository};
use crucible_core::state::{Status, Verdict};
use crucible_core::task::{Task, TaskName, TaskOutcome};
use crucible_core::{BuildId, Error, JobId, Result, StepId};
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Ledger operations: idempotent submission and parent/child waiting.
#[derive(Clone)]
pub struct TaskEngine {
    tasks: Arc<dyn TaskRepository>,
    queue: Arc<dyn TaskQueue>,
}

impl TaskEngine {
    pub fn new(tasks: Arc<dyn TaskRepository>, queue: Arc<dyn TaskQueue>) -> Self {
        Self { tasks, queue }
    }

    pub fn from_context(ctx: &EngineContext) -> Self {
        Self::new(ctx.tasks.clone(), ctx.queue.clone())
    }

    /// Record the unit of work and hand it to the transport. The unique
    /// `(name, parent, child)` key makes a duplicate submission a silent
    /// no-op on the ledger side; the transport may still deliver twice.
    pub async fn submit(
        &self,
        name: TaskName,
        parent_id: Uuid,
        child_id: Uuid,
        countdown: Duration,
    ) -> Result<()> {
        self.submit_with_data(name, parent_id, child_id, Value::Null, countdown)
            .await
    }

    pub async fn submit_with_data(
        &self,
        name: TaskName,
        parent_id: Uuid,
        child_id: Uuid,
        data: Value,
        countdown: Duration,
    ) -> Result<()> {
        let mut task = Task::new(name, parent_id, child_id);
        task.data = data;
        let created = self.tasks.submit(&task).await?;
        if !created {
            debug!(%name, %child_id, "task already submitted");
        }
        self.queue.enqueue(name, parent_id, child_id, countdown).await
    }

    /// `InProgress` while any child task under `(name, parent)` is
    /// unfinished, else `Finished`.
    pub async fn check(&self, name: TaskName, parent_id: Uuid) -> Result<Status> {
        let children = self.tasks.list_children(name, parent_id).await?;
        Ok(check_children(&children))
    }
}

#[derive(Debug, Deserialize)]
struct ExpandPayload {
    expander: ExpanderKind,
    manifest: Value,
}

/// Drives one task delivery to completion: dispatches to the handler and
/// settles the ledger row according to the tri-state outcome.
pub struct TaskRunner {
    scheduler: Arc<JobScheduler>,
    ledger: TaskEngine,
    config: EngineConfig,
}

impl TaskRunner {
    pub fn new(scheduler: Arc<JobScheduler>) -> Self {
        let ctx = scheduler.context();
        let ledger = TaskEngine::from_context(ctx);
        let config = ctx.config.clone();
        Self {
            scheduler,
            ledger,
            config,
        }
    }

    /// Process one delivery from the transport.
    pub async fn process(&self, name: TaskName, parent_id: Uuid, child_id: Uuid) -> Result<()> {
        let mut task = match self.ledger.tasks.get(name, parent_id, child_id).await? {
            Some(task) => task,
            None => {
                // Delivery for a row we never saw (e.g. transport replay
                // after a prune); recreate the ledger entry.
                let task = Task::new(name, parent_id, child_id);
                self.ledger.tasks.submit(&task).await?;
                task
            }
        };
        if task.status.is_finished() {
            debug!(%name, %child_id, "duplicate delivery of a finished task");
            return Ok(());
        }

        task.status = Status::InProgress;
        task.date_modified = Utc::now();
        self.ledger.tasks.update(&task).await?;

        match self.dispatch(&task).await {
            Ok(TaskOutcome::Done) => {
                task.status = Status::Finished;
                task.verdict = Verdict::Passed;
                task.date_modified = Utc::now();
                self.ledger.tasks.update(&task).await
            }
            Ok(TaskOutcome::Reschedule { delay }) => {
                // Not an error and not a retry: the handler simply is not
                // done yet.
                task.date_modified = Utc::now();
                self.ledger.tasks.update(&task).await?;
                self.ledger.queue.enqueue(name, parent_id, child_id, delay).await
            }
            Err(err) if err.is_unrecoverable() => {
                error!(%name, %child_id, %err, "unrecoverable task error");
                self.scheduler.abort(name, child_id).await?;
                task.status = Status::Finished;
                task.verdict = Verdict::Aborted;
                task.date_modified = Utc::now();
                self.ledger.tasks.update(&task).await
            }
            Err(err) => {
                task.num_retries += 1;
                task.date_modified = Utc::now();
                if task.num_retries > self.config.max_task_retries {
                    warn!(%name, %child_id, %err, retries = task.num_retries, "task retries exhausted");
                    self.scheduler.abort(name, child_id).await?;
                    task.status = Status::Finished;
                    task.verdict = Verdict::Failed;
                    self.ledger.tasks.update(&task).await
                } else {
                    warn!(%name, %child_id, %err, retries = task.num_retries, "task failed, retrying");
                    self.ledger.tasks.update(&task).await?;
                    self.ledger
                        .queue
                        .enqueue(name, parent_id, child_id, self.config.retry_countdown())
                        .await
                }
            }
        }
    }

    async fn dispatch(&self, task: &Task) -> Result<TaskOutcome> {
        match task.name {
            TaskName::CreateJob => {
                self.scheduler
                    .start_job(JobId::from_uuid(task.child_id))
                    .await
            }
            TaskName::SyncJob => {
                self.scheduler
                    .sync_job(JobId::from_uuid(task.child_id))
                    .await
            }
            TaskName::SyncStep => {
                self.scheduler
                    .sync_step(StepId::from_uuid(task.child_id))
                    .await
            }
            TaskName::SyncBuild => {
                self.scheduler
                    .sync_build(BuildId::from_uuid(task.child_id))
                    .await
            }
            TaskName::ExpandStep => {
                let payload: ExpandPayload = serde_json::from_value(task.data.clone())
                    .map_err(|e| Error::Serialization(e.to_string()))?;
                let outcome = self
                    .scheduler
                    .request_expansion(
                        StepId::from_uuid(task.child_id),
                        payload.expander,
                        &payload.manifest,
                    )
                    .await?;
                match outcome {
                    ExpansionOutcome::LockBusy => Ok(TaskOutcome::Reschedule {
                        delay: self.config.poll_interval(),
                    }),
                    _ => Ok(TaskOutcome::Done),
                }
            }
        }
    }
}

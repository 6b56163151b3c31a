//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the core domain and external
//! adapters: the relational store, the task-queue transport, the lease-lock
//! service and the signal bus.

use crate::build::{Build, Command, FailureReason, Job, JobPhase, JobPlan, JobStep};
use crate::events::Signal;
use crate::ids::*;
use crate::state::Status;
use crate::task::{Task, TaskName};
use crate::Result;
use async_trait::async_trait;
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;
use uuid::Uuid;

/// Stream of signals.
pub type SignalStream = Pin<Box<dyn Stream<Item = Result<Signal>> + Send>>;

/// Repository for builds.
#[async_trait]
pub trait BuildRepository: Send + Sync {
    /// Create a new build.
    async fn create(&self, build: &Build) -> Result<BuildId>;

    /// Get a build by ID.
    async fn get(&self, id: BuildId) -> Result<Option<Build>>;

    /// Update a build.
    async fn update(&self, build: &Build) -> Result<()>;

    /// Get the next build number for a project.
    async fn next_build_number(&self, project_id: ProjectId) -> Result<u32>;
}

/// Repository for jobs and their plan snapshots.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Create a new job.
    async fn create(&self, job: &Job) -> Result<JobId>;

    /// Get a job by ID.
    async fn get(&self, id: JobId) -> Result<Option<Job>>;

    /// Update a job.
    async fn update(&self, job: &Job) -> Result<()>;

    /// Get all jobs of a build.
    async fn list_by_build(&self, build_id: BuildId) -> Result<Vec<Job>>;

    /// Store the immutable plan snapshot for a job.
    async fn create_plan(&self, plan: &JobPlan) -> Result<PlanId>;

    /// Get the plan snapshot bound to a job.
    async fn get_plan(&self, job_id: JobId) -> Result<Option<JobPlan>>;
}

/// Repository for job phases.
#[async_trait]
pub trait PhaseRepository: Send + Sync {
    /// Insert-or-get on the `(job_id, label)` unique key. Concurrent
    /// creators converge on one row instead of erroring.
    async fn create_or_get(&self, phase: &JobPhase) -> Result<JobPhase>;

    /// Get a phase by ID.
    async fn get(&self, id: PhaseId) -> Result<Option<JobPhase>>;

    /// Update a phase.
    async fn update(&self, phase: &JobPhase) -> Result<()>;

    /// Get all phases of a job, ordered by creation time.
    async fn list_by_job(&self, job_id: JobId) -> Result<Vec<JobPhase>>;

    /// Count the phases of a job.
    async fn count_by_job(&self, job_id: JobId) -> Result<usize>;
}

/// Repository for job steps.
#[async_trait]
pub trait StepRepository: Send + Sync {
    /// Create a new step.
    async fn create(&self, step: &JobStep) -> Result<StepId>;

    /// Get a step by ID.
    async fn get(&self, id: StepId) -> Result<Option<JobStep>>;

    /// Update a step.
    async fn update(&self, step: &JobStep) -> Result<()>;

    /// Get all steps of a phase, replaced ones included.
    async fn list_by_phase(&self, phase_id: PhaseId) -> Result<Vec<JobStep>>;

    /// Get all steps of a job, replaced ones included.
    async fn list_by_job(&self, job_id: JobId) -> Result<Vec<JobStep>>;

    /// Steps that have not been replaced: the live tip of each chain.
    async fn current_by_phase(&self, phase_id: PhaseId) -> Result<Vec<JobStep>>;
}

/// Repository for step commands.
#[async_trait]
pub trait CommandRepository: Send + Sync {
    /// Create a new command.
    async fn create(&self, command: &Command) -> Result<CommandId>;

    /// Get a command by ID.
    async fn get(&self, id: CommandId) -> Result<Option<Command>>;

    /// Update a command.
    async fn update(&self, command: &Command) -> Result<()>;

    /// Get the commands of a step in ascending execution order.
    async fn list_by_step(&self, step_id: StepId) -> Result<Vec<Command>>;
}

/// Repository for task ledger rows.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Idempotent insert on `(name, parent_id, child_id)`. Returns false
    /// when the row already existed; a duplicate submission is not an error.
    async fn submit(&self, task: &Task) -> Result<bool>;

    /// Get a ledger row by its unique key.
    async fn get(&self, name: TaskName, parent_id: Uuid, child_id: Uuid) -> Result<Option<Task>>;

    /// Update a ledger row.
    async fn update(&self, task: &Task) -> Result<()>;

    /// Get all child tasks under a `(name, parent_id)` key.
    async fn list_children(&self, name: TaskName, parent_id: Uuid) -> Result<Vec<Task>>;
}

/// Repository for append-only failure annotations.
#[async_trait]
pub trait FailureReasonRepository: Send + Sync {
    /// Record a failure reason. Rows accumulate; nothing is overwritten.
    async fn record(&self, reason: &FailureReason) -> Result<()>;

    /// Get the failure reasons recorded for a step.
    async fn list_by_step(&self, step_id: StepId) -> Result<Vec<FailureReason>>;

    /// Get the failure reasons recorded for a build.
    async fn list_by_build(&self, build_id: BuildId) -> Result<Vec<FailureReason>>;
}

/// Task-queue transport. At-least-once delivery is assumed; duplicate
/// deliveries are expected and tolerated by the ledger's idempotent upserts.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a task for delivery after `countdown`.
    async fn enqueue(
        &self,
        name: TaskName,
        parent_id: Uuid,
        child_id: Uuid,
        countdown: Duration,
    ) -> Result<()>;
}

/// Lease-based mutual exclusion with non-blocking acquisition, provided by
/// an external lock service.
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Try to acquire `key` for `ttl`. Returns false when held elsewhere;
    /// callers abort the attempt rather than queueing.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Release `key`. The lease expires on its own if this is never called.
    async fn release(&self, key: &str) -> Result<()>;
}

/// Bus for publishing and subscribing to lifecycle signals.
#[async_trait]
pub trait SignalBus: Send + Sync {
    /// Fire a signal.
    async fn fire(&self, signal: Signal) -> Result<()>;

    /// Subscribe to signals matching a subject pattern.
    async fn subscribe(&self, pattern: &str) -> Result<SignalStream>;
}

/// Historical per-test durations used to weight shards.
#[derive(Debug, Clone, Default)]
pub struct TestStats {
    pub durations_ms: HashMap<String, u64>,
    pub avg_duration_ms: u64,
}

impl TestStats {
    /// Duration for one test, falling back to the overall average for tests
    /// with no history.
    pub fn weight_for(&self, name: &str) -> u64 {
        self.durations_ms
            .get(name)
            .copied()
            .unwrap_or(self.avg_duration_ms)
    }
}

/// Source of historical test durations, read from the most recent passing
/// build of the project's designated stats project.
#[async_trait]
pub trait TestStatsProvider: Send + Sync {
    async fn durations(&self, project_id: ProjectId) -> Result<TestStats>;
}

/// Convenience check used by parents waiting on children: `InProgress`
/// while any child ledger row is unfinished, else `Finished`.
pub fn check_children(children: &[Task]) -> Status {
    if children.iter().any(|t| !t.status.is_finished()) {
        Status::InProgress
    } else {
        Status::Finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_test_stats_fallback() {
        let mut stats = TestStats::default();
        stats.avg_duration_ms = 25;
        stats.durations_ms.insert("a".to_string(), 50);
        assert_eq!(stats.weight_for("a"), 50);
        assert_eq!(stats.weight_for("missing"), 25);
    }

    #[test]
    fn test_check_children() {
        use crate::task::TaskName;
        let parent = Uuid::now_v7();
        let mut a = Task::new(TaskName::SyncStep, parent, Uuid::now_v7());
        let mut b = Task::new(TaskName::SyncStep, parent, Uuid::now_v7());
        a.status = Status::Finished;
        assert_eq!(check_children(&[a.clone(), b.clone()]), Status::InProgress);
        b.status = Status::Finished;
        assert_eq!(check_children(&[a, b]), Status::Finished);
        assert_eq!(check_children(&[]), Status::Finished);
    }
}

//! The job/phase/step state machine: job start, the sync/timeout loop,
//! replacement-on-failure, cancellation, and the inbound report surface.

use crate::buildstep::{resolve_buildstep, BuildStep};
use crate::context::EngineContext;
use crate::expansion::{self, ExpanderKind, ExpansionOutcome};
use crate::propagation;
use crate::tasks::TaskEngine;
use chrono::{DateTime, Utc};
use crucible_core::build::{
    Artifact, BackendSpec, Build, FailureReason, Job, JobPlan, JobStep, Reason,
};
use crucible_core::events::Signal;
use crucible_core::state::{Cause, Status, Verdict};
use crucible_core::task::{TaskName, TaskOutcome};
use crucible_core::{
    BuildId, CommandId, Error, JobId, NodeId, ProjectId, Result, StepId,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Inbound trigger payload: one build across one or more plans.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub project_id: ProjectId,
    pub cause: Cause,
    pub label: Option<String>,
    pub target: Option<String>,
    pub message: Option<String>,
    pub plans: Vec<PlanRequest>,
}

/// One plan the build executes against; snapshotted into an immutable
/// `JobPlan` at job creation.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub label: String,
    pub backend: BackendSpec,
    pub timeout_minutes: Option<u32>,
}

pub struct JobScheduler {
    ctx: EngineContext,
    ledger: TaskEngine,
}

impl JobScheduler {
    pub fn new(ctx: EngineContext) -> Self {
        let ledger = TaskEngine::from_context(&ctx);
        Self { ctx, ledger }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn ledger(&self) -> &TaskEngine {
        &self.ledger
    }

    /// Create a build and one job per plan, scheduling job start tasks.
    pub async fn create_build(&self, request: BuildRequest) -> Result<Build> {
        let number = self.ctx.builds.next_build_number(request.project_id).await?;
        let mut build = Build::new(request.project_id, number, request.cause);
        build.label = request.label;
        build.target = request.target;
        build.message = request.message;
        self.ctx.builds.create(&build).await?;

        for plan in request.plans {
            let job = Job::new(build.id, build.project_id, plan.label.clone());
            self.ctx.jobs.create(&job).await?;

            let mut snapshot = JobPlan::new(job.id, plan.label, plan.backend);
            if let Some(timeout) = plan.timeout_minutes {
                snapshot.timeout_minutes = timeout;
            }
            self.ctx.jobs.create_plan(&snapshot).await?;

            self.ledger
                .submit(
                    TaskName::CreateJob,
                    *build.id.as_uuid(),
                    *job.id.as_uuid(),
                    Duration::ZERO,
                )
                .await?;
        }

        info!(build = %build.id, project = %build.project_id, "created build");
        self.ctx
            .signals
            .fire(Signal::BuildCreated {
                build_id: build.id,
                project_id: build.project_id,
                cause: build.cause,
            })
            .await?;
        Ok(build)
    }

    /// Handler for `create_job`: resolve the plan's backend and let it
    /// create the initial phase and steps.
    pub async fn start_job(&self, job_id: JobId) -> Result<TaskOutcome> {
        let mut job = self.load_job(job_id).await?;
        if job.status.is_finished() {
            return Ok(TaskOutcome::Done);
        }

        let (_plan, buildstep) = self.resolve_for_job(job_id).await?;
        buildstep.validate()?;

        job.status = Status::InProgress;
        job.date_started = Some(Utc::now());
        self.ctx.jobs.update(&job).await?;

        let steps = buildstep.execute(&self.ctx, &mut job).await?;
        for step in &steps {
            self.ledger
                .submit(
                    TaskName::SyncStep,
                    *job_id.as_uuid(),
                    *step.id.as_uuid(),
                    Duration::ZERO,
                )
                .await?;
        }
        self.ledger
            .submit(
                TaskName::SyncJob,
                *job.build_id.as_uuid(),
                *job_id.as_uuid(),
                self.ctx.config.poll_interval(),
            )
            .await?;

        info!(job = %job_id, steps = steps.len(), "started job");
        self.ctx
            .signals
            .fire(Signal::JobStarted {
                job_id,
                build_id: job.build_id,
            })
            .await?;
        Ok(TaskOutcome::Done)
    }

    /// Handler for `sync_step`: poll the backend, detect timeouts, and on
    /// completion enforce the final-command guard and drive replacement.
    pub async fn sync_step(&self, step_id: StepId) -> Result<TaskOutcome> {
        let mut step = self.load_step(step_id).await?;
        let job = self.load_job(step.job_id).await?;
        let (plan, buildstep) = self.resolve_for_job(step.job_id).await?;

        if !step.status.is_finished() {
            buildstep.update_step(&self.ctx, &mut step).await?;
            self.check_step_timeout(&mut step, &job, &plan, buildstep.as_ref())
                .await?;
        }

        if step.status.is_finished() {
            self.apply_final_command_guard(&mut step, &job).await?;

            // Replacement is attempted once per chain link; a step that
            // already points at a replacement is settled.
            if step.verdict == Verdict::InfraFailed && step.replacement_id.is_none() {
                if let Some(replacement) = buildstep
                    .create_replacement_jobstep(&self.ctx, &step)
                    .await?
                {
                    self.ledger
                        .submit(
                            TaskName::SyncStep,
                            *step.job_id.as_uuid(),
                            *replacement.id.as_uuid(),
                            Duration::ZERO,
                        )
                        .await?;
                }
            }
            return Ok(TaskOutcome::Done);
        }

        Ok(TaskOutcome::Reschedule {
            delay: self.ctx.config.poll_interval(),
        })
    }

    /// Handler for `sync_job`: roll phase state up, watch the job timeout,
    /// and finalize once the ledger confirms every step task is done.
    pub async fn sync_job(&self, job_id: JobId) -> Result<TaskOutcome> {
        let mut job = self.load_job(job_id).await?;
        if job.status.is_finished() {
            return Ok(TaskOutcome::Done);
        }

        let (plan, buildstep) = self.resolve_for_job(job_id).await?;
        buildstep.update(&self.ctx, &mut job).await?;
        let phases = propagation::recompute_job(&self.ctx, &mut job).await?;

        if self.job_timed_out(&job, &plan) {
            warn!(job = %job_id, "job timed out");
            self.ctx
                .failures
                .record(&FailureReason::for_job(&job, Reason::Timeout))
                .await?;
            self.finish_job(&mut job, Verdict::Failed).await?;
            // Local state is authoritative whether or not the backend
            // acknowledges the cancel.
            if let Err(err) = buildstep.cancel(&self.ctx, &mut job).await {
                warn!(job = %job_id, %err, "backend cancel failed");
            }
            return Ok(TaskOutcome::Done);
        }

        if job.verdict.is_failure() {
            propagation::propagate_failure(&self.ctx, job.build_id, job.verdict).await?;
        }

        let steps_done = self
            .ledger
            .check(TaskName::SyncStep, *job_id.as_uuid())
            .await?
            .is_finished();
        let phases_done = !phases.is_empty() && phases.iter().all(|p| p.status.is_finished());

        if steps_done && phases_done {
            let verdict = job.verdict;
            self.finish_job(&mut job, verdict).await?;
            return Ok(TaskOutcome::Done);
        }

        Ok(TaskOutcome::Reschedule {
            delay: self.ctx.config.poll_interval(),
        })
    }

    /// Handler for `sync_build`: one-shot final aggregation once the last
    /// job finishes.
    pub async fn sync_build(&self, build_id: BuildId) -> Result<TaskOutcome> {
        let mut build = self.load_build(build_id).await?;
        if build.status.is_finished() {
            return Ok(TaskOutcome::Done);
        }

        let jobs = self.ctx.jobs.list_by_build(build_id).await?;
        if propagation::finalize_build(&self.ctx, &mut build, &jobs).await? {
            info!(build = %build_id, verdict = ?build.verdict, "build finished");
            self.ctx
                .signals
                .fire(Signal::BuildFinished {
                    build_id,
                    project_id: build.project_id,
                    verdict: build.verdict,
                })
                .await?;
            return Ok(TaskOutcome::Done);
        }

        Ok(TaskOutcome::Reschedule {
            delay: self.ctx.config.poll_interval(),
        })
    }

    /// Cooperative cancellation walk over the whole build.
    pub async fn cancel_build(&self, build_id: BuildId) -> Result<()> {
        let mut build = self.load_build(build_id).await?;
        if build.status.is_finished() {
            return Ok(());
        }

        for mut job in self.ctx.jobs.list_by_build(build_id).await? {
            if !job.status.is_finished() {
                self.cancel_job_inner(&mut job).await?;
            }
        }

        build.status = Status::Finished;
        build.verdict = Verdict::Aborted;
        build.date_finished = Some(Utc::now());
        self.ctx.builds.update(&build).await?;
        info!(build = %build_id, "cancelled build");
        Ok(())
    }

    pub async fn cancel_job(&self, job_id: JobId) -> Result<()> {
        let mut job = self.load_job(job_id).await?;
        if job.status.is_finished() {
            return Ok(());
        }
        self.cancel_job_inner(&mut job).await
    }

    pub async fn cancel_step(&self, step_id: StepId) -> Result<()> {
        let mut step = self.load_step(step_id).await?;
        if step.status.is_finished() {
            return Ok(());
        }
        let buildstep = self.resolve_for_job(step.job_id).await.ok().map(|(_, b)| b);
        self.cancel_step_inner(buildstep.as_deref(), &mut step).await
    }

    /// Report surface: step progress from the executing agent.
    pub async fn report_step_progress(
        &self,
        step_id: StepId,
        status: Status,
        verdict: Option<Verdict>,
        node_id: Option<NodeId>,
    ) -> Result<()> {
        let mut step = self.load_step(step_id).await?;
        if step.status.is_finished() {
            return Ok(());
        }

        let now = Utc::now();
        step.last_heartbeat = Some(now);
        if node_id.is_some() {
            step.node_id = node_id;
        }
        if status == Status::InProgress && step.date_started.is_none() {
            step.date_started = Some(now);
        }
        if status.is_finished() {
            step.date_finished = Some(now);
        }
        step.status = status;
        if let Some(verdict) = verdict {
            step.verdict = verdict;
        }
        self.ctx.steps.update(&step).await
    }

    /// Report surface: one command's outcome from the executing agent.
    pub async fn report_command_result(
        &self,
        command_id: CommandId,
        status: Status,
        return_code: Option<i32>,
    ) -> Result<()> {
        let mut command = self
            .ctx
            .commands
            .get(command_id)
            .await?
            .ok_or_else(|| Error::CommandNotFound(command_id.to_string()))?;
        let now = Utc::now();
        if command.date_started.is_none() {
            command.date_started = Some(now);
        }
        if status.is_finished() {
            command.date_finished = Some(now);
        }
        command.status = status;
        command.return_code = return_code;
        self.ctx.commands.update(&command).await
    }

    /// Report surface: a collector command produced an expansion manifest.
    pub async fn request_expansion(
        &self,
        step_id: StepId,
        kind: ExpanderKind,
        manifest: &Value,
    ) -> Result<ExpansionOutcome> {
        let step = self.load_step(step_id).await?;
        let (_plan, buildstep) = self.resolve_for_job(step.job_id).await?;
        expansion::expand_step(&self.ctx, buildstep.as_ref(), step_id, kind, manifest).await
    }

    /// Pull one declared artifact through the owning backend.
    pub async fn process_artifact(&self, artifact: &Artifact) -> Result<()> {
        let (_plan, buildstep) = self.resolve_for_job(artifact.job_id).await?;
        buildstep.fetch_artifact(&self.ctx, artifact).await
    }

    /// Abort handler: force-finalize the entity a task drove after an
    /// unrecoverable error or retry exhaustion.
    pub async fn abort(&self, name: TaskName, child_id: Uuid) -> Result<()> {
        match name {
            TaskName::CreateJob | TaskName::SyncJob => {
                let job_id = JobId::from_uuid(child_id);
                if let Some(mut job) = self.ctx.jobs.get(job_id).await?
                    && !job.status.is_finished()
                {
                    warn!(job = %job_id, "aborting job");
                    self.finish_job(&mut job, Verdict::Aborted).await?;
                }
            }
            TaskName::SyncStep | TaskName::ExpandStep => {
                let step_id = StepId::from_uuid(child_id);
                if let Some(mut step) = self.ctx.steps.get(step_id).await?
                    && !step.status.is_finished()
                {
                    warn!(step = %step_id, "aborting step");
                    self.cancel_step_inner(None, &mut step).await?;
                }
            }
            TaskName::SyncBuild => {
                let build_id = BuildId::from_uuid(child_id);
                if let Some(mut build) = self.ctx.builds.get(build_id).await?
                    && !build.status.is_finished()
                {
                    warn!(build = %build_id, "aborting build");
                    build.status = Status::Finished;
                    build.verdict = Verdict::Aborted;
                    build.date_finished = Some(Utc::now());
                    self.ctx.builds.update(&build).await?;
                }
            }
        }
        Ok(())
    }

    // --- internals ---

    async fn load_build(&self, build_id: BuildId) -> Result<Build> {
        self.ctx
            .builds
            .get(build_id)
            .await?
            .ok_or_else(|| Error::BuildNotFound(build_id.to_string()))
    }

    async fn load_job(&self, job_id: JobId) -> Result<Job> {
        self.ctx
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))
    }

    async fn load_step(&self, step_id: StepId) -> Result<JobStep> {
        self.ctx
            .steps
            .get(step_id)
            .await?
            .ok_or_else(|| Error::StepNotFound(step_id.to_string()))
    }

    async fn resolve_for_job(&self, job_id: JobId) -> Result<(JobPlan, Arc<dyn BuildStep>)> {
        let plan = self
            .ctx
            .jobs
            .get_plan(job_id)
            .await?
            .ok_or_else(|| Error::MissingPlan(job_id.to_string()))?;
        let buildstep = resolve_buildstep(&plan.backend)?;
        Ok((plan, buildstep))
    }

    fn timeout_minutes(&self, plan: &JobPlan) -> i64 {
        if plan.timeout_minutes == 0 {
            i64::from(self.ctx.config.default_timeout_minutes)
        } else {
            i64::from(plan.timeout_minutes)
        }
    }

    fn elapsed_minutes(since: DateTime<Utc>) -> i64 {
        (Utc::now() - since).num_minutes()
    }

    fn job_timed_out(&self, job: &Job, plan: &JobPlan) -> bool {
        let base = job.date_started.unwrap_or(job.date_created);
        Self::elapsed_minutes(base) >= self.timeout_minutes(plan)
    }

    async fn check_step_timeout(
        &self,
        step: &mut JobStep,
        job: &Job,
        plan: &JobPlan,
        buildstep: &dyn BuildStep,
    ) -> Result<()> {
        let base = step.date_started.unwrap_or(step.date_created);
        if Self::elapsed_minutes(base) < self.timeout_minutes(plan) {
            return Ok(());
        }

        warn!(step = %step.id, "step timed out");
        self.ctx
            .failures
            .record(&FailureReason::for_step(
                step,
                job.build_id,
                job.project_id,
                Reason::Timeout,
            ))
            .await?;
        step.status = Status::Finished;
        step.verdict = Verdict::Failed;
        step.date_finished = Some(Utc::now());
        self.ctx.steps.update(step).await?;

        // Local state is authoritative; a failed backend cancel is logged
        // and ignored.
        if let Err(err) = buildstep.cancel_step(&self.ctx, step).await {
            warn!(step = %step.id, %err, "backend cancel failed");
        }
        Ok(())
    }

    /// A step may only report passed if its final command actually finished
    /// cleanly. Guards against an agent dying between the last command and
    /// the result report.
    async fn apply_final_command_guard(&self, step: &mut JobStep, job: &Job) -> Result<()> {
        if step.verdict != Verdict::Passed {
            return Ok(());
        }
        let commands = self.ctx.commands.list_by_step(step.id).await?;
        let Some(last) = commands.last() else {
            return Ok(());
        };
        if last.succeeded() {
            return Ok(());
        }

        warn!(step = %step.id, command = %last.id, "final command did not succeed, demoting step");
        if last.command_type.is_collector() {
            self.ctx
                .failures
                .record(&FailureReason::for_step(
                    step,
                    job.build_id,
                    job.project_id,
                    Reason::MissingArtifact,
                ))
                .await?;
        }
        step.verdict = Verdict::Failed;
        self.ctx.steps.update(step).await
    }

    async fn finish_job(&self, job: &mut Job, verdict: Verdict) -> Result<()> {
        job.status = Status::Finished;
        job.verdict = verdict;
        job.date_finished = Some(Utc::now());
        self.ctx.jobs.update(job).await?;

        info!(job = %job.id, ?verdict, "job finished");
        self.ctx
            .signals
            .fire(Signal::JobFinished {
                job_id: job.id,
                build_id: job.build_id,
                verdict,
            })
            .await?;
        self.ledger
            .submit(
                TaskName::SyncBuild,
                *job.project_id.as_uuid(),
                *job.build_id.as_uuid(),
                Duration::ZERO,
            )
            .await
    }

    async fn cancel_job_inner(&self, job: &mut Job) -> Result<()> {
        let buildstep = match self.resolve_for_job(job.id).await {
            Ok((_, buildstep)) => Some(buildstep),
            Err(err) => {
                warn!(job = %job.id, %err, "cancelling job without a backend");
                None
            }
        };

        for mut step in self.ctx.steps.list_by_job(job.id).await? {
            if !step.status.is_finished() {
                self.cancel_step_inner(buildstep.as_deref(), &mut step).await?;
            }
        }

        if let Some(buildstep) = &buildstep
            && let Err(err) = buildstep.cancel(&self.ctx, job).await
        {
            warn!(job = %job.id, %err, "backend cancel failed");
        }

        job.status = Status::Finished;
        job.verdict = Verdict::Aborted;
        job.date_finished = Some(Utc::now());
        self.ctx.jobs.update(job).await?;
        debug!(job = %job.id, "cancelled job");
        Ok(())
    }

    async fn cancel_step_inner(
        &self,
        buildstep: Option<&dyn BuildStep>,
        step: &mut JobStep,
    ) -> Result<()> {
        if let Some(buildstep) = buildstep
            && let Err(err) = buildstep.cancel_step(&self.ctx, step).await
        {
            warn!(step = %step.id, %err, "backend cancel failed");
        }
        step.status = Status::Finished;
        step.verdict = Verdict::Aborted;
        step.date_finished = Some(Utc::now());
        self.ctx.steps.update(step).await
    }
}

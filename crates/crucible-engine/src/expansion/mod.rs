//! Step expansion: turning one step's declared manifest of sub-work into a
//! set of new sibling steps grouped into a new phase.
//!
//! The protocol is monotonic and idempotent under duplicate delivery: a
//! lease lock guards the check-and-set of the step's `expanded` flag, and a
//! step that is already expanded is never expanded again.

pub mod bazel;
pub mod commands;
pub mod test_shards;

pub use bazel::BazelTargetsExpander;
pub use commands::CommandsExpander;
pub use test_shards::TestsExpander;

use crate::buildstep::{create_commands, BuildStep, CommandSpec};
use crate::context::EngineContext;
use crucible_core::build::{FailureReason, JobPhase, JobStep, Reason, StepData};
use crucible_core::events::Signal;
use crucible_core::ports::TestStats;
use crucible_core::state::Verdict;
use crucible_core::task::{Task, TaskName};
use crucible_core::{Error, Result, StepId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error as ThisError;
use tracing::{debug, info, warn};

/// Manifest problems reported by expander validation.
#[derive(Debug, ThisError)]
pub enum ManifestError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("field `{0}` must not be empty")]
    Empty(&'static str),

    #[error("`cmd` must contain the `{0}` token")]
    MissingToken(&'static str),
}

impl From<ManifestError> for Error {
    fn from(err: ManifestError) -> Self {
        Error::InvalidManifest(err.to_string())
    }
}

/// Failure reason recorded when a manifest is rejected.
fn reason_for(err: &ManifestError) -> Reason {
    match err {
        ManifestError::MissingField("tests") | ManifestError::Empty("tests") => {
            Reason::MissingTests
        }
        _ => Reason::MalformedManifest,
    }
}

/// In-memory descriptor of a step to be materialized.
#[derive(Debug, Clone)]
pub struct FutureJobStep {
    pub label: String,
    pub commands: Vec<CommandSpec>,
    pub data: StepData,
}

/// Closed set of expander types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpanderKind {
    Commands,
    Tests,
    BazelTargets,
}

pub fn resolve_expander(kind: ExpanderKind) -> Box<dyn Expander> {
    match kind {
        ExpanderKind::Commands => Box::new(CommandsExpander),
        ExpanderKind::Tests => Box::new(TestsExpander),
        ExpanderKind::BazelTargets => Box::new(BazelTargetsExpander),
    }
}

/// One expansion strategy: validates a manifest and turns it into step
/// descriptors. A zero-item manifest must be rejected here, not by the
/// driver.
pub trait Expander: Send + Sync {
    fn validate(&self, manifest: &Value) -> std::result::Result<(), ManifestError>;

    fn expand(
        &self,
        manifest: &Value,
        parent: &JobStep,
        max_executors: usize,
        stats: &TestStats,
    ) -> Result<Vec<FutureJobStep>>;
}

/// What an expansion attempt did.
#[derive(Debug, Clone)]
pub enum ExpansionOutcome {
    /// New sibling steps were created under a new phase.
    Created(Vec<JobStep>),
    /// The step was already expanded; duplicate delivery, nothing done.
    AlreadyExpanded,
    /// Another worker holds the expansion lease; try again later.
    LockBusy,
    /// The manifest was rejected; the reason was recorded and the step
    /// marked failed.
    Rejected(Reason),
}

/// Run the expansion protocol for one step.
pub async fn expand_step(
    ctx: &EngineContext,
    buildstep: &dyn BuildStep,
    step_id: StepId,
    kind: ExpanderKind,
    manifest: &Value,
) -> Result<ExpansionOutcome> {
    let key = format!("expand:{}", step_id);
    if !ctx.locks.try_acquire(&key, ctx.config.expansion_lock_ttl()).await? {
        debug!(step = %step_id, "expansion lease held elsewhere");
        return Ok(ExpansionOutcome::LockBusy);
    }

    let result = expand_locked(ctx, buildstep, step_id, kind, manifest).await;
    // The lease expires on its own if release fails.
    let _ = ctx.locks.release(&key).await;
    result
}

async fn expand_locked(
    ctx: &EngineContext,
    buildstep: &dyn BuildStep,
    step_id: StepId,
    kind: ExpanderKind,
    manifest: &Value,
) -> Result<ExpansionOutcome> {
    // Re-fetch under the lock: a concurrent completion may have won.
    let mut parent = ctx
        .steps
        .get(step_id)
        .await?
        .ok_or_else(|| Error::StepNotFound(step_id.to_string()))?;
    if parent.data.expanded() {
        debug!(step = %step_id, "step already expanded");
        return Ok(ExpansionOutcome::AlreadyExpanded);
    }

    let job = ctx
        .jobs
        .get(parent.job_id)
        .await?
        .ok_or_else(|| Error::JobNotFound(parent.job_id.to_string()))?;

    let expander = resolve_expander(kind);
    if let Err(err) = expander.validate(manifest) {
        let reason = reason_for(&err);
        warn!(step = %step_id, %err, "expansion manifest rejected");
        ctx.failures
            .record(&FailureReason::for_step(
                &parent,
                job.build_id,
                job.project_id,
                reason,
            ))
            .await?;
        parent.verdict = Verdict::Failed;
        ctx.steps.update(&parent).await?;
        return Ok(ExpansionOutcome::Rejected(reason));
    }

    // Explicit phase name, else one generated from the current phase count.
    // Concurrent expansions can compute the same count; create_or_get makes
    // the collision converge on one phase.
    let phase_label = match manifest.get("phase").and_then(Value::as_str) {
        Some(label) => label.to_string(),
        None => {
            let count = ctx.phases.count_by_job(parent.job_id).await?;
            format!("Phase #{}", count)
        }
    };
    let phase = ctx
        .phases
        .create_or_get(&JobPhase::new(parent.job_id, phase_label))
        .await?;
    buildstep.validate_phase(&phase)?;

    let stats = ctx.test_stats.durations(job.project_id).await?;
    let max_executors = parent.data.max_executors() as usize;
    let futures = expander.expand(manifest, &parent, max_executors, &stats)?;

    let (setup, teardown) = buildstep.ancillary_commands();
    let mut created = Vec::with_capacity(futures.len());
    for future in futures {
        let step = materialize_step(ctx, &phase, &parent, future, &setup, &teardown).await?;
        created.push(step);
    }

    parent.data.mark_expanded();
    ctx.steps.update(&parent).await?;

    info!(
        step = %step_id,
        phase = %phase.label,
        steps = created.len(),
        "expanded step"
    );
    ctx.signals
        .fire(Signal::StepExpanded {
            step_id: parent.id,
            job_id: parent.job_id,
            phase_id: phase.id,
            step_count: created.len(),
        })
        .await?;

    // Each new step syncs as a child of the originating job so the job's
    // completion gate sees it.
    for step in &created {
        let task = Task::new(
            TaskName::SyncStep,
            *parent.job_id.as_uuid(),
            *step.id.as_uuid(),
        );
        ctx.tasks.submit(&task).await?;
        ctx.queue
            .enqueue(
                TaskName::SyncStep,
                *parent.job_id.as_uuid(),
                *step.id.as_uuid(),
                Duration::ZERO,
            )
            .await?;
    }

    Ok(ExpansionOutcome::Created(created))
}

async fn materialize_step(
    ctx: &EngineContext,
    phase: &JobPhase,
    parent: &JobStep,
    future: FutureJobStep,
    setup: &[CommandSpec],
    teardown: &[CommandSpec],
) -> Result<JobStep> {
    let mut step = JobStep::new(phase.id, parent.job_id, future.label);
    step.cluster = parent.cluster.clone();

    let mut data = parent.data.inherit_for_child();
    data.merge(&future.data);
    data.mark_generated();
    step.data = data;
    ctx.steps.create(&step).await?;

    let mut specs: Vec<CommandSpec> = setup.to_vec();
    specs.extend(future.commands);
    specs.extend(teardown.iter().cloned());
    create_commands(ctx, &step, &specs).await?;

    Ok(step)
}

//! Result propagation: step → phase → job → build.
//!
//! Aggregation never needs to know why a child failed, only that it did;
//! failure detail lives in the recorded failure reasons.

use crate::context::EngineContext;
use crucible_core::build::{Build, Job, JobPhase};
use crucible_core::state::{aggregate_status, aggregate_verdict, Status, Verdict};
use crucible_core::{BuildId, Result};
use tracing::debug;

/// Recompute a phase from the live (replacement-tip) steps beneath it.
pub async fn recompute_phase(ctx: &EngineContext, phase: &mut JobPhase) -> Result<()> {
    let steps = ctx.steps.current_by_phase(phase.id).await?;
    phase.verdict = aggregate_verdict(steps.iter().map(|s| s.verdict));
    phase.status = aggregate_status(steps.iter().map(|s| s.status));
    phase.date_started = steps.iter().filter_map(|s| s.date_started).min();
    phase.date_finished = if phase.status.is_finished() {
        steps.iter().filter_map(|s| s.date_finished).max()
    } else {
        None
    };
    ctx.phases.update(phase).await
}

/// Recompute a job's phases and roll their state up into the job. Returns
/// the recomputed phases.
///
/// Finishing the job itself is gated on the task ledger, so only
/// non-terminal statuses propagate here.
pub async fn recompute_job(ctx: &EngineContext, job: &mut Job) -> Result<Vec<JobPhase>> {
    let mut phases = ctx.phases.list_by_job(job.id).await?;
    for phase in &mut phases {
        recompute_phase(ctx, phase).await?;
    }

    job.verdict = aggregate_verdict(phases.iter().map(|p| p.verdict));
    let status = aggregate_status(phases.iter().map(|p| p.status));
    if !status.is_finished() && status != Status::Unknown {
        job.status = status;
    }
    if job.date_started.is_none() {
        job.date_started = phases.iter().filter_map(|p| p.date_started).min();
    }
    ctx.jobs.update(job).await?;
    Ok(phases)
}

/// Eagerly surface a failed job on its build while siblings still run.
/// Touches the verdict only; the build's status is owned by finalization.
pub async fn propagate_failure(
    ctx: &EngineContext,
    build_id: BuildId,
    verdict: Verdict,
) -> Result<()> {
    if let Some(mut build) = ctx.builds.get(build_id).await?
        && !build.status.is_finished()
        && !build.verdict.is_failure()
    {
        debug!(build = %build.id, ?verdict, "eagerly propagating failure");
        build.verdict = verdict;
        ctx.builds.update(&build).await?;
    }
    Ok(())
}

/// One-shot final aggregation once every job has finished. Returns true
/// when the build was finalized by this call.
///
/// A finished build is never reopened.
pub async fn finalize_build(ctx: &EngineContext, build: &mut Build, jobs: &[Job]) -> Result<bool> {
    if build.status.is_finished() {
        return Ok(false);
    }
    if jobs.is_empty() || jobs.iter().any(|j| !j.status.is_finished()) {
        return Ok(false);
    }

    build.verdict = aggregate_verdict(jobs.iter().map(|j| j.verdict));
    build.status = Status::Finished;
    build.date_started = jobs.iter().filter_map(|j| j.date_started).min();
    build.date_finished = jobs.iter().filter_map(|j| j.date_finished).max();
    build.duration_ms = Some(jobs.iter().filter_map(|j| j.duration_ms()).sum());
    ctx.builds.update(build).await?;
    Ok(true)
}

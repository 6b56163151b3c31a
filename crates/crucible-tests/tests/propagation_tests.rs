//! Result propagation tests: step → phase → job → build aggregation, eager
//! failure surfacing, and the end-to-end happy path.

use chrono::{Duration as ChronoDuration, Utc};
use crucible_core::build::{Build, FailureReason, Job, JobPhase, JobStep, Reason};
use crucible_core::events::Signal;
use crucible_core::state::{Cause, Status, Verdict};
use crucible_engine::{propagation, BuildRequest, JobScheduler, PlanRequest, TaskRunner};
use crucible_tests::fixtures;
use crucible_tests::harness::TestHarness;
use crucible_core::ProjectId;
use std::sync::Arc;

fn finished_step(phase: &JobPhase, verdict: Verdict) -> JobStep {
    let mut step = JobStep::new(phase.id, phase.job_id, "step");
    step.status = Status::Finished;
    step.verdict = verdict;
    step.date_started = Some(Utc::now() - ChronoDuration::minutes(5));
    step.date_finished = Some(Utc::now());
    step
}

#[tokio::test]
async fn test_phase_takes_the_worst_step_verdict() {
    let harness = TestHarness::new();
    let fixture = fixtures::job_with_plan(&harness, fixtures::default_backend()).await;

    let mut phase = harness
        .ctx
        .phases
        .create_or_get(&JobPhase::new(fixture.job.id, "Test"))
        .await
        .unwrap();
    for verdict in [Verdict::Passed, Verdict::Failed, Verdict::Passed] {
        harness
            .ctx
            .steps
            .create(&finished_step(&phase, verdict))
            .await
            .unwrap();
    }

    propagation::recompute_phase(&harness.ctx, &mut phase).await.unwrap();
    assert_eq!(phase.verdict, Verdict::Failed);
    assert_eq!(phase.status, Status::Finished);
    assert!(phase.date_finished.is_some());
}

#[tokio::test]
async fn test_replaced_steps_are_excluded_from_aggregation() {
    let harness = TestHarness::new();
    let fixture = fixtures::job_with_plan(&harness, fixtures::default_backend()).await;

    let mut phase = harness
        .ctx
        .phases
        .create_or_get(&JobPhase::new(fixture.job.id, "Test"))
        .await
        .unwrap();

    let mut replaced = finished_step(&phase, Verdict::InfraFailed);
    let tip = finished_step(&phase, Verdict::Passed);
    replaced.replacement_id = Some(tip.id);
    harness.ctx.steps.create(&replaced).await.unwrap();
    harness.ctx.steps.create(&tip).await.unwrap();

    propagation::recompute_phase(&harness.ctx, &mut phase).await.unwrap();
    assert_eq!(phase.verdict, Verdict::Passed);
}

#[tokio::test]
async fn test_in_progress_step_holds_the_phase_open() {
    let harness = TestHarness::new();
    let fixture = fixtures::job_with_plan(&harness, fixtures::default_backend()).await;

    let mut phase = harness
        .ctx
        .phases
        .create_or_get(&JobPhase::new(fixture.job.id, "Test"))
        .await
        .unwrap();
    harness
        .ctx
        .steps
        .create(&finished_step(&phase, Verdict::Passed))
        .await
        .unwrap();
    let mut running = JobStep::new(phase.id, phase.job_id, "running");
    running.status = Status::InProgress;
    harness.ctx.steps.create(&running).await.unwrap();

    propagation::recompute_phase(&harness.ctx, &mut phase).await.unwrap();
    assert_eq!(phase.status, Status::InProgress);
    assert!(phase.date_finished.is_none());
}

#[tokio::test]
async fn test_failed_job_is_eagerly_surfaced_on_the_build() {
    let harness = TestHarness::new();
    let fixture = fixtures::job_with_plan(&harness, fixtures::default_backend()).await;
    let scheduler = JobScheduler::new(harness.ctx.clone());
    scheduler.start_job(fixture.job.id).await.unwrap();

    // A second job keeps the build from finalizing.
    let other = Job::new(fixture.build.id, fixture.job.project_id, "windows");
    harness.ctx.jobs.create(&other).await.unwrap();

    let step = harness.ctx.steps.list_by_job(fixture.job.id).await.unwrap()[0].clone();
    scheduler
        .report_step_progress(step.id, Status::Finished, Some(Verdict::Failed), None)
        .await
        .unwrap();
    scheduler.sync_step(step.id).await.unwrap();
    scheduler.sync_job(fixture.job.id).await.unwrap();

    let build = harness.ctx.builds.get(fixture.build.id).await.unwrap().unwrap();
    assert_eq!(build.verdict, Verdict::Failed);
    // Verdict only: the build is still open while the other job runs.
    assert_ne!(build.status, Status::Finished);
}

#[tokio::test]
async fn test_build_finalization_is_one_shot_and_monotonic() {
    let harness = TestHarness::new();
    let project_id = ProjectId::new();
    let mut build = Build::new(project_id, 1, Cause::Push);
    harness.ctx.builds.create(&build).await.unwrap();

    let now = Utc::now();
    let mut job_a = Job::new(build.id, project_id, "a");
    job_a.status = Status::Finished;
    job_a.verdict = Verdict::Passed;
    job_a.date_started = Some(now - ChronoDuration::minutes(30));
    job_a.date_finished = Some(now - ChronoDuration::minutes(20));
    let mut job_b = Job::new(build.id, project_id, "b");
    job_b.status = Status::Finished;
    job_b.verdict = Verdict::Failed;
    job_b.date_started = Some(now - ChronoDuration::minutes(25));
    job_b.date_finished = Some(now - ChronoDuration::minutes(5));
    harness.ctx.jobs.create(&job_a).await.unwrap();
    harness.ctx.jobs.create(&job_b).await.unwrap();

    let jobs = vec![job_a.clone(), job_b.clone()];
    let finalized = propagation::finalize_build(&harness.ctx, &mut build, &jobs)
        .await
        .unwrap();
    assert!(finalized);
    assert_eq!(build.status, Status::Finished);
    assert_eq!(build.verdict, Verdict::Failed);
    assert_eq!(build.date_started, job_a.date_started);
    assert_eq!(build.date_finished, job_b.date_finished);
    // Duration is the sum of job durations, not wall-clock span.
    assert_eq!(
        build.duration_ms,
        Some(job_a.duration_ms().unwrap() + job_b.duration_ms().unwrap())
    );

    // Already finished: never reopened, never recomputed.
    let again = propagation::finalize_build(&harness.ctx, &mut build, &jobs)
        .await
        .unwrap();
    assert!(!again);

    propagation::propagate_failure(&harness.ctx, build.id, Verdict::Aborted)
        .await
        .unwrap();
    let stored = harness.ctx.builds.get(build.id).await.unwrap().unwrap();
    assert_eq!(stored.verdict, Verdict::Failed);
}

#[tokio::test]
async fn test_build_with_unfinished_job_does_not_finalize() {
    let harness = TestHarness::new();
    let project_id = ProjectId::new();
    let mut build = Build::new(project_id, 1, Cause::Push);
    harness.ctx.builds.create(&build).await.unwrap();

    let mut done = Job::new(build.id, project_id, "done");
    done.status = Status::Finished;
    done.verdict = Verdict::Passed;
    let running = Job::new(build.id, project_id, "running");
    harness.ctx.jobs.create(&done).await.unwrap();
    harness.ctx.jobs.create(&running).await.unwrap();

    let finalized =
        propagation::finalize_build(&harness.ctx, &mut build, &[done, running])
            .await
            .unwrap();
    assert!(!finalized);
    assert_ne!(build.status, Status::Finished);
}

#[tokio::test]
async fn test_end_to_end_dummy_build_passes() {
    let harness = TestHarness::new();
    let scheduler = Arc::new(JobScheduler::new(harness.ctx.clone()));
    let runner = TaskRunner::new(scheduler.clone());

    let build = scheduler
        .create_build(BuildRequest {
            project_id: ProjectId::new(),
            cause: Cause::Push,
            label: Some("deadbeef".to_string()),
            target: None,
            message: Some("fix the flux capacitor".to_string()),
            plans: vec![
                PlanRequest {
                    label: "linux".to_string(),
                    backend: fixtures::dummy_backend(),
                    timeout_minutes: None,
                },
                PlanRequest {
                    label: "macos".to_string(),
                    backend: fixtures::dummy_backend(),
                    timeout_minutes: None,
                },
            ],
        })
        .await
        .unwrap();

    harness.run_until_idle(&runner, 50).await;

    let build = harness.ctx.builds.get(build.id).await.unwrap().unwrap();
    assert_eq!(build.status, Status::Finished);
    assert_eq!(build.verdict, Verdict::Passed);
    assert!(build.duration_ms.is_some());

    let jobs = harness.ctx.jobs.list_by_build(build.id).await.unwrap();
    assert_eq!(jobs.len(), 2);
    for job in &jobs {
        assert_eq!(job.status, Status::Finished);
        assert_eq!(job.verdict, Verdict::Passed);
    }

    let signals = harness.signals.fired();
    let job_finishes = signals
        .iter()
        .filter(|s| matches!(s, Signal::JobFinished { .. }))
        .count();
    assert_eq!(job_finishes, 2);
    assert!(signals
        .iter()
        .any(|s| matches!(s, Signal::BuildFinished { verdict: Verdict::Passed, .. })));
}

#[tokio::test]
async fn test_failed_build_surfaces_its_reasons() {
    let harness = TestHarness::new();
    let fixture = fixtures::job_with_plan(&harness, fixtures::default_backend()).await;
    let scheduler = JobScheduler::new(harness.ctx.clone());
    scheduler.start_job(fixture.job.id).await.unwrap();

    let step = harness.ctx.steps.list_by_job(fixture.job.id).await.unwrap()[0].clone();
    harness
        .ctx
        .failures
        .record(&FailureReason::for_step(
            &step,
            fixture.build.id,
            fixture.job.project_id,
            Reason::Timeout,
        ))
        .await
        .unwrap();
    harness
        .ctx
        .failures
        .record(&FailureReason::for_job(&fixture.job, Reason::InfraFailure))
        .await
        .unwrap();

    // One query answers "what went wrong" without walking the steps.
    let reasons = harness
        .ctx
        .failures
        .list_by_build(fixture.build.id)
        .await
        .unwrap();
    assert_eq!(reasons.len(), 2);
    for reason in &reasons {
        assert!(!reason.reason.label().is_empty());
    }
}

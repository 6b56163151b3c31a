//! Scheduler state-machine integration tests: timeouts, replacement chains,
//! the final-command guard, and abort paths.

use chrono::{Duration as ChronoDuration, Utc};
use crucible_core::build::{BackendKind, BackendSpec, Reason};
use crucible_core::state::{Status, Verdict};
use crucible_core::task::{TaskName, TaskOutcome};
use crucible_engine::{JobScheduler, TaskRunner};
use crucible_tests::fixtures;
use crucible_tests::harness::TestHarness;
use serde_json::json;
use std::sync::Arc;

fn collector_backend() -> BackendSpec {
    BackendSpec {
        kind: BackendKind::Default,
        options: json!({
            "commands": [{"script": "collect tests", "command_type": "collector"}],
        }),
    }
}

#[tokio::test]
async fn test_unsupported_backend_finalizes_job_as_aborted() {
    let harness = TestHarness::new();
    let scheduler = Arc::new(JobScheduler::new(harness.ctx.clone()));
    let runner = TaskRunner::new(scheduler.clone());

    let build = scheduler
        .create_build(crucible_engine::BuildRequest {
            project_id: crucible_core::ProjectId::new(),
            cause: crucible_core::state::Cause::Manual,
            label: None,
            target: None,
            message: None,
            plans: vec![crucible_engine::PlanRequest {
                label: "koality".to_string(),
                backend: BackendSpec {
                    kind: BackendKind::Koality,
                    options: json!({}),
                },
                timeout_minutes: None,
            }],
        })
        .await
        .unwrap();

    harness.run_until_idle(&runner, 20).await;

    let jobs = harness.ctx.jobs.list_by_build(build.id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, Status::Finished);
    assert_eq!(jobs[0].verdict, Verdict::Aborted);

    // The build finalizes once its only job is finished.
    let build = harness.ctx.builds.get(build.id).await.unwrap().unwrap();
    assert_eq!(build.status, Status::Finished);
    assert_eq!(build.verdict, Verdict::Aborted);
}

#[tokio::test]
async fn test_step_timeout_forces_failure_with_reason() {
    let harness = TestHarness::new();
    let fixture = fixtures::job_with_plan(&harness, fixtures::default_backend()).await;
    let scheduler = JobScheduler::new(harness.ctx.clone());
    scheduler.start_job(fixture.job.id).await.unwrap();

    let mut step = harness.ctx.steps.list_by_job(fixture.job.id).await.unwrap()[0].clone();
    step.status = Status::InProgress;
    step.date_started = Some(Utc::now() - ChronoDuration::hours(3));
    harness.ctx.steps.update(&step).await.unwrap();

    let outcome = scheduler.sync_step(step.id).await.unwrap();
    assert_eq!(outcome, TaskOutcome::Done);

    let step = harness.ctx.steps.get(step.id).await.unwrap().unwrap();
    assert_eq!(step.status, Status::Finished);
    assert_eq!(step.verdict, Verdict::Failed);

    let reasons = harness.ctx.failures.list_by_step(step.id).await.unwrap();
    assert_eq!(reasons.len(), 1);
    assert_eq!(reasons[0].reason, Reason::Timeout);
}

#[tokio::test]
async fn test_unstarted_step_times_out_from_creation_time() {
    let harness = TestHarness::new();
    let fixture = fixtures::job_with_plan(&harness, fixtures::default_backend()).await;
    let scheduler = JobScheduler::new(harness.ctx.clone());
    scheduler.start_job(fixture.job.id).await.unwrap();

    let mut step = harness.ctx.steps.list_by_job(fixture.job.id).await.unwrap()[0].clone();
    step.date_created = Utc::now() - ChronoDuration::hours(2);
    harness.ctx.steps.update(&step).await.unwrap();

    scheduler.sync_step(step.id).await.unwrap();
    let step = harness.ctx.steps.get(step.id).await.unwrap().unwrap();
    assert_eq!(step.verdict, Verdict::Failed);
}

#[tokio::test]
async fn test_unfinished_step_reschedules() {
    let harness = TestHarness::new();
    let fixture = fixtures::job_with_plan(&harness, fixtures::default_backend()).await;
    let scheduler = JobScheduler::new(harness.ctx.clone());
    scheduler.start_job(fixture.job.id).await.unwrap();

    let step = harness.ctx.steps.list_by_job(fixture.job.id).await.unwrap()[0].clone();
    let outcome = scheduler.sync_step(step.id).await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Reschedule { .. }));
}

#[tokio::test]
async fn test_replacement_chain_up_to_the_cap() {
    let harness = TestHarness::new();
    let fixture = fixtures::job_with_plan(&harness, fixtures::default_backend()).await;
    let scheduler = JobScheduler::new(harness.ctx.clone());
    scheduler.start_job(fixture.job.id).await.unwrap();

    let original = harness.ctx.steps.list_by_job(fixture.job.id).await.unwrap()[0].clone();
    let phase_id = original.phase_id;

    // First infra failure: replaced.
    scheduler
        .report_step_progress(original.id, Status::Finished, Some(Verdict::InfraFailed), None)
        .await
        .unwrap();
    scheduler.sync_step(original.id).await.unwrap();

    let original = harness.ctx.steps.get(original.id).await.unwrap().unwrap();
    let first_replacement_id = original.replacement_id.expect("original should be replaced");
    let first_replacement = harness
        .ctx
        .steps
        .get(first_replacement_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first_replacement.status, Status::PendingAllocation);
    assert_eq!(first_replacement.data.replacement_count(), 1);
    assert_eq!(first_replacement.label, original.label);

    // Second infra failure: replaced again.
    scheduler
        .report_step_progress(
            first_replacement.id,
            Status::Finished,
            Some(Verdict::InfraFailed),
            None,
        )
        .await
        .unwrap();
    scheduler.sync_step(first_replacement.id).await.unwrap();
    let first_replacement = harness
        .ctx
        .steps
        .get(first_replacement.id)
        .await
        .unwrap()
        .unwrap();
    let second_replacement_id = first_replacement.replacement_id.unwrap();

    // Third infra failure: the cap (2) is reached, the failure stands.
    scheduler
        .report_step_progress(
            second_replacement_id,
            Status::Finished,
            Some(Verdict::InfraFailed),
            None,
        )
        .await
        .unwrap();
    scheduler.sync_step(second_replacement_id).await.unwrap();
    let second_replacement = harness
        .ctx
        .steps
        .get(second_replacement_id)
        .await
        .unwrap()
        .unwrap();
    assert!(second_replacement.replacement_id.is_none());
    assert_eq!(second_replacement.verdict, Verdict::InfraFailed);

    // Exactly one live tip; every link of the chain is still queryable.
    let current = harness.ctx.steps.current_by_phase(phase_id).await.unwrap();
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].id, second_replacement_id);
    let all = harness.ctx.steps.list_by_phase(phase_id).await.unwrap();
    assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn test_replacement_copies_generated_step_commands() {
    let harness = TestHarness::new();
    let fixture = fixtures::job_with_plan(&harness, fixtures::wrapped_backend()).await;
    let scheduler = JobScheduler::new(harness.ctx.clone());
    scheduler.start_job(fixture.job.id).await.unwrap();

    let mut parent = harness.ctx.steps.list_by_job(fixture.job.id).await.unwrap()[0].clone();
    parent.data.set_max_executors(1);
    harness.ctx.steps.update(&parent).await.unwrap();

    let manifest = json!({"cmd": "pytest {test_names}", "tests": ["a", "b"]});
    scheduler
        .request_expansion(parent.id, crucible_engine::expansion::ExpanderKind::Tests, &manifest)
        .await
        .unwrap();

    let generated = harness
        .store
        .all_steps()
        .into_iter()
        .find(|s| s.data.generated())
        .unwrap();
    let original_commands = harness.ctx.commands.list_by_step(generated.id).await.unwrap();

    scheduler
        .report_step_progress(generated.id, Status::Finished, Some(Verdict::InfraFailed), None)
        .await
        .unwrap();
    scheduler.sync_step(generated.id).await.unwrap();

    let generated = harness.ctx.steps.get(generated.id).await.unwrap().unwrap();
    let replacement = harness
        .ctx
        .steps
        .get(generated.replacement_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert!(replacement.data.generated());

    // Commands carried over as-is, not re-wrapped with another setup pass.
    let replacement_commands = harness
        .ctx
        .commands
        .list_by_step(replacement.id)
        .await
        .unwrap();
    assert_eq!(replacement_commands.len(), original_commands.len());
    let scripts: Vec<&str> = replacement_commands.iter().map(|c| c.script.as_str()).collect();
    let original_scripts: Vec<&str> = original_commands.iter().map(|c| c.script.as_str()).collect();
    assert_eq!(scripts, original_scripts);
}

#[tokio::test]
async fn test_final_command_guard_demotes_premature_pass() {
    let harness = TestHarness::new();
    let fixture = fixtures::job_with_plan(&harness, collector_backend()).await;
    let scheduler = JobScheduler::new(harness.ctx.clone());
    scheduler.start_job(fixture.job.id).await.unwrap();

    let step = harness.ctx.steps.list_by_job(fixture.job.id).await.unwrap()[0].clone();

    // The step claims a pass but its collector command never finished.
    scheduler
        .report_step_progress(step.id, Status::Finished, Some(Verdict::Passed), None)
        .await
        .unwrap();
    scheduler.sync_step(step.id).await.unwrap();

    let step = harness.ctx.steps.get(step.id).await.unwrap().unwrap();
    assert_eq!(step.verdict, Verdict::Failed);
    let reasons = harness.ctx.failures.list_by_step(step.id).await.unwrap();
    assert_eq!(reasons[0].reason, Reason::MissingArtifact);
}

#[tokio::test]
async fn test_final_command_guard_accepts_clean_pass() {
    let harness = TestHarness::new();
    let fixture = fixtures::job_with_plan(&harness, fixtures::default_backend()).await;
    let scheduler = JobScheduler::new(harness.ctx.clone());
    scheduler.start_job(fixture.job.id).await.unwrap();

    let step = harness.ctx.steps.list_by_job(fixture.job.id).await.unwrap()[0].clone();
    for command in harness.ctx.commands.list_by_step(step.id).await.unwrap() {
        scheduler
            .report_command_result(command.id, Status::Finished, Some(0))
            .await
            .unwrap();
    }
    scheduler
        .report_step_progress(step.id, Status::Finished, Some(Verdict::Passed), None)
        .await
        .unwrap();
    scheduler.sync_step(step.id).await.unwrap();

    let step = harness.ctx.steps.get(step.id).await.unwrap().unwrap();
    assert_eq!(step.verdict, Verdict::Passed);
}

#[tokio::test]
async fn test_lost_heartbeat_is_an_infra_failure_and_replaced() {
    let harness = TestHarness::new();
    let fixture = fixtures::job_with_plan(&harness, fixtures::default_backend()).await;
    let scheduler = JobScheduler::new(harness.ctx.clone());
    scheduler.start_job(fixture.job.id).await.unwrap();

    let mut step = harness.ctx.steps.list_by_job(fixture.job.id).await.unwrap()[0].clone();
    step.status = Status::InProgress;
    step.date_started = Some(Utc::now() - ChronoDuration::minutes(20));
    step.last_heartbeat = Some(Utc::now() - ChronoDuration::minutes(10));
    harness.ctx.steps.update(&step).await.unwrap();

    scheduler.sync_step(step.id).await.unwrap();

    let step = harness.ctx.steps.get(step.id).await.unwrap().unwrap();
    assert_eq!(step.verdict, Verdict::InfraFailed);
    assert!(step.replacement_id.is_some());
}

#[tokio::test]
async fn test_cancel_build_walks_jobs_and_steps() {
    let harness = TestHarness::new();
    let fixture = fixtures::job_with_plan(&harness, fixtures::default_backend()).await;
    let scheduler = JobScheduler::new(harness.ctx.clone());
    scheduler.start_job(fixture.job.id).await.unwrap();

    scheduler.cancel_build(fixture.build.id).await.unwrap();

    let build = harness.ctx.builds.get(fixture.build.id).await.unwrap().unwrap();
    assert_eq!(build.status, Status::Finished);
    assert_eq!(build.verdict, Verdict::Aborted);

    let job = harness.ctx.jobs.get(fixture.job.id).await.unwrap().unwrap();
    assert_eq!(job.status, Status::Finished);
    assert_eq!(job.verdict, Verdict::Aborted);

    for step in harness.ctx.steps.list_by_job(fixture.job.id).await.unwrap() {
        assert_eq!(step.status, Status::Finished);
        assert_eq!(step.verdict, Verdict::Aborted);
    }
}

#[tokio::test]
async fn test_duplicate_task_delivery_is_a_no_op() {
    let harness = TestHarness::new();
    let scheduler = Arc::new(JobScheduler::new(harness.ctx.clone()));
    let runner = TaskRunner::new(scheduler.clone());

    let build = scheduler
        .create_build(crucible_engine::BuildRequest {
            project_id: crucible_core::ProjectId::new(),
            cause: crucible_core::state::Cause::Manual,
            label: None,
            target: None,
            message: None,
            plans: vec![crucible_engine::PlanRequest {
                label: "linux".to_string(),
                backend: fixtures::default_backend(),
                timeout_minutes: None,
            }],
        })
        .await
        .unwrap();

    let create_job = harness
        .queue
        .drain()
        .into_iter()
        .find(|q| q.name == TaskName::CreateJob)
        .unwrap();

    runner
        .process(create_job.name, create_job.parent_id, create_job.child_id)
        .await
        .unwrap();
    let steps_after_first = harness.store.all_steps().len();

    // Redelivery of the same finished task changes nothing.
    runner
        .process(create_job.name, create_job.parent_id, create_job.child_id)
        .await
        .unwrap();
    assert_eq!(harness.store.all_steps().len(), steps_after_first);

    let jobs = harness.ctx.jobs.list_by_build(build.id).await.unwrap();
    assert_eq!(jobs[0].status, Status::InProgress);
}

#[tokio::test]
async fn test_ledger_submit_is_idempotent() {
    let harness = TestHarness::new();
    let scheduler = JobScheduler::new(harness.ctx.clone());
    let parent = uuid::Uuid::now_v7();
    let child = uuid::Uuid::now_v7();

    scheduler
        .ledger()
        .submit(TaskName::SyncStep, parent, child, std::time::Duration::ZERO)
        .await
        .unwrap();
    scheduler
        .ledger()
        .submit(TaskName::SyncStep, parent, child, std::time::Duration::ZERO)
        .await
        .unwrap();

    let rows: Vec<_> = harness
        .store
        .all_tasks()
        .into_iter()
        .filter(|t| t.parent_id == parent)
        .collect();
    assert_eq!(rows.len(), 1);
    // The transport still sees both enqueues; dedup happens at processing.
    assert_eq!(harness.queue.len(), 2);
}

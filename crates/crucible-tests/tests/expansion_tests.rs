//! Expansion protocol integration tests.

use crucible_core::build::Reason;
use crucible_core::state::{Status, Verdict};
use crucible_core::task::TaskName;
use crucible_engine::expansion::{ExpanderKind, ExpansionOutcome};
use crucible_engine::JobScheduler;
use crucible_tests::fixtures::{self, JobFixture};
use crucible_tests::harness::TestHarness;
use serde_json::json;
use std::collections::HashSet;

/// Start a job and return its initial step with `max_executors` applied.
async fn started_step(
    harness: &TestHarness,
    scheduler: &JobScheduler,
    fixture: &JobFixture,
    max_executors: u64,
) -> crucible_core::build::JobStep {
    scheduler.start_job(fixture.job.id).await.unwrap();
    let steps = harness.ctx.steps.list_by_job(fixture.job.id).await.unwrap();
    let mut step = steps.into_iter().next().unwrap();
    step.data.set_max_executors(max_executors);
    harness.ctx.steps.update(&step).await.unwrap();
    // Isolate expansion effects from the start_job scheduling noise.
    harness.queue.drain();
    step
}

#[tokio::test]
async fn test_tests_expansion_shards_by_historical_duration() {
    let harness = TestHarness::with_stats(fixtures::stats(&[("a", 50), ("b", 30), ("c", 10)], 30));
    let fixture = fixtures::job_with_plan(&harness, fixtures::wrapped_backend()).await;
    let scheduler = JobScheduler::new(harness.ctx.clone());
    let parent = started_step(&harness, &scheduler, &fixture, 2).await;

    let manifest = json!({"cmd": "pytest {test_names}", "tests": ["a", "b", "c"]});
    let outcome = scheduler
        .request_expansion(parent.id, ExpanderKind::Tests, &manifest)
        .await
        .unwrap();

    let children = match outcome {
        ExpansionOutcome::Created(children) => children,
        other => panic!("expected Created, got {:?}", other),
    };
    assert_eq!(children.len(), 2);

    // Every test assigned exactly once.
    let mut assigned: Vec<String> = children.iter().flat_map(|c| c.data.tests()).collect();
    assigned.sort();
    assert_eq!(assigned, vec!["a", "b", "c"]);
    let unique: HashSet<&String> = assigned.iter().collect();
    assert_eq!(unique.len(), 3);

    // Greedy LPT: the heavy test rides alone.
    let mut weights: Vec<u64> = children.iter().filter_map(|c| c.data.weight()).collect();
    weights.sort_unstable();
    assert_eq!(weights, vec![42, 51]);

    // One new phase beyond the initial one.
    let phases = harness.ctx.phases.list_by_job(fixture.job.id).await.unwrap();
    assert_eq!(phases.len(), 2);
    assert_eq!(phases[1].label, "Phase #1");

    for child in &children {
        assert_eq!(child.status, Status::PendingAllocation);
        assert!(child.data.generated());
        assert_eq!(child.data.shard_count(), Some(2));
    }

    // Setup and teardown wrap the generated command.
    let commands = harness.ctx.commands.list_by_step(children[0].id).await.unwrap();
    assert_eq!(commands.len(), 3);
    assert_eq!(commands[0].script, "git checkout");
    assert!(commands[1].script.starts_with("pytest "));
    assert_eq!(commands[2].script, "rm -rf workspace");

    // Each child syncs as a child task of the originating job.
    let queued = harness.queue.drain();
    let sync_steps: Vec<_> = queued
        .iter()
        .filter(|q| q.name == TaskName::SyncStep)
        .collect();
    assert_eq!(sync_steps.len(), 2);
    for entry in sync_steps {
        assert_eq!(entry.parent_id, *fixture.job.id.as_uuid());
    }
}

#[tokio::test]
async fn test_expansion_is_idempotent_under_duplicate_delivery() {
    let harness = TestHarness::new();
    let fixture = fixtures::job_with_plan(&harness, fixtures::wrapped_backend()).await;
    let scheduler = JobScheduler::new(harness.ctx.clone());
    let parent = started_step(&harness, &scheduler, &fixture, 2).await;

    let manifest = json!({"cmd": "pytest {test_names}", "tests": ["a", "b"]});
    let first = scheduler
        .request_expansion(parent.id, ExpanderKind::Tests, &manifest)
        .await
        .unwrap();
    assert!(matches!(first, ExpansionOutcome::Created(_)));
    let steps_after_first = harness.store.all_steps().len();

    let second = scheduler
        .request_expansion(parent.id, ExpanderKind::Tests, &manifest)
        .await
        .unwrap();
    assert!(matches!(second, ExpansionOutcome::AlreadyExpanded));
    assert_eq!(harness.store.all_steps().len(), steps_after_first);
}

#[tokio::test]
async fn test_expansion_aborts_while_lease_is_held() {
    let harness = TestHarness::new();
    let fixture = fixtures::job_with_plan(&harness, fixtures::wrapped_backend()).await;
    let scheduler = JobScheduler::new(harness.ctx.clone());
    let parent = started_step(&harness, &scheduler, &fixture, 2).await;

    harness.locks.force_hold(&format!("expand:{}", parent.id));

    let manifest = json!({"cmd": "pytest {test_names}", "tests": ["a"]});
    let outcome = scheduler
        .request_expansion(parent.id, ExpanderKind::Tests, &manifest)
        .await
        .unwrap();
    assert!(matches!(outcome, ExpansionOutcome::LockBusy));

    let steps = harness.ctx.steps.list_by_job(fixture.job.id).await.unwrap();
    assert_eq!(steps.len(), 1);
}

#[tokio::test]
async fn test_empty_tests_manifest_is_rejected_with_reason() {
    let harness = TestHarness::new();
    let fixture = fixtures::job_with_plan(&harness, fixtures::wrapped_backend()).await;
    let scheduler = JobScheduler::new(harness.ctx.clone());
    let parent = started_step(&harness, &scheduler, &fixture, 2).await;

    let manifest = json!({"cmd": "pytest {test_names}", "tests": []});
    let outcome = scheduler
        .request_expansion(parent.id, ExpanderKind::Tests, &manifest)
        .await
        .unwrap();
    assert!(matches!(outcome, ExpansionOutcome::Rejected(Reason::MissingTests)));

    // No steps created, reason recorded, step marked failed.
    let steps = harness.ctx.steps.list_by_job(fixture.job.id).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].verdict, Verdict::Failed);
    let reasons = harness.ctx.failures.list_by_step(parent.id).await.unwrap();
    assert_eq!(reasons.len(), 1);
    assert_eq!(reasons[0].reason, Reason::MissingTests);

    // A rejected manifest is not expanded; a corrected retry may still run.
    let retry = scheduler
        .request_expansion(
            parent.id,
            ExpanderKind::Tests,
            &json!({"cmd": "pytest {test_names}", "tests": ["a"]}),
        )
        .await
        .unwrap();
    assert!(matches!(retry, ExpansionOutcome::Created(_)));
}

#[tokio::test]
async fn test_explicit_phase_name_is_honored() {
    let harness = TestHarness::new();
    let fixture = fixtures::job_with_plan(&harness, fixtures::wrapped_backend()).await;
    let scheduler = JobScheduler::new(harness.ctx.clone());
    let parent = started_step(&harness, &scheduler, &fixture, 2).await;

    let manifest = json!({
        "phase": "Integration tests",
        "cmd": "pytest {test_names}",
        "tests": ["a"],
    });
    scheduler
        .request_expansion(parent.id, ExpanderKind::Tests, &manifest)
        .await
        .unwrap();

    let phases = harness.ctx.phases.list_by_job(fixture.job.id).await.unwrap();
    assert!(phases.iter().any(|p| p.label == "Integration tests"));
}

#[tokio::test]
async fn test_child_data_inherits_only_the_whitelist() {
    let harness = TestHarness::new();
    let fixture = fixtures::job_with_plan(&harness, fixtures::wrapped_backend()).await;
    let scheduler = JobScheduler::new(harness.ctx.clone());
    let mut parent = started_step(&harness, &scheduler, &fixture, 2).await;

    parent.data.insert("release", json!("precise"));
    parent.data.insert("node_hint", json!("rack-7"));
    harness.ctx.steps.update(&parent).await.unwrap();

    let manifest = json!({"cmd": "pytest {test_names}", "tests": ["a"]});
    let outcome = scheduler
        .request_expansion(parent.id, ExpanderKind::Tests, &manifest)
        .await
        .unwrap();
    let children = match outcome {
        ExpansionOutcome::Created(children) => children,
        other => panic!("expected Created, got {:?}", other),
    };

    assert_eq!(children[0].data.get("release"), Some(&json!("precise")));
    assert!(children[0].data.get("node_hint").is_none());
    assert!(children[0].data.get("max_executors").is_none());
    assert!(!children[0].data.expanded());
}

#[tokio::test]
async fn test_commands_expansion_creates_one_step_per_command() {
    let harness = TestHarness::new();
    let fixture = fixtures::job_with_plan(&harness, fixtures::wrapped_backend()).await;
    let scheduler = JobScheduler::new(harness.ctx.clone());
    let parent = started_step(&harness, &scheduler, &fixture, 4).await;

    let manifest = json!({
        "commands": [
            {"script": "make lint"},
            {"script": "make docs"},
            {"script": "make audit"},
        ]
    });
    let outcome = scheduler
        .request_expansion(parent.id, ExpanderKind::Commands, &manifest)
        .await
        .unwrap();
    let children = match outcome {
        ExpansionOutcome::Created(children) => children,
        other => panic!("expected Created, got {:?}", other),
    };

    assert_eq!(children.len(), 3);
    for child in &children {
        let commands = harness.ctx.commands.list_by_step(child.id).await.unwrap();
        // setup + the command itself + teardown
        assert_eq!(commands.len(), 3);
    }
}

#[tokio::test]
async fn test_shard_count_clamped_to_item_count() {
    let harness = TestHarness::new();
    let fixture = fixtures::job_with_plan(&harness, fixtures::wrapped_backend()).await;
    let scheduler = JobScheduler::new(harness.ctx.clone());
    let parent = started_step(&harness, &scheduler, &fixture, 8).await;

    let manifest = json!({"cmd": "pytest {test_names}", "tests": ["only_one"]});
    let outcome = scheduler
        .request_expansion(parent.id, ExpanderKind::Tests, &manifest)
        .await
        .unwrap();
    let children = match outcome {
        ExpansionOutcome::Created(children) => children,
        other => panic!("expected Created, got {:?}", other),
    };
    assert_eq!(children.len(), 1);
}

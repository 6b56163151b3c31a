//! Fixtures for creating sample builds, jobs and plans.

use crate::harness::TestHarness;
use crucible_core::build::{BackendKind, BackendSpec, Build, Job, JobPlan};
use crucible_core::ports::TestStats;
use crucible_core::state::Cause;
use crucible_core::ProjectId;
use serde_json::json;

/// A build with one job bound to a plan snapshot, persisted in the store.
pub struct JobFixture {
    pub build: Build,
    pub job: Job,
    pub plan: JobPlan,
}

/// Backend spec running a single command list.
pub fn default_backend() -> BackendSpec {
    BackendSpec {
        kind: BackendKind::Default,
        options: json!({
            "commands": [{"script": "make test"}],
        }),
    }
}

/// Backend spec with setup/teardown wrapping, for expansion tests.
pub fn wrapped_backend() -> BackendSpec {
    BackendSpec {
        kind: BackendKind::Default,
        options: json!({
            "setup": [{"script": "git checkout"}],
            "commands": [{"script": "make collect-tests", "command_type": "collector"}],
            "teardown": [{"script": "rm -rf workspace"}],
        }),
    }
}

pub fn dummy_backend() -> BackendSpec {
    BackendSpec {
        kind: BackendKind::Dummy,
        options: json!({}),
    }
}

/// Historical durations used by the sharding scenarios.
pub fn stats(durations: &[(&str, u64)], avg: u64) -> TestStats {
    let mut stats = TestStats::default();
    stats.avg_duration_ms = avg;
    for (name, duration) in durations {
        stats.durations_ms.insert((*name).to_string(), *duration);
    }
    stats
}

/// Persist a build with one job and its immutable plan snapshot.
pub async fn job_with_plan(harness: &TestHarness, backend: BackendSpec) -> JobFixture {
    let project_id = ProjectId::new();
    let build = Build::new(project_id, 1, Cause::Push);
    harness.ctx.builds.create(&build).await.unwrap();

    let job = Job::new(build.id, project_id, "linux-x86_64");
    harness.ctx.jobs.create(&job).await.unwrap();

    let plan = JobPlan::new(job.id, job.label.clone(), backend);
    harness.ctx.jobs.create_plan(&plan).await.unwrap();

    JobFixture { build, job, plan }
}

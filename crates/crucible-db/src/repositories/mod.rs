//! Repository implementations.

mod build;
mod job;
mod phase;
mod step;
mod task;

pub use build::PgBuildRepository;
pub use job::PgJobRepository;
pub use phase::PgPhaseRepository;
pub use step::{PgCommandRepository, PgStepRepository};
pub use task::{PgFailureReasonRepository, PgTaskRepository};

use crucible_core::build::{CommandType, Reason};
use crucible_core::state::{Cause, Status, Verdict};
use crucible_core::task::TaskName;

pub(crate) fn status_to_str(status: &Status) -> &'static str {
    match status {
        Status::Unknown => "unknown",
        Status::PendingAllocation => "pending_allocation",
        Status::Queued => "queued",
        Status::Allocated => "allocated",
        Status::InProgress => "in_progress",
        Status::CollectingResults => "collecting_results",
        Status::Finished => "finished",
    }
}

pub(crate) fn str_to_status(s: &str) -> Status {
    match s {
        "pending_allocation" => Status::PendingAllocation,
        "queued" => Status::Queued,
        "allocated" => Status::Allocated,
        "in_progress" => Status::InProgress,
        "collecting_results" => Status::CollectingResults,
        "finished" => Status::Finished,
        _ => Status::Unknown,
    }
}

pub(crate) fn verdict_to_str(verdict: &Verdict) -> &'static str {
    match verdict {
        Verdict::Unknown => "unknown",
        Verdict::Aborted => "aborted",
        Verdict::Failed => "failed",
        Verdict::InfraFailed => "infra_failed",
        Verdict::Passed => "passed",
        Verdict::Skipped => "skipped",
        Verdict::QuarantinedFailed => "quarantined_failed",
        Verdict::QuarantinedPassed => "quarantined_passed",
        Verdict::QuarantinedSkipped => "quarantined_skipped",
    }
}

pub(crate) fn str_to_verdict(s: &str) -> Verdict {
    match s {
        "aborted" => Verdict::Aborted,
        "failed" => Verdict::Failed,
        "infra_failed" => Verdict::InfraFailed,
        "passed" => Verdict::Passed,
        "skipped" => Verdict::Skipped,
        "quarantined_failed" => Verdict::QuarantinedFailed,
        "quarantined_passed" => Verdict::QuarantinedPassed,
        "quarantined_skipped" => Verdict::QuarantinedSkipped,
        _ => Verdict::Unknown,
    }
}

pub(crate) fn cause_to_str(cause: &Cause) -> &'static str {
    match cause {
        Cause::Unknown => "unknown",
        Cause::Manual => "manual",
        Cause::Push => "push",
        Cause::Retry => "retry",
        Cause::Snapshot => "snapshot",
    }
}

pub(crate) fn str_to_cause(s: &str) -> Cause {
    match s {
        "manual" => Cause::Manual,
        "push" => Cause::Push,
        "retry" => Cause::Retry,
        "snapshot" => Cause::Snapshot,
        _ => Cause::Unknown,
    }
}

pub(crate) fn command_type_to_str(command_type: &CommandType) -> &'static str {
    match command_type {
        CommandType::Setup => "setup",
        CommandType::Default => "default",
        CommandType::Teardown => "teardown",
        CommandType::Collector => "collector",
    }
}

pub(crate) fn str_to_command_type(s: &str) -> CommandType {
    match s {
        "setup" => CommandType::Setup,
        "teardown" => CommandType::Teardown,
        "collector" => CommandType::Collector,
        _ => CommandType::Default,
    }
}

pub(crate) fn reason_to_str(reason: &Reason) -> &'static str {
    match reason {
        Reason::Timeout => "timeout",
        Reason::MissingArtifact => "missing_artifact",
        Reason::MalformedArtifact => "malformed_artifact",
        Reason::MissingTests => "missing_tests",
        Reason::MalformedManifest => "malformed_manifest",
        Reason::InfraFailure => "infra_failure",
    }
}

pub(crate) fn str_to_reason(s: &str) -> Reason {
    match s {
        "timeout" => Reason::Timeout,
        "missing_artifact" => Reason::MissingArtifact,
        "malformed_artifact" => Reason::MalformedArtifact,
        "missing_tests" => Reason::MissingTests,
        "malformed_manifest" => Reason::MalformedManifest,
        _ => Reason::InfraFailure,
    }
}

pub(crate) fn str_to_task_name(s: &str) -> Option<TaskName> {
    match s {
        "create_job" => Some(TaskName::CreateJob),
        "sync_job" => Some(TaskName::SyncJob),
        "sync_step" => Some(TaskName::SyncStep),
        "sync_build" => Some(TaskName::SyncBuild),
        "expand_step" => Some(TaskName::ExpandStep),
        _ => None,
    }
}

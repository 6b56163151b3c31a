//! Execution status and verdict vocabulary, with worst-case-wins aggregation.

use serde::{Deserialize, Serialize};

/// Scheduling state of a build, job, phase, step or ledger task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Unknown,
    PendingAllocation,
    Queued,
    Allocated,
    InProgress,
    CollectingResults,
    Finished,
}

impl Status {
    pub fn is_finished(&self) -> bool {
        matches!(self, Status::Finished)
    }
}

/// Outcome of a finished (or finishing) entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Unknown,
    Aborted,
    Failed,
    InfraFailed,
    Passed,
    Skipped,
    QuarantinedFailed,
    QuarantinedPassed,
    QuarantinedSkipped,
}

impl Verdict {
    pub fn is_failure(&self) -> bool {
        matches!(self, Verdict::Aborted | Verdict::Failed | Verdict::InfraFailed)
    }

    pub fn is_ok(&self) -> bool {
        matches!(
            self,
            Verdict::Passed | Verdict::Skipped | Verdict::QuarantinedPassed
        )
    }
}

/// What triggered a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cause {
    Unknown,
    Manual,
    Push,
    Retry,
    Snapshot,
}

// Highest priority first. A parent takes the highest-priority value present
// among its children; `Unknown` is the default and never wins over a known
// value.
const STATUS_PRIORITY: [Status; 6] = [
    Status::InProgress,
    Status::Queued,
    Status::Allocated,
    Status::PendingAllocation,
    Status::CollectingResults,
    Status::Finished,
];

// `Unknown` ranks above `Passed` here: a child with no verdict yet keeps the
// parent from reporting a pass.
const VERDICT_PRIORITY: [Verdict; 9] = [
    Verdict::Aborted,
    Verdict::Failed,
    Verdict::InfraFailed,
    Verdict::Unknown,
    Verdict::Passed,
    Verdict::Skipped,
    Verdict::QuarantinedFailed,
    Verdict::QuarantinedPassed,
    Verdict::QuarantinedSkipped,
];

/// Combine child statuses into a parent status. Empty input yields `Unknown`.
pub fn aggregate_status<I>(statuses: I) -> Status
where
    I: IntoIterator<Item = Status>,
{
    let mut best: Option<usize> = None;
    for status in statuses {
        if let Some(rank) = STATUS_PRIORITY.iter().position(|s| *s == status) {
            best = Some(best.map_or(rank, |b| b.min(rank)));
        }
    }
    best.map_or(Status::Unknown, |rank| STATUS_PRIORITY[rank])
}

/// Combine child verdicts into a parent verdict. Empty input yields `Unknown`.
pub fn aggregate_verdict<I>(verdicts: I) -> Verdict
where
    I: IntoIterator<Item = Verdict>,
{
    let mut best: Option<usize> = None;
    for verdict in verdicts {
        if let Some(rank) = VERDICT_PRIORITY.iter().position(|v| *v == verdict) {
            best = Some(best.map_or(rank, |b| b.min(rank)));
        }
    }
    best.map_or(Verdict::Unknown, |rank| VERDICT_PRIORITY[rank])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_aggregate_verdict_failed_wins_over_passed() {
        let verdict = aggregate_verdict([Verdict::Passed, Verdict::Failed, Verdict::Unknown]);
        assert_eq!(verdict, Verdict::Failed);
    }

    #[test]
    fn test_aggregate_verdict_aborted_wins_over_failed() {
        let verdict = aggregate_verdict([Verdict::Failed, Verdict::Aborted, Verdict::Passed]);
        assert_eq!(verdict, Verdict::Aborted);
    }

    #[test]
    fn test_aggregate_verdict_unknown_blocks_pass() {
        let verdict = aggregate_verdict([Verdict::Passed, Verdict::Unknown]);
        assert_eq!(verdict, Verdict::Unknown);
    }

    #[test]
    fn test_aggregate_verdict_empty() {
        let verdict = aggregate_verdict([]);
        assert_eq!(verdict, Verdict::Unknown);
    }

    #[test]
    fn test_aggregate_status_in_progress_wins() {
        let status = aggregate_status([
            Status::Finished,
            Status::Queued,
            Status::InProgress,
            Status::Unknown,
        ]);
        assert_eq!(status, Status::InProgress);
    }

    #[test]
    fn test_aggregate_status_unknown_is_skipped() {
        let status = aggregate_status([Status::Finished, Status::Unknown]);
        assert_eq!(status, Status::Finished);
    }

    #[test]
    fn test_aggregate_status_empty() {
        let status = aggregate_status([]);
        assert_eq!(status, Status::Unknown);
    }

    #[test]
    fn test_aggregate_status_queued_wins_over_finished() {
        let status = aggregate_status([Status::Finished, Status::Queued, Status::Finished]);
        assert_eq!(status, Status::Queued);
    }
}

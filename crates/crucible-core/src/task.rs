//! Task ledger entries: one persisted idempotency/retry record per
//! schedulable unit of work.

use crate::ids::TaskId;
use crate::state::{Status, Verdict};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// Names of the schedulable units the engine knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskName {
    CreateJob,
    SyncJob,
    SyncStep,
    SyncBuild,
    ExpandStep,
}

impl TaskName {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskName::CreateJob => "create_job",
            TaskName::SyncJob => "sync_job",
            TaskName::SyncStep => "sync_step",
            TaskName::SyncBuild => "sync_build",
            TaskName::ExpandStep => "expand_step",
        }
    }
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ledger row uniquely keyed by `(name, parent_id, child_id)`.
///
/// `child_id` identifies the entity the task operates on; `parent_id` groups
/// sibling tasks so a parent can wait on all of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: TaskName,
    pub parent_id: Uuid,
    pub child_id: Uuid,
    pub status: Status,
    pub verdict: Verdict,
    pub num_retries: u32,
    #[serde(default)]
    pub data: Value,
    pub date_created: DateTime<Utc>,
    pub date_modified: DateTime<Utc>,
}

impl Task {
    pub fn new(name: TaskName, parent_id: Uuid, child_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            name,
            parent_id,
            child_id,
            status: Status::Queued,
            verdict: Verdict::Unknown,
            num_retries: 0,
            data: Value::Null,
            date_created: now,
            date_modified: now,
        }
    }
}

/// Outcome of one handler invocation.
///
/// "Not finished yet" is a success variant, not an error: `Reschedule` asks
/// the transport to deliver the task again after `delay` without counting a
/// retry. Real failures travel through `Err` and feed the retry counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Done,
    Reschedule { delay: Duration },
}

//! Signals fired at lifecycle boundaries, consumed by out-of-scope
//! listeners (mail, chat, code review).

use crate::ids::{BuildId, JobId, PhaseId, ProjectId, StepId};
use crate::state::{Cause, Verdict};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Signal {
    BuildCreated {
        build_id: BuildId,
        project_id: ProjectId,
        cause: Cause,
    },
    JobStarted {
        job_id: JobId,
        build_id: BuildId,
    },
    JobFinished {
        job_id: JobId,
        build_id: BuildId,
        verdict: Verdict,
    },
    BuildFinished {
        build_id: BuildId,
        project_id: ProjectId,
        verdict: Verdict,
    },
    StepExpanded {
        step_id: StepId,
        job_id: JobId,
        phase_id: PhaseId,
        step_count: usize,
    },
}

impl Signal {
    /// Returns the bus subject for this signal.
    pub fn subject(&self) -> String {
        match self {
            Signal::BuildCreated { build_id, .. } => format!("build.created.{}", build_id),
            Signal::JobStarted { build_id, job_id } => {
                format!("build.{}.job.{}.started", build_id, job_id)
            }
            Signal::JobFinished { build_id, job_id, .. } => {
                format!("build.{}.job.{}.finished", build_id, job_id)
            }
            Signal::BuildFinished { build_id, .. } => format!("build.finished.{}", build_id),
            Signal::StepExpanded { job_id, step_id, .. } => {
                format!("job.{}.step.{}.expanded", job_id, step_id)
            }
        }
    }
}

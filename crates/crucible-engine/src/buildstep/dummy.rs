//! Inert build step used by tests and plan validation.

use super::BuildStep;
use crate::context::EngineContext;
use async_trait::async_trait;
use chrono::Utc;
use crucible_core::build::{Artifact, Job, JobPhase, JobStep};
use crucible_core::state::{Status, Verdict};
use crucible_core::Result;

/// Creates a single phase with a single step that passes immediately.
#[derive(Debug, Default)]
pub struct DummyBuildStep;

impl DummyBuildStep {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BuildStep for DummyBuildStep {
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, ctx: &EngineContext, job: &mut Job) -> Result<Vec<JobStep>> {
        let phase = ctx
            .phases
            .create_or_get(&JobPhase::new(job.id, job.label.clone()))
            .await?;
        let mut step = JobStep::new(phase.id, job.id, job.label.clone());
        let now = Utc::now();
        step.status = Status::Finished;
        step.verdict = Verdict::Passed;
        step.date_started = Some(now);
        step.date_finished = Some(now);
        ctx.steps.create(&step).await?;
        Ok(vec![step])
    }

    async fn update(&self, _ctx: &EngineContext, _job: &mut Job) -> Result<()> {
        Ok(())
    }

    async fn update_step(&self, _ctx: &EngineContext, _step: &mut JobStep) -> Result<()> {
        Ok(())
    }

    async fn cancel(&self, _ctx: &EngineContext, _job: &mut Job) -> Result<()> {
        Ok(())
    }

    async fn cancel_step(&self, _ctx: &EngineContext, _step: &mut JobStep) -> Result<()> {
        Ok(())
    }

    async fn fetch_artifact(&self, _ctx: &EngineContext, _artifact: &Artifact) -> Result<()> {
        Ok(())
    }

    async fn create_replacement_jobstep(
        &self,
        _ctx: &EngineContext,
        _step: &JobStep,
    ) -> Result<Option<JobStep>> {
        Ok(None)
    }
}

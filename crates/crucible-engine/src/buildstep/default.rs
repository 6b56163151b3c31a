//! The default build step: a configured command list executed on an
//! allocated node, with state reported back through the inbound surface.

use super::{create_commands, BuildStep, CommandSpec, ResourceLimits};
use crate::context::EngineContext;
use async_trait::async_trait;
use chrono::Utc;
use crucible_core::build::{
    Artifact, CommandType, FailureReason, Job, JobPhase, JobStep, Reason, StepData,
};
use crucible_core::state::{Status, Verdict};
use crucible_core::{Error, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct DefaultStepOptions {
    /// Main commands, run between setup and teardown.
    pub commands: Vec<CommandSpec>,
    #[serde(default)]
    pub setup: Vec<CommandSpec>,
    #[serde(default)]
    pub teardown: Vec<CommandSpec>,
    #[serde(default)]
    pub cpus: Option<u32>,
    #[serde(default)]
    pub memory_mb: Option<u32>,
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default = "default_phase_label")]
    pub phase_label: String,
}

fn default_phase_label() -> String {
    "Build".to_string()
}

#[derive(Debug)]
pub struct DefaultBuildStep {
    options: DefaultStepOptions,
}

impl DefaultBuildStep {
    pub fn new(options: DefaultStepOptions) -> Self {
        Self { options }
    }

    pub fn from_options(options: &Value) -> Result<Self> {
        let options: DefaultStepOptions = serde_json::from_value(options.clone())
            .map_err(|e| Error::InvalidStepConfig(e.to_string()))?;
        Ok(Self::new(options))
    }

    /// All commands of a fresh root step, in execution order.
    fn root_command_specs(&self) -> Vec<CommandSpec> {
        let mut specs = Vec::new();
        for spec in &self.options.setup {
            let mut spec = spec.clone();
            spec.command_type = CommandType::Setup;
            specs.push(spec);
        }
        specs.extend(self.options.commands.iter().cloned());
        for spec in &self.options.teardown {
            let mut spec = spec.clone();
            spec.command_type = CommandType::Teardown;
            specs.push(spec);
        }
        specs
    }

    fn base_step_data(&self) -> StepData {
        let mut data = StepData::new();
        if let Some(cpus) = self.options.cpus {
            data.insert("cpus", cpus.into());
        }
        if let Some(memory_mb) = self.options.memory_mb {
            data.insert("memory", memory_mb.into());
        }
        data
    }

    async fn create_root_step(
        &self,
        ctx: &EngineContext,
        job: &Job,
        phase: &JobPhase,
        replacement_count: u64,
    ) -> Result<JobStep> {
        let mut step = JobStep::new(phase.id, job.id, job.label.clone());
        step.cluster = self.options.cluster.clone();
        step.data = self.base_step_data();
        if replacement_count > 0 {
            step.data.set_replacement_count(replacement_count);
        }
        ctx.steps.create(&step).await?;
        create_commands(ctx, &step, &self.root_command_specs()).await?;
        Ok(step)
    }
}

#[async_trait]
impl BuildStep for DefaultBuildStep {
    fn validate(&self) -> Result<()> {
        if self.options.commands.is_empty() {
            return Err(Error::InvalidStepConfig(
                "at least one command is required".to_string(),
            ));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &EngineContext, job: &mut Job) -> Result<Vec<JobStep>> {
        let phase = ctx
            .phases
            .create_or_get(&JobPhase::new(job.id, self.options.phase_label.clone()))
            .await?;
        let step = self.create_root_step(ctx, job, &phase, 0).await?;
        debug!(job = %job.id, step = %step.id, "created initial step");
        Ok(vec![step])
    }

    async fn update(&self, _ctx: &EngineContext, job: &mut Job) -> Result<()> {
        // Step state arrives through the inbound report surface; there is no
        // remote job-level state to poll.
        debug!(job = %job.id, "job update is a no-op for the default backend");
        Ok(())
    }

    async fn update_step(&self, ctx: &EngineContext, step: &mut JobStep) -> Result<()> {
        if step.status.is_finished() {
            return Ok(());
        }
        // A running step that stopped heartbeating has lost its node.
        if step.status == Status::InProgress
            && let Some(heartbeat) = step.last_heartbeat
        {
            let silence = (Utc::now() - heartbeat).num_seconds().max(0) as u64;
            if silence > ctx.config.heartbeat_timeout_secs {
                warn!(step = %step.id, silence, "step heartbeat lost, marking infra_failed");
                step.status = Status::Finished;
                step.verdict = Verdict::InfraFailed;
                step.date_finished = Some(Utc::now());
                ctx.steps.update(step).await?;
                if let Some(job) = ctx.jobs.get(step.job_id).await? {
                    ctx.failures
                        .record(&FailureReason::for_step(
                            step,
                            job.build_id,
                            job.project_id,
                            Reason::InfraFailure,
                        ))
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn cancel(&self, _ctx: &EngineContext, job: &mut Job) -> Result<()> {
        debug!(job = %job.id, "cancel requested");
        Ok(())
    }

    async fn cancel_step(&self, _ctx: &EngineContext, step: &mut JobStep) -> Result<()> {
        debug!(step = %step.id, "cancel requested");
        Ok(())
    }

    async fn fetch_artifact(&self, _ctx: &EngineContext, artifact: &Artifact) -> Result<()> {
        // Artifact parsing is delegated to registered handlers.
        debug!(artifact = %artifact.id, name = %artifact.name, "artifact fetched");
        Ok(())
    }

    async fn create_replacement_jobstep(
        &self,
        ctx: &EngineContext,
        step: &JobStep,
    ) -> Result<Option<JobStep>> {
        let count = step.data.replacement_count();
        if count >= u64::from(ctx.config.max_step_replacements) {
            warn!(step = %step.id, count, "replacement cap reached");
            return Ok(None);
        }

        let phase = ctx
            .phases
            .get(step.phase_id)
            .await?
            .ok_or_else(|| Error::PhaseNotFound(step.phase_id.to_string()))?;

        let replacement = if step.data.generated() {
            // Reconstitute the generated step's own commands; setup and
            // teardown are already embedded in them.
            let mut new_step = JobStep::new(phase.id, step.job_id, step.label.clone());
            new_step.cluster = step.cluster.clone();
            new_step.data = step.data.clone();
            new_step.data.set_replacement_count(count + 1);
            ctx.steps.create(&new_step).await?;

            let commands = ctx.commands.list_by_step(step.id).await?;
            let specs: Vec<CommandSpec> = commands
                .iter()
                .map(|c| CommandSpec {
                    script: c.script.clone(),
                    label: Some(c.label.clone()),
                    command_type: c.command_type,
                    env: c.env.clone(),
                })
                .collect();
            create_commands(ctx, &new_step, &specs).await?;
            new_step
        } else {
            let job = ctx
                .jobs
                .get(step.job_id)
                .await?
                .ok_or_else(|| Error::JobNotFound(step.job_id.to_string()))?;
            self.create_root_step(ctx, &job, &phase, count + 1).await?
        };

        // The old step stays behind as the audit trail; only the pointer
        // changes.
        let mut replaced = step.clone();
        replaced.replacement_id = Some(replacement.id);
        ctx.steps.update(&replaced).await?;

        debug!(old = %step.id, new = %replacement.id, "created replacement step");
        Ok(Some(replacement))
    }

    fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits {
            cpus: self.options.cpus,
            memory_mb: self.options.memory_mb,
        }
    }

    fn ancillary_commands(&self) -> (Vec<CommandSpec>, Vec<CommandSpec>) {
        let setup = self
            .options
            .setup
            .iter()
            .cloned()
            .map(|mut spec| {
                spec.command_type = CommandType::Setup;
                spec
            })
            .collect();
        let teardown = self
            .options
            .teardown
            .iter()
            .cloned()
            .map(|mut spec| {
                spec.command_type = CommandType::Teardown;
                spec
            })
            .collect();
        (setup, teardown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_requires_commands() {
        let step = DefaultBuildStep::from_options(&json!({"commands": []})).unwrap();
        assert!(step.validate().is_err());
    }

    #[test]
    fn test_malformed_options_rejected() {
        let err = DefaultBuildStep::from_options(&json!({"commands": "nope"})).unwrap_err();
        assert!(err.is_unrecoverable());
    }

    #[test]
    fn test_root_commands_order() {
        let step = DefaultBuildStep::from_options(&json!({
            "setup": [{"script": "git clone"}],
            "commands": [{"script": "make test"}],
            "teardown": [{"script": "rm -rf work"}],
        }))
        .unwrap();
        let specs = step.root_command_specs();
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[0].command_type, CommandType::Setup);
        assert_eq!(specs[1].command_type, CommandType::Default);
        assert_eq!(specs[2].command_type, CommandType::Teardown);
    }
}

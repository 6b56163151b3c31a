//! Build step capability interface.
//!
//! A `BuildStep` is the polymorphic adapter between the scheduler and one
//! execution backend. Construction is config-driven: a closed kind tag plus
//! an opaque options blob, resolved once at job-plan-bind time.

pub mod default;
pub mod dummy;

pub use default::DefaultBuildStep;
pub use dummy::DummyBuildStep;

use crate::context::EngineContext;
use async_trait::async_trait;
use crucible_core::build::{Artifact, BackendKind, BackendSpec, CommandType, Job, JobPhase, JobStep};
use crucible_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Scheduling hints consumed by the allocator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    pub cpus: Option<u32>,
    pub memory_mb: Option<u32>,
}

/// Declarative command description used when materializing steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    pub script: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub command_type: CommandType,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl CommandSpec {
    pub fn display_label(&self) -> String {
        self.label.clone().unwrap_or_else(|| self.script.clone())
    }
}

/// Capability interface over one execution backend.
///
/// `update`/`update_step` are polled repeatedly until the entity finishes
/// and must be idempotent; calling them on a finished entity is a no-op.
#[async_trait]
pub trait BuildStep: Send + Sync + std::fmt::Debug {
    /// Check the configuration before any job state is touched. Errors are
    /// unrecoverable: the job is finalized as aborted, never retried.
    fn validate(&self) -> Result<()>;

    /// Check an expansion-created phase before its steps run.
    fn validate_phase(&self, phase: &JobPhase) -> Result<()> {
        let _ = phase;
        Ok(())
    }

    /// Called exactly once per job at creation: create the initial phase and
    /// steps and return them for scheduling.
    async fn execute(&self, ctx: &EngineContext, job: &mut Job) -> Result<Vec<JobStep>>;

    /// Refresh job-level state from the backend.
    async fn update(&self, ctx: &EngineContext, job: &mut Job) -> Result<()>;

    /// Refresh one step's state from the backend.
    async fn update_step(&self, ctx: &EngineContext, step: &mut JobStep) -> Result<()>;

    /// Best-effort abort; must tolerate the backend already being gone.
    async fn cancel(&self, ctx: &EngineContext, job: &mut Job) -> Result<()>;

    /// Best-effort step abort.
    async fn cancel_step(&self, ctx: &EngineContext, step: &mut JobStep) -> Result<()>;

    /// Pull and process one completed step's declared output file.
    async fn fetch_artifact(&self, ctx: &EngineContext, artifact: &Artifact) -> Result<()>;

    /// Retry protocol: build the replacement for a failed step, or `None`
    /// when this step type is not retryable.
    async fn create_replacement_jobstep(
        &self,
        ctx: &EngineContext,
        step: &JobStep,
    ) -> Result<Option<JobStep>>;

    fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits::default()
    }

    /// Setup and teardown command specs wrapped around expansion-generated
    /// work.
    fn ancillary_commands(&self) -> (Vec<CommandSpec>, Vec<CommandSpec>) {
        (Vec::new(), Vec::new())
    }
}

/// Materialize command specs as persisted commands of a step, in the order
/// given.
pub async fn create_commands(
    ctx: &EngineContext,
    step: &JobStep,
    specs: &[CommandSpec],
) -> Result<Vec<crucible_core::build::Command>> {
    let mut created = Vec::with_capacity(specs.len());
    for (order, spec) in specs.iter().enumerate() {
        let mut command = crucible_core::build::Command::new(
            step.id,
            order as u32,
            spec.display_label(),
            spec.script.clone(),
        );
        command.command_type = spec.command_type;
        command.env = spec.env.clone();
        ctx.commands.create(&command).await?;
        created.push(command);
    }
    Ok(created)
}

/// Resolve a plan's backend spec into a concrete build step.
///
/// The kind set is closed; kinds whose wire adapters are not compiled in
/// resolve to an unrecoverable configuration error.
pub fn resolve_buildstep(spec: &BackendSpec) -> Result<Arc<dyn BuildStep>> {
    match spec.kind {
        BackendKind::Dummy => Ok(Arc::new(DummyBuildStep::new())),
        BackendKind::Default => Ok(Arc::new(DefaultBuildStep::from_options(&spec.options)?)),
        other => Err(Error::UnsupportedBackend(other.as_str().to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolve_dummy() {
        let spec = BackendSpec {
            kind: BackendKind::Dummy,
            options: json!({}),
        };
        assert!(resolve_buildstep(&spec).is_ok());
    }

    #[test]
    fn test_resolve_unsupported_kind() {
        let spec = BackendSpec {
            kind: BackendKind::Koality,
            options: json!({}),
        };
        let err = resolve_buildstep(&spec).unwrap_err();
        assert!(err.is_unrecoverable());
    }

    #[test]
    fn test_command_spec_defaults() {
        let spec: CommandSpec = serde_json::from_value(json!({"script": "make"})).unwrap();
        assert_eq!(spec.command_type, CommandType::Default);
        assert_eq!(spec.display_label(), "make");
    }
}

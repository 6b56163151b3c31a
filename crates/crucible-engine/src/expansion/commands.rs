//! Expander for plain command manifests: one new step per command.

use super::{Expander, FutureJobStep, ManifestError};
use crate::buildstep::CommandSpec;
use crucible_core::build::{JobStep, StepData};
use crucible_core::ports::TestStats;
use crucible_core::Result;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Deserialize)]
struct CommandsManifest {
    commands: Vec<CommandEntry>,
}

#[derive(Debug, Deserialize)]
struct CommandEntry {
    script: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    weight: Option<u64>,
}

pub struct CommandsExpander;

impl Expander for CommandsExpander {
    fn validate(&self, manifest: &Value) -> std::result::Result<(), ManifestError> {
        let commands = manifest
            .get("commands")
            .and_then(Value::as_array)
            .ok_or(ManifestError::MissingField("commands"))?;
        if commands.is_empty() {
            return Err(ManifestError::Empty("commands"));
        }
        for entry in commands {
            if entry.get("script").and_then(Value::as_str).is_none() {
                return Err(ManifestError::MissingField("script"));
            }
        }
        Ok(())
    }

    fn expand(
        &self,
        manifest: &Value,
        _parent: &JobStep,
        _max_executors: usize,
        _stats: &TestStats,
    ) -> Result<Vec<FutureJobStep>> {
        let manifest: CommandsManifest = serde_json::from_value(manifest.clone())?;
        Ok(manifest
            .commands
            .into_iter()
            .map(|entry| {
                let label = entry.label.clone().unwrap_or_else(|| entry.script.clone());
                let mut data = StepData::new();
                if let Some(weight) = entry.weight {
                    data.set_weight(weight);
                }
                FutureJobStep {
                    label,
                    commands: vec![CommandSpec {
                        script: entry.script,
                        label: entry.label,
                        command_type: Default::default(),
                        env: entry.env,
                    }],
                    data,
                }
            })
            .collect())
    }
}

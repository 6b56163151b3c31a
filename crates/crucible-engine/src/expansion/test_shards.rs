//! Expander for collected test manifests: shards tests across executors by
//! historical duration.

use super::{Expander, FutureJobStep, ManifestError};
use crate::buildstep::CommandSpec;
use crate::shard::shard;
use crucible_core::build::{JobStep, StepData};
use crucible_core::ports::TestStats;
use crucible_core::Result;
use serde::Deserialize;
use serde_json::Value;

pub const TEST_NAMES_TOKEN: &str = "{test_names}";

#[derive(Debug, Deserialize)]
struct TestsManifest {
    cmd: String,
    tests: Vec<String>,
}

pub struct TestsExpander;

impl Expander for TestsExpander {
    fn validate(&self, manifest: &Value) -> std::result::Result<(), ManifestError> {
        let cmd = manifest
            .get("cmd")
            .and_then(Value::as_str)
            .ok_or(ManifestError::MissingField("cmd"))?;
        if !cmd.contains(TEST_NAMES_TOKEN) {
            return Err(ManifestError::MissingToken(TEST_NAMES_TOKEN));
        }
        let tests = manifest
            .get("tests")
            .and_then(Value::as_array)
            .ok_or(ManifestError::MissingField("tests"))?;
        if tests.is_empty() {
            return Err(ManifestError::Empty("tests"));
        }
        Ok(())
    }

    fn expand(
        &self,
        manifest: &Value,
        _parent: &JobStep,
        max_executors: usize,
        stats: &TestStats,
    ) -> Result<Vec<FutureJobStep>> {
        let manifest: TestsManifest = serde_json::from_value(manifest.clone())?;

        let shards = shard(manifest.tests, max_executors, |name| stats.weight_for(name));
        let shard_count = shards.len() as u64;

        Ok(shards
            .into_iter()
            .map(|group| {
                let script = manifest
                    .cmd
                    .replace(TEST_NAMES_TOKEN, &group.items.join(" "));
                let mut data = StepData::new();
                data.set_weight(group.weight);
                data.set_tests(&group.items);
                data.set_shard_count(shard_count);
                FutureJobStep {
                    label: script.clone(),
                    commands: vec![CommandSpec {
                        script,
                        label: None,
                        command_type: Default::default(),
                        env: Default::default(),
                    }],
                    data,
                }
            })
            .collect())
    }
}

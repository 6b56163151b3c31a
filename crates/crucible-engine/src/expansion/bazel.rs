//! Expander for bazel target manifests: shards build targets across
//! executors the same way tests are sharded.

use super::{Expander, FutureJobStep, ManifestError};
use crate::buildstep::CommandSpec;
use crate::shard::shard;
use crucible_core::build::{JobStep, StepData};
use crucible_core::ports::TestStats;
use crucible_core::Result;
use serde::Deserialize;
use serde_json::Value;

pub const TARGET_NAMES_TOKEN: &str = "{target_names}";

#[derive(Debug, Deserialize)]
struct TargetsManifest {
    cmd: String,
    targets: Vec<String>,
}

pub struct BazelTargetsExpander;

impl Expander for BazelTargetsExpander {
    fn validate(&self, manifest: &Value) -> std::result::Result<(), ManifestError> {
        let cmd = manifest
            .get("cmd")
            .and_then(Value::as_str)
            .ok_or(ManifestError::MissingField("cmd"))?;
        if !cmd.contains(TARGET_NAMES_TOKEN) {
            return Err(ManifestError::MissingToken(TARGET_NAMES_TOKEN));
        }
        let targets = manifest
            .get("targets")
            .and_then(Value::as_array)
            .ok_or(ManifestError::MissingField("targets"))?;
        if targets.is_empty() {
            return Err(ManifestError::Empty("targets"));
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
        let manifest: TargetsManifest = serde_json::from_value(manifest.clone())?;

        let shards = shard(manifest.targets, max_executors, |name| {
            stats.weight_for(name)
        });
        let shard_count = shards.len() as u64;

        Ok(shards
            .into_iter()
            .map(|group| {
                let script = manifest
                    .cmd
                    .replace(TARGET_NAMES_TOKEN, &group.items.join(" "));
                let mut data = StepData::new();
                data.set_weight(group.weight);
                data.set_targets(&group.items);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_core::{JobId, PhaseId};
    use serde_json::json;

    #[test]
    fn test_validate_requires_token_and_targets() {
        assert!(BazelTargetsExpander
            .validate(&json!({"cmd": "bazel test", "targets": ["//a"]}))
            .is_err());
        assert!(BazelTargetsExpander
            .validate(&json!({"cmd": "bazel test {target_names}", "targets": []}))
            .is_err());
        assert!(BazelTargetsExpander
            .validate(&json!({"cmd": "bazel test {target_names}", "targets": ["//a"]}))
            .is_ok());
    }

    #[test]
    fn test_expand_substitutes_targets() {
        let manifest = json!({
            "cmd": "bazel test {target_names}",
            "targets": ["//pkg:a", "//pkg:b"],
        });
        let parent = JobStep::new(PhaseId::new(), JobId::new(), "collect targets");
        let futures = BazelTargetsExpander
            .expand(&manifest, &parent, 1, &TestStats::default())
            .unwrap();
        assert_eq!(futures.len(), 1);
        assert_eq!(futures[0].commands[0].script, "bazel test //pkg:a //pkg:b");
        assert_eq!(
            futures[0].data.targets(),
            vec!["//pkg:a".to_string(), "//pkg:b".to_string()]
        );
    }
}

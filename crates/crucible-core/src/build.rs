//! Build, job, phase, step and command entities.

use crate::ids::{
    ArtifactId, BuildId, CommandId, JobId, NodeId, PhaseId, PlanId, ProjectId, StepId,
};
use crate::state::{Cause, Status, Verdict};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Top-level user-visible unit: one revision of one project, owning 1..N jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub project_id: ProjectId,
    pub number: u32,
    pub label: Option<String>,
    pub status: Status,
    pub verdict: Verdict,
    pub cause: Cause,
    pub target: Option<String>,
    pub message: Option<String>,
    pub date_created: DateTime<Utc>,
    pub date_started: Option<DateTime<Utc>>,
    pub date_finished: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl Build {
    pub fn new(project_id: ProjectId, number: u32, cause: Cause) -> Self {
        Self {
            id: BuildId::new(),
            project_id,
            number,
            label: None,
            status: Status::Queued,
            verdict: Verdict::Unknown,
            cause,
            target: None,
            message: None,
            date_created: Utc::now(),
            date_started: None,
            date_finished: None,
            duration_ms: None,
        }
    }
}

/// One execution attempt of a build against one plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub build_id: BuildId,
    pub project_id: ProjectId,
    pub label: String,
    pub status: Status,
    pub verdict: Verdict,
    pub date_created: DateTime<Utc>,
    pub date_started: Option<DateTime<Utc>>,
    pub date_finished: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(build_id: BuildId, project_id: ProjectId, label: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            build_id,
            project_id,
            label: label.into(),
            status: Status::Queued,
            verdict: Verdict::Unknown,
            date_created: Utc::now(),
            date_started: None,
            date_finished: None,
        }
    }

    pub fn duration_ms(&self) -> Option<u64> {
        match (self.date_started, self.date_finished) {
            (Some(started), Some(finished)) => {
                Some((finished - started).num_milliseconds().max(0) as u64)
            }
            _ => None,
        }
    }
}

/// Closed set of backend kinds a job plan can bind to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Dummy,
    Default,
    Lxc,
    JenkinsGeneric,
    JenkinsCollector,
    JenkinsTestCollector,
    Koality,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Dummy => "dummy",
            BackendKind::Default => "default",
            BackendKind::Lxc => "lxc",
            BackendKind::JenkinsGeneric => "jenkins_generic",
            BackendKind::JenkinsCollector => "jenkins_collector",
            BackendKind::JenkinsTestCollector => "jenkins_test_collector",
            BackendKind::Koality => "koality",
        }
    }
}

/// Backend kind plus its opaque options blob, resolved at job-plan-bind time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSpec {
    pub kind: BackendKind,
    #[serde(default)]
    pub options: Value,
}

/// Immutable snapshot binding a job to a concrete backend configuration.
///
/// Captured once when the job is created; later edits to the project's plan
/// never alter a running job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPlan {
    pub id: PlanId,
    pub job_id: JobId,
    pub label: String,
    pub backend: BackendSpec,
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u32,
    pub date_created: DateTime<Utc>,
}

fn default_timeout_minutes() -> u32 {
    90
}

impl JobPlan {
    pub fn new(job_id: JobId, label: impl Into<String>, backend: BackendSpec) -> Self {
        Self {
            id: PlanId::new(),
            job_id,
            label: label.into(),
            backend,
            timeout_minutes: default_timeout_minutes(),
            date_created: Utc::now(),
        }
    }
}

/// Named grouping of steps within a job, unique per `(job_id, label)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPhase {
    pub id: PhaseId,
    pub job_id: JobId,
    pub label: String,
    pub status: Status,
    pub verdict: Verdict,
    pub date_created: DateTime<Utc>,
    pub date_started: Option<DateTime<Utc>>,
    pub date_finished: Option<DateTime<Utc>>,
}

impl JobPhase {
    pub fn new(job_id: JobId, label: impl Into<String>) -> Self {
        Self {
            id: PhaseId::new(),
            job_id,
            label: label.into(),
            status: Status::Queued,
            verdict: Verdict::Unknown,
            date_created: Utc::now(),
            date_started: None,
            date_finished: None,
        }
    }
}

/// The atomic unit of execution, run on one worker node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStep {
    pub id: StepId,
    pub phase_id: PhaseId,
    pub job_id: JobId,
    pub label: String,
    pub status: Status,
    pub verdict: Verdict,
    pub node_id: Option<NodeId>,
    pub cluster: Option<String>,
    pub data: StepData,
    /// Next link in the replacement chain; the live tip has `None`.
    pub replacement_id: Option<StepId>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub date_created: DateTime<Utc>,
    pub date_started: Option<DateTime<Utc>>,
    pub date_finished: Option<DateTime<Utc>>,
}

impl JobStep {
    pub fn new(phase_id: PhaseId, job_id: JobId, label: impl Into<String>) -> Self {
        Self {
            id: StepId::new(),
            phase_id,
            job_id,
            label: label.into(),
            status: Status::PendingAllocation,
            verdict: Verdict::Unknown,
            node_id: None,
            cluster: None,
            data: StepData::new(),
            replacement_id: None,
            last_heartbeat: None,
            date_created: Utc::now(),
            date_started: None,
            date_finished: None,
        }
    }

    pub fn is_replaced(&self) -> bool {
        self.replacement_id.is_some()
    }

    pub fn duration_ms(&self) -> Option<u64> {
        match (self.date_started, self.date_finished) {
            (Some(started), Some(finished)) => {
                Some((finished - started).num_milliseconds().max(0) as u64)
            }
            _ => None,
        }
    }
}

/// Keys copied from a parent step's data into expansion-generated children.
const INHERITED_KEYS: [&str; 6] = ["release", "cpus", "memory", "weight", "tests", "shard_count"];

/// Free-form per-step configuration blob with typed accessors for the keys
/// the scheduler cares about.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepData(Map<String, Value>);

impl StepData {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    fn bool_field(&self, key: &str) -> bool {
        self.0.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    fn u64_field(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    fn string_list(&self, key: &str) -> Vec<String> {
        self.0
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Monotonic expansion guard; once set it is never unset.
    pub fn expanded(&self) -> bool {
        self.bool_field("expanded")
    }

    pub fn mark_expanded(&mut self) {
        self.insert("expanded", Value::Bool(true));
    }

    /// True for steps created by an expansion rather than a plan.
    pub fn generated(&self) -> bool {
        self.bool_field("generated")
    }

    pub fn mark_generated(&mut self) {
        self.insert("generated", Value::Bool(true));
    }

    pub fn weight(&self) -> Option<u64> {
        self.u64_field("weight")
    }

    pub fn set_weight(&mut self, weight: u64) {
        self.insert("weight", weight.into());
    }

    pub fn max_executors(&self) -> u64 {
        self.u64_field("max_executors").unwrap_or(1)
    }

    pub fn set_max_executors(&mut self, max_executors: u64) {
        self.insert("max_executors", max_executors.into());
    }

    pub fn tests(&self) -> Vec<String> {
        self.string_list("tests")
    }

    pub fn set_tests(&mut self, tests: &[String]) {
        self.insert(
            "tests",
            Value::Array(tests.iter().cloned().map(Value::String).collect()),
        );
    }

    pub fn targets(&self) -> Vec<String> {
        self.string_list("targets")
    }

    pub fn set_targets(&mut self, targets: &[String]) {
        self.insert(
            "targets",
            Value::Array(targets.iter().cloned().map(Value::String).collect()),
        );
    }

    pub fn shard_count(&self) -> Option<u64> {
        self.u64_field("shard_count")
    }

    pub fn set_shard_count(&mut self, count: u64) {
        self.insert("shard_count", count.into());
    }

    /// Links consumed so far in this step's replacement chain.
    pub fn replacement_count(&self) -> u64 {
        self.u64_field("replacement_count").unwrap_or(0)
    }

    pub fn set_replacement_count(&mut self, count: u64) {
        self.insert("replacement_count", count.into());
    }

    /// Overlay `other` onto this blob, overwriting colliding keys.
    pub fn merge(&mut self, other: &StepData) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// The whitelisted subset a generated child step inherits.
    pub fn inherit_for_child(&self) -> StepData {
        let mut child = Map::new();
        for key in INHERITED_KEYS {
            if let Some(value) = self.0.get(key) {
                child.insert(key.to_owned(), value.clone());
            }
        }
        Self(child)
    }
}

/// Kind of a command within a step. Commands run in ascending order; a
/// collector command's output feeds the expansion protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    Setup,
    #[default]
    Default,
    Teardown,
    Collector,
}

impl CommandType {
    pub fn is_collector(&self) -> bool {
        matches!(self, CommandType::Collector)
    }
}

/// One shell invocation within a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    pub step_id: StepId,
    pub order: u32,
    pub label: String,
    pub script: String,
    pub command_type: CommandType,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub status: Status,
    pub return_code: Option<i32>,
    pub date_started: Option<DateTime<Utc>>,
    pub date_finished: Option<DateTime<Utc>>,
}

impl Command {
    pub fn new(step_id: StepId, order: u32, label: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            id: CommandId::new(),
            step_id,
            order,
            label: label.into(),
            script: script.into(),
            command_type: CommandType::Default,
            env: HashMap::new(),
            status: Status::Queued,
            return_code: None,
            date_started: None,
            date_finished: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status.is_finished() && self.return_code == Some(0)
    }
}

/// Machine-readable reason codes for failure annotations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    Timeout,
    MissingArtifact,
    MalformedArtifact,
    MissingTests,
    MalformedManifest,
    InfraFailure,
}

impl Reason {
    /// Human-readable label surfaced on failed builds.
    pub fn label(&self) -> &'static str {
        match self {
            Reason::Timeout => "Build timed out",
            Reason::MissingArtifact => "A required artifact was not produced",
            Reason::MalformedArtifact => "An artifact could not be parsed",
            Reason::MissingTests => "No tests were collected",
            Reason::MalformedManifest => "An expansion manifest was rejected",
            Reason::InfraFailure => "Infrastructure failure",
        }
    }
}

/// Append-only diagnostic annotation explaining why a step or job failed.
/// Rows accumulate; they are never overwritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReason {
    /// Absent for job-level failures such as a job timeout.
    pub step_id: Option<StepId>,
    pub job_id: JobId,
    pub build_id: BuildId,
    pub project_id: ProjectId,
    pub reason: Reason,
    pub date_created: DateTime<Utc>,
}

impl FailureReason {
    pub fn for_step(step: &JobStep, build_id: BuildId, project_id: ProjectId, reason: Reason) -> Self {
        Self {
            step_id: Some(step.id),
            job_id: step.job_id,
            build_id,
            project_id,
            reason,
            date_created: Utc::now(),
        }
    }

    pub fn for_job(job: &Job, reason: Reason) -> Self {
        Self {
            step_id: None,
            job_id: job.id,
            build_id: job.build_id,
            project_id: job.project_id,
            reason,
            date_created: Utc::now(),
        }
    }
}

/// Worker identity a step runs on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub label: String,
    pub cluster: Option<String>,
    pub date_created: DateTime<Utc>,
}

/// Declared output file of a completed step, handed to `fetch_artifact`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub step_id: StepId,
    pub job_id: JobId,
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

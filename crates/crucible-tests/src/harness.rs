//! In-memory implementations of every engine port, backing the integration
//! suites without a live database or transport.

use async_trait::async_trait;
use crucible_core::build::{Build, Command, FailureReason, Job, JobPhase, JobPlan, JobStep};
use crucible_core::events::Signal;
use crucible_core::ids::*;
use crucible_core::ports::*;
use crucible_core::task::{Task, TaskName};
use crucible_core::Result;
use crucible_engine::{EngineConfig, EngineContext, TaskRunner};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Shared in-memory store implementing all repository ports.
#[derive(Default)]
pub struct MemoryStore {
    builds: Mutex<HashMap<Uuid, Build>>,
    jobs: Mutex<HashMap<Uuid, Job>>,
    plans: Mutex<HashMap<Uuid, JobPlan>>,
    phases: Mutex<Vec<JobPhase>>,
    steps: Mutex<Vec<JobStep>>,
    commands: Mutex<Vec<Command>>,
    tasks: Mutex<Vec<Task>>,
    failures: Mutex<Vec<FailureReason>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failure_reasons(&self) -> Vec<FailureReason> {
        self.failures.lock().unwrap().clone()
    }

    pub fn all_steps(&self) -> Vec<JobStep> {
        self.steps.lock().unwrap().clone()
    }

    pub fn all_tasks(&self) -> Vec<Task> {
        self.tasks.lock().unwrap().clone()
    }
}

#[async_trait]
impl BuildRepository for MemoryStore {
    async fn create(&self, build: &Build) -> Result<BuildId> {
        self.builds
            .lock()
            .unwrap()
            .insert(*build.id.as_uuid(), build.clone());
        Ok(build.id)
    }

    async fn get(&self, id: BuildId) -> Result<Option<Build>> {
        Ok(self.builds.lock().unwrap().get(id.as_uuid()).cloned())
    }

    async fn update(&self, build: &Build) -> Result<()> {
        self.builds
            .lock()
            .unwrap()
            .insert(*build.id.as_uuid(), build.clone());
        Ok(())
    }

    async fn next_build_number(&self, project_id: ProjectId) -> Result<u32> {
        let max = self
            .builds
            .lock()
            .unwrap()
            .values()
            .filter(|b| b.project_id == project_id)
            .map(|b| b.number)
            .max()
            .unwrap_or(0);
        Ok(max + 1)
    }
}

#[async_trait]
impl JobRepository for MemoryStore {
    async fn create(&self, job: &Job) -> Result<JobId> {
        self.jobs.lock().unwrap().insert(*job.id.as_uuid(), job.clone());
        Ok(job.id)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.jobs.lock().unwrap().get(id.as_uuid()).cloned())
    }

    async fn update(&self, job: &Job) -> Result<()> {
        self.jobs.lock().unwrap().insert(*job.id.as_uuid(), job.clone());
        Ok(())
    }

    async fn list_by_build(&self, build_id: BuildId) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| j.build_id == build_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.date_created);
        Ok(jobs)
    }

    async fn create_plan(&self, plan: &JobPlan) -> Result<PlanId> {
        self.plans
            .lock()
            .unwrap()
            .insert(*plan.job_id.as_uuid(), plan.clone());
        Ok(plan.id)
    }

    async fn get_plan(&self, job_id: JobId) -> Result<Option<JobPlan>> {
        Ok(self.plans.lock().unwrap().get(job_id.as_uuid()).cloned())
    }
}

#[async_trait]
impl PhaseRepository for MemoryStore {
    async fn create_or_get(&self, phase: &JobPhase) -> Result<JobPhase> {
        let mut phases = self.phases.lock().unwrap();
        if let Some(existing) = phases
            .iter()
            .find(|p| p.job_id == phase.job_id && p.label == phase.label)
        {
            return Ok(existing.clone());
        }
        phases.push(phase.clone());
        Ok(phase.clone())
    }

    async fn get(&self, id: PhaseId) -> Result<Option<JobPhase>> {
        Ok(self
            .phases
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.id == id)
            .cloned())
    }

    async fn update(&self, phase: &JobPhase) -> Result<()> {
        let mut phases = self.phases.lock().unwrap();
        if let Some(existing) = phases.iter_mut().find(|p| p.id == phase.id) {
            *existing = phase.clone();
        }
        Ok(())
    }

    async fn list_by_job(&self, job_id: JobId) -> Result<Vec<JobPhase>> {
        Ok(self
            .phases
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn count_by_job(&self, job_id: JobId) -> Result<usize> {
        Ok(self
            .phases
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.job_id == job_id)
            .count())
    }
}

#[async_trait]
impl StepRepository for MemoryStore {
    async fn create(&self, step: &JobStep) -> Result<StepId> {
        self.steps.lock().unwrap().push(step.clone());
        Ok(step.id)
    }

    async fn get(&self, id: StepId) -> Result<Option<JobStep>> {
        Ok(self
            .steps
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.id == id)
            .cloned())
    }

    async fn update(&self, step: &JobStep) -> Result<()> {
        let mut steps = self.steps.lock().unwrap();
        if let Some(existing) = steps.iter_mut().find(|s| s.id == step.id) {
            *existing = step.clone();
        }
        Ok(())
    }

    async fn list_by_phase(&self, phase_id: PhaseId) -> Result<Vec<JobStep>> {
        Ok(self
            .steps
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.phase_id == phase_id)
            .cloned()
            .collect())
    }

    async fn list_by_job(&self, job_id: JobId) -> Result<Vec<JobStep>> {
        Ok(self
            .steps
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn current_by_phase(&self, phase_id: PhaseId) -> Result<Vec<JobStep>> {
        Ok(self
            .steps
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.phase_id == phase_id && s.replacement_id.is_none())
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CommandRepository for MemoryStore {
    async fn create(&self, command: &Command) -> Result<CommandId> {
        self.commands.lock().unwrap().push(command.clone());
        Ok(command.id)
    }

    async fn get(&self, id: CommandId) -> Result<Option<Command>> {
        Ok(self
            .commands
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id == id)
            .cloned())
    }

    async fn update(&self, command: &Command) -> Result<()> {
        let mut commands = self.commands.lock().unwrap();
        if let Some(existing) = commands.iter_mut().find(|c| c.id == command.id) {
            *existing = command.clone();
        }
        Ok(())
    }

    async fn list_by_step(&self, step_id: StepId) -> Result<Vec<Command>> {
        let mut commands: Vec<Command> = self
            .commands
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.step_id == step_id)
            .cloned()
            .collect();
        commands.sort_by_key(|c| c.order);
        Ok(commands)
    }
}

#[async_trait]
impl TaskRepository for MemoryStore {
    async fn submit(&self, task: &Task) -> Result<bool> {
        let mut tasks = self.tasks.lock().unwrap();
        let exists = tasks.iter().any(|t| {
            t.name == task.name && t.parent_id == task.parent_id && t.child_id == task.child_id
        });
        if exists {
            return Ok(false);
        }
        tasks.push(task.clone());
        Ok(true)
    }

    async fn get(&self, name: TaskName, parent_id: Uuid, child_id: Uuid) -> Result<Option<Task>> {
        Ok(self
            .tasks
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.name == name && t.parent_id == parent_id && t.child_id == child_id)
            .cloned())
    }

    async fn update(&self, task: &Task) -> Result<()> {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(existing) = tasks.iter_mut().find(|t| t.id == task.id) {
            *existing = task.clone();
        }
        Ok(())
    }

    async fn list_children(&self, name: TaskName, parent_id: Uuid) -> Result<Vec<Task>> {
        Ok(self
            .tasks
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.name == name && t.parent_id == parent_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl FailureReasonRepository for MemoryStore {
    async fn record(&self, reason: &FailureReason) -> Result<()> {
        self.failures.lock().unwrap().push(reason.clone());
        Ok(())
    }

    async fn list_by_step(&self, step_id: StepId) -> Result<Vec<FailureReason>> {
        Ok(self
            .failures
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.step_id == Some(step_id))
            .cloned()
            .collect())
    }

    async fn list_by_build(&self, build_id: BuildId) -> Result<Vec<FailureReason>> {
        Ok(self
            .failures
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.build_id == build_id)
            .cloned()
            .collect())
    }
}

/// One entry handed to the transport.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub name: TaskName,
    pub parent_id: Uuid,
    pub child_id: Uuid,
    pub countdown: Duration,
}

/// Records enqueued tasks instead of delivering them.
#[derive(Default)]
pub struct RecordingQueue {
    entries: Mutex<Vec<QueuedTask>>,
}

impl RecordingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<QueuedTask> {
        std::mem::take(&mut *self.entries.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl TaskQueue for RecordingQueue {
    async fn enqueue(
        &self,
        name: TaskName,
        parent_id: Uuid,
        child_id: Uuid,
        countdown: Duration,
    ) -> Result<()> {
        self.entries.lock().unwrap().push(QueuedTask {
            name,
            parent_id,
            child_id,
            countdown,
        });
        Ok(())
    }
}

/// Lease lock over a plain set; TTLs are ignored since tests are
/// single-process and short-lived.
#[derive(Default)]
pub struct MemoryLock {
    held: Mutex<HashSet<String>>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate another worker holding the lease.
    pub fn force_hold(&self, key: &str) {
        self.held.lock().unwrap().insert(key.to_string());
    }
}

#[async_trait]
impl LeaseLock for MemoryLock {
    async fn try_acquire(&self, key: &str, _ttl: Duration) -> Result<bool> {
        Ok(self.held.lock().unwrap().insert(key.to_string()))
    }

    async fn release(&self, key: &str) -> Result<()> {
        self.held.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Records fired signals.
#[derive(Default)]
pub struct RecordingSignals {
    signals: Mutex<Vec<Signal>>,
}

impl RecordingSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fired(&self) -> Vec<Signal> {
        self.signals.lock().unwrap().clone()
    }
}

#[async_trait]
impl SignalBus for RecordingSignals {
    async fn fire(&self, signal: Signal) -> Result<()> {
        self.signals.lock().unwrap().push(signal);
        Ok(())
    }

    async fn subscribe(&self, _pattern: &str) -> Result<SignalStream> {
        Ok(Box::pin(futures::stream::empty()))
    }
}

/// Serves a fixed set of historical durations.
pub struct FixedTestStats {
    stats: TestStats,
}

impl FixedTestStats {
    pub fn new(stats: TestStats) -> Self {
        Self { stats }
    }
}

#[async_trait]
impl TestStatsProvider for FixedTestStats {
    async fn durations(&self, _project_id: ProjectId) -> Result<TestStats> {
        Ok(self.stats.clone())
    }
}

/// All ports wired to in-memory implementations, plus the engine context
/// built over them.
pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub queue: Arc<RecordingQueue>,
    pub locks: Arc<MemoryLock>,
    pub signals: Arc<RecordingSignals>,
    pub ctx: EngineContext,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_parts(EngineConfig::default(), TestStats::default())
    }

    pub fn with_stats(stats: TestStats) -> Self {
        Self::with_parts(EngineConfig::default(), stats)
    }

    pub fn with_parts(config: EngineConfig, stats: TestStats) -> Self {
        crate::init_test_logging();

        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(RecordingQueue::new());
        let locks = Arc::new(MemoryLock::new());
        let signals = Arc::new(RecordingSignals::new());

        let ctx = EngineContext {
            builds: store.clone(),
            jobs: store.clone(),
            phases: store.clone(),
            steps: store.clone(),
            commands: store.clone(),
            tasks: store.clone(),
            failures: store.clone(),
            queue: queue.clone(),
            locks: locks.clone(),
            signals: signals.clone(),
            test_stats: Arc::new(FixedTestStats::new(stats)),
            config,
        };

        Self {
            store,
            queue,
            locks,
            signals,
            ctx,
        }
    }

    /// Deliver queued tasks until the queue stays empty, like the worker
    /// pool would. Panics if the system does not settle within `max_rounds`.
    pub async fn run_until_idle(&self, runner: &TaskRunner, max_rounds: usize) {
        for _ in 0..max_rounds {
            let batch = self.queue.drain();
            if batch.is_empty() {
                return;
            }
            for entry in batch {
                runner
                    .process(entry.name, entry.parent_id, entry.child_id)
                    .await
                    .unwrap();
            }
        }
        panic!("task queue did not settle within {} rounds", max_rounds);
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

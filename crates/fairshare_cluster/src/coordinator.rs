//! Per-job coordinator.
//!
//! Hands task IDs from a [`WorkSource`] to registered processors, records
//! outcomes in the [`TaskJournal`], and launches processors on the hosts
//! the controller assigns. When the source drains the coordinator drops
//! its priority to zero, keeps serving until every processor has gone,
//! then cancels its shutdown token.

use crate::api::{
    ControllerService, CoordinatorRegistration, CoordinatorService, CoordinatorStatus,
    PendingSummary, ProcessorPhase, ProcessorSummary,
};
use crate::journal::TaskJournal;
use crate::launcher::{LaunchCommand, LaunchError, LaunchHandle, Launcher};
use crate::ops::CoordinatorCall;
use crate::source::WorkSource;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fairshare_core::{CoreError, HostInfo, JobId, ProcessorId, TaskId};
use fairshare_rpc::{RpcServer, ServiceError, ServiceResult, TransportError};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Coordinator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Job name
    pub name: String,
    /// Address processors and the controller reach this coordinator at
    pub url: String,
    /// Controller address handed to launched processors
    pub controller_url: String,
    /// User running the job
    pub owner: String,
    /// Fair-share weight
    pub priority: f64,
    /// Explicit job ID
    pub job_id: Option<JobId>,
    /// Schedulable regardless of job ordering
    pub immediate: bool,
    /// Fixed CPU demand
    pub demand_cpu: usize,
    /// Cap on concurrent processors
    pub max_clients: usize,
    /// Failures before a first success tolerated per host
    pub max_init_errors: usize,
    /// Unacknowledged launches allowed per host
    pub max_launching: usize,
    /// Directory for the success and error logs
    pub state_dir: PathBuf,
    /// Directory for per-launch processor logs
    pub log_dir: PathBuf,
    /// Processor executable
    pub processor_program: String,
    /// Processor arguments, before the coordinator, controller and host flags
    pub processor_args: Vec<String>,
    /// Timeout for the startup CPU request in milliseconds
    pub request_timeout_ms: u64,
}

impl CoordinatorConfig {
    /// Create a coordinator config
    #[must_use]
    pub fn new(name: impl Into<String>, url: impl Into<String>, controller_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            controller_url: controller_url.into(),
            owner: String::new(),
            priority: 1.0,
            job_id: None,
            immediate: false,
            demand_cpu: 0,
            max_clients: usize::MAX,
            max_init_errors: 3,
            max_launching: 3,
            state_dir: PathBuf::from("."),
            log_dir: PathBuf::from("."),
            processor_program: "fairshare".to_string(),
            processor_args: Vec::new(),
            request_timeout_ms: 30_000,
        }
    }

    /// Set owner
    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Set priority
    #[must_use]
    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    /// Set an explicit job ID
    #[must_use]
    pub fn with_job_id(mut self, job_id: Option<JobId>) -> Self {
        self.job_id = job_id;
        self
    }

    /// Mark as immediate
    #[must_use]
    pub fn with_immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    /// Set a fixed CPU demand
    #[must_use]
    pub fn with_demand_cpu(mut self, demand_cpu: usize) -> Self {
        self.demand_cpu = demand_cpu;
        self
    }

    /// Set client cap
    #[must_use]
    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    /// Set initialization-error budget per host
    #[must_use]
    pub fn with_max_init_errors(mut self, max: usize) -> Self {
        self.max_init_errors = max;
        self
    }

    /// Set unacknowledged launch limit per host
    #[must_use]
    pub fn with_max_launching(mut self, max: usize) -> Self {
        self.max_launching = max;
        self
    }

    /// Set state directory
    #[must_use]
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    /// Set launch log directory
    #[must_use]
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    /// Set the processor command line
    #[must_use]
    pub fn with_processor(mut self, program: impl Into<String>, args: Vec<String>) -> Self {
        self.processor_program = program.into();
        self.processor_args = args;
        self
    }

    /// Registration sent to the controller at `priority`
    #[must_use]
    pub fn registration(&self, priority: f64, job_id: Option<JobId>) -> CoordinatorRegistration {
        let mut registration = CoordinatorRegistration::new(&self.name, &self.url)
            .with_owner(&self.owner)
            .with_priority(priority)
            .with_immediate(self.immediate)
            .with_demand_cpu(self.demand_cpu);
        registration.job_id = job_id.or(self.job_id);
        registration
    }
}

/// Coordinator errors
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// Work source drained
    #[error("Job exhausted, no more processors needed")]
    Exhausted,

    /// Client cap reached
    #[error("Client cap reached: {current}/{max} processors")]
    ClientCap { current: usize, max: usize },

    /// CPU allocation reached
    #[error("CPU allocation reached: {current}/{allocated} processors")]
    CpuLimit { current: usize, allocated: usize },

    /// Too many unacknowledged launches on the host
    #[error("{count} launches on {host} not yet acknowledged")]
    Launching { host: String, count: usize },

    /// Host failed too many tasks before any success
    #[error("Host {host} exceeded its initialization error budget ({count} errors)")]
    InitErrors { host: String, count: usize },

    /// Launch failed
    #[error(transparent)]
    Launch(#[from] LaunchError),

    /// Controller call failed
    #[error("Controller call failed: {0}")]
    Controller(#[from] ServiceError),

    /// Serving failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Journal failure
    #[error(transparent)]
    Core(#[from] CoreError),
}

struct PendingTask {
    processor: ProcessorId,
    started_at: DateTime<Utc>,
}

#[derive(Default)]
struct ProcessorEntry {
    successes: u64,
    stop: bool,
}

struct JobState {
    source: Box<dyn WorkSource>,
    lookahead: Option<TaskId>,
    exhausted: bool,
    journal: TaskJournal,
    pending: IndexMap<TaskId, PendingTask>,
    processors: BTreeMap<ProcessorId, ProcessorEntry>,
    launching: BTreeMap<String, usize>,
    init_errors: BTreeMap<String, usize>,
    allocated_cpu: Option<usize>,
    max_clients: usize,
    priority: f64,
    job_id: Option<JobId>,
    launches: u64,
}

impl JobState {
    fn client_budget(&self) -> usize {
        self.allocated_cpu
            .map_or(self.max_clients, |a| a.min(self.max_clients))
    }

    fn init_errors(&self, host: &str) -> usize {
        self.init_errors.get(host).copied().unwrap_or(0)
    }

    /// Next task neither completed nor pending
    async fn pull(&mut self) -> Option<TaskId> {
        loop {
            let task = match self.lookahead.take() {
                Some(task) => task,
                None => self.source.next_task().await?,
            };
            if self.journal.is_completed(&task) || self.pending.contains_key(&task) {
                continue;
            }
            return Some(task);
        }
    }

    fn is_finished(&self) -> bool {
        self.exhausted && self.processors.is_empty() && self.pending.is_empty()
    }

    /// Record a success from the current holder of `task`
    async fn complete(&mut self, processor: &ProcessorId, task: &TaskId) -> Result<bool, CoreError> {
        if !self.take_pending(processor, task, "success") {
            return Ok(false);
        }
        self.journal.record_success(task, processor).await?;
        if let Some(entry) = self.processors.get_mut(processor) {
            entry.successes += 1;
        }
        debug!(%processor, %task, "task succeeded");
        Ok(true)
    }

    fn take_pending(&mut self, processor: &ProcessorId, task: &TaskId, outcome: &str) -> bool {
        match self.pending.get(task) {
            Some(pending) if &pending.processor == processor => {
                self.pending.shift_remove(task);
                true
            }
            Some(pending) => {
                warn!(%processor, %task, holder = %pending.processor, outcome, "report from a processor not holding the task, ignored");
                false
            }
            None => {
                warn!(%processor, %task, outcome, "report for a task that is not pending, ignored");
                false
            }
        }
    }
}

/// Coordinator of one job
pub struct Coordinator {
    config: CoordinatorConfig,
    state: Mutex<JobState>,
    controller: Arc<dyn ControllerService>,
    launcher: Arc<dyn Launcher>,
    shutdown: CancellationToken,
}

impl Coordinator {
    /// Create a coordinator, replaying the success log in `config.state_dir`
    ///
    /// # Errors
    ///
    /// Returns error if the journal cannot be opened
    pub async fn new(
        config: CoordinatorConfig,
        source: Box<dyn WorkSource>,
        controller: Arc<dyn ControllerService>,
        launcher: Arc<dyn Launcher>,
    ) -> Result<Self, CoordinatorError> {
        let journal = TaskJournal::open(&config.state_dir, &config.name).await?;
        let state = JobState {
            source,
            lookahead: None,
            exhausted: false,
            journal,
            pending: IndexMap::new(),
            processors: BTreeMap::new(),
            launching: BTreeMap::new(),
            init_errors: BTreeMap::new(),
            allocated_cpu: None,
            max_clients: config.max_clients,
            priority: config.priority,
            job_id: config.job_id,
            launches: 0,
        };
        Ok(Self {
            config,
            state: Mutex::new(state),
            controller,
            launcher,
            shutdown: CancellationToken::new(),
        })
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Token cancelled once the job is finished or shutdown is requested
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Register with the controller at the current priority
    ///
    /// # Errors
    ///
    /// Returns error if the controller cannot be reached
    pub async fn register(&self) -> Result<JobId, CoordinatorError> {
        let registration = {
            let state = self.state.lock().await;
            self.config.registration(state.priority, state.job_id)
        };
        let job_id = self.controller.register_coordinator(registration).await?;
        self.state.lock().await.job_id = Some(job_id);
        info!(job = %self.config.name, %job_id, "registered with controller");
        Ok(job_id)
    }

    /// Look ahead in the source, so a job with nothing left to do finishes
    /// without waiting for a processor to ask
    pub async fn prime(&self) {
        let mut state = self.state.lock().await;
        match state.pull().await {
            Some(task) => state.lookahead = Some(task),
            None => {
                info!(job = %self.config.name, completed = state.journal.completed_count(), "no tasks left to run");
                state.exhausted = true;
                state.priority = 0.0;
                if state.is_finished() {
                    self.shutdown.cancel();
                }
            }
        }
    }

    /// Launch a processor on `host` unless a limit forbids it
    ///
    /// # Errors
    ///
    /// Returns the limit that refused the launch, or the launch failure
    pub async fn launch_worker(&self, host: &HostInfo) -> Result<LaunchHandle, CoordinatorError> {
        let sequence = {
            let mut state = self.state.lock().await;
            if state.exhausted {
                return Err(CoordinatorError::Exhausted);
            }
            let current = state.processors.len() + state.launching.values().sum::<usize>();
            if current >= state.max_clients {
                return Err(CoordinatorError::ClientCap {
                    current,
                    max: state.max_clients,
                });
            }
            if let Some(allocated) = state.allocated_cpu {
                if current >= allocated {
                    return Err(CoordinatorError::CpuLimit { current, allocated });
                }
            }
            let launching = state.launching.get(&host.name).copied().unwrap_or(0);
            if launching >= self.config.max_launching {
                return Err(CoordinatorError::Launching {
                    host: host.name.clone(),
                    count: launching,
                });
            }
            let errors = state.init_errors(&host.name);
            if errors > self.config.max_init_errors {
                return Err(CoordinatorError::InitErrors {
                    host: host.name.clone(),
                    count: errors,
                });
            }
            *state.launching.entry(host.name.clone()).or_default() += 1;
            state.launches += 1;
            state.launches
        };

        let command = self.launch_command(host, sequence);
        match self.launcher.launch(host, &command).await {
            Ok(handle) => Ok(handle),
            Err(err) => {
                let mut state = self.state.lock().await;
                if let Some(count) = state.launching.get_mut(&host.name) {
                    *count = count.saturating_sub(1);
                }
                Err(err.into())
            }
        }
    }

    fn launch_command(&self, host: &HostInfo, sequence: u64) -> LaunchCommand {
        let log = self
            .config
            .log_dir
            .join(format!("{}_{}_{}.log", self.config.name, host.name, sequence));
        LaunchCommand::new(&self.config.processor_program, log)
            .args(self.config.processor_args.iter().cloned())
            .args([
                "--coordinator-url",
                self.config.url.as_str(),
                "--controller-url",
                self.config.controller_url.as_str(),
                "--host",
                host.name.as_str(),
            ])
    }

    fn reregister_in_background(&self, registration: CoordinatorRegistration) {
        let controller = Arc::clone(&self.controller);
        tokio::spawn(async move {
            let name = registration.name.clone();
            if let Err(err) = controller.register_coordinator(registration).await {
                warn!(job = %name, error = %err, "re-registration at zero priority failed");
            }
        });
    }

    /// Serve RPC on `listener` until the job finishes or shutdown is
    /// requested, then unregister from the controller
    ///
    /// # Errors
    ///
    /// Returns error if no agent is available for launches, registration
    /// fails, or the listener fails
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<(), CoordinatorError> {
        self.launcher.preflight()?;
        self.prime().await;
        self.register().await?;

        let controller = Arc::clone(&self.controller);
        let name = self.config.name.clone();
        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, controller.request_cpus(name.clone())).await {
                Ok(Ok(true)) => debug!(job = %name, "CPUs requested"),
                Ok(Ok(false)) => warn!(job = %name, "controller does not know this job"),
                Ok(Err(err)) => warn!(job = %name, error = %err, "CPU request failed"),
                Err(_) => warn!(job = %name, "CPU request timed out"),
            }
        });

        let label = format!("coordinator {}", self.config.name);
        let service: Arc<dyn CoordinatorService> = self.clone();
        let served = RpcServer::<CoordinatorCall>::with_shutdown(label, service, self.shutdown.clone())
            .serve(listener)
            .await;

        match self.controller.unregister_coordinator(self.config.name.clone()).await {
            Ok(_) => info!(job = %self.config.name, "unregistered from controller"),
            Err(err) => warn!(job = %self.config.name, error = %err, "unregister from controller failed"),
        }
        Ok(served?)
    }
}

#[async_trait]
impl CoordinatorService for Coordinator {
    async fn register_processor(&self, processor: ProcessorId) -> ServiceResult<String> {
        let mut state = self.state.lock().await;
        if let Some(count) = state.launching.get_mut(&processor.host) {
            *count = count.saturating_sub(1);
        }
        state.processors.entry(processor.clone()).or_default();
        info!(job = %self.config.name, %processor, processors = state.processors.len(), "processor registered");
        Ok(self.config.name.clone())
    }

    async fn unregister_processor(&self, processor: ProcessorId) -> ServiceResult<bool> {
        let mut state = self.state.lock().await;
        let found = state.processors.remove(&processor).is_some();
        let abandoned: Vec<TaskId> = state
            .pending
            .iter()
            .filter(|(_, p)| p.processor == processor)
            .map(|(task, _)| task.clone())
            .collect();
        for task in abandoned {
            state.pending.shift_remove(&task);
            warn!(%processor, %task, "task abandoned by departing processor");
            state
                .journal
                .record_failure(&task, &processor, "abandoned: processor exited before reporting")
                .await?;
        }
        if found {
            info!(job = %self.config.name, %processor, processors = state.processors.len(), "processor unregistered");
        } else {
            warn!(job = %self.config.name, %processor, "unregister of unknown processor");
        }
        if state.is_finished() {
            info!(job = %self.config.name, "all processors gone, job finished");
            self.shutdown.cancel();
        }
        Ok(found)
    }

    async fn next(
        &self,
        processor: ProcessorId,
        last_success: Option<TaskId>,
    ) -> ServiceResult<Option<TaskId>> {
        let mut state = self.state.lock().await;
        if let Some(task) = &last_success {
            state.complete(&processor, task).await?;
        }
        if state.exhausted {
            return Ok(None);
        }
        let budget = state.client_budget();
        let processors = state.processors.len();
        let host_errors = state.init_errors(&processor.host);
        let Some(entry) = state.processors.get_mut(&processor) else {
            warn!(%processor, "task request from unregistered processor");
            return Ok(None);
        };
        if entry.stop {
            debug!(%processor, "processor flagged to stop");
            return Ok(None);
        }
        if entry.successes == 0 && host_errors > self.config.max_init_errors {
            warn!(%processor, host_errors, "host cannot initialize, withholding work");
            return Ok(None);
        }
        if processors > budget {
            entry.stop = true;
            info!(%processor, processors, budget, "over client budget, stopping processor");
            return Ok(None);
        }

        match state.pull().await {
            Some(task) => {
                state.pending.insert(
                    task.clone(),
                    PendingTask {
                        processor: processor.clone(),
                        started_at: Utc::now(),
                    },
                );
                debug!(%processor, %task, "task handed out");
                Ok(Some(task))
            }
            None => {
                state.exhausted = true;
                state.priority = 0.0;
                info!(
                    job = %self.config.name,
                    completed = state.journal.completed_count(),
                    pending = state.pending.len(),
                    "work source drained"
                );
                self.reregister_in_background(self.config.registration(0.0, state.job_id));
                Ok(None)
            }
        }
    }

    async fn report_success(&self, processor: ProcessorId, task: TaskId) -> ServiceResult<bool> {
        let mut state = self.state.lock().await;
        Ok(state.complete(&processor, &task).await?)
    }

    async fn report_failure(
        &self,
        processor: ProcessorId,
        task: TaskId,
        diagnostic: String,
    ) -> ServiceResult<bool> {
        let mut state = self.state.lock().await;
        if !state.take_pending(&processor, &task, "failure") {
            return Ok(false);
        }
        state.journal.record_failure(&task, &processor, &diagnostic).await?;
        let initializing = state
            .processors
            .get(&processor)
            .is_some_and(|entry| entry.successes == 0);
        if initializing {
            let errors = state.init_errors.entry(processor.host.clone()).or_default();
            *errors += 1;
            warn!(%processor, %task, init_errors = *errors, "task failed before first success");
        } else {
            warn!(%processor, %task, "task failed");
        }
        Ok(true)
    }

    async fn start_processors(
        &self,
        allocated_cpu: usize,
        hosts: Vec<HostInfo>,
    ) -> ServiceResult<usize> {
        self.state.lock().await.allocated_cpu = Some(allocated_cpu);
        info!(job = %self.config.name, allocated_cpu, hosts = hosts.len(), "allocation received");
        let mut launched = 0;
        for host in &hosts {
            match self.launch_worker(host).await {
                Ok(_) => launched += 1,
                Err(err) => debug!(host = %host.name, reason = %err, "launch refused"),
            }
        }
        Ok(launched)
    }

    async fn stop_processor(&self, processor: ProcessorId) -> ServiceResult<bool> {
        let mut state = self.state.lock().await;
        match state.processors.get_mut(&processor) {
            Some(entry) => {
                entry.stop = true;
                info!(%processor, "processor will stop at its next request");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_max_clients(&self, max_clients: usize) -> ServiceResult<bool> {
        self.state.lock().await.max_clients = max_clients;
        info!(job = %self.config.name, max_clients, "client cap set");
        Ok(true)
    }

    async fn status(&self) -> ServiceResult<CoordinatorStatus> {
        let state = self.state.lock().await;
        Ok(CoordinatorStatus {
            name: self.config.name.clone(),
            priority: state.priority,
            job_id: state.job_id,
            allocated_cpu: state.allocated_cpu,
            max_clients: state.max_clients,
            exhausted: state.exhausted,
            completed: state.journal.completed_count(),
            processors: state
                .processors
                .iter()
                .map(|(id, entry)| ProcessorSummary {
                    id: id.clone(),
                    phase: if entry.successes == 0 {
                        ProcessorPhase::Initializing
                    } else {
                        ProcessorPhase::Active
                    },
                    successes: entry.successes,
                    stopping: entry.stop,
                })
                .collect(),
            pending: state
                .pending
                .iter()
                .map(|(task, p)| PendingSummary {
                    task: task.clone(),
                    processor: p.processor.clone(),
                    started_at: p.started_at,
                })
                .collect(),
            launching: state.launching.clone(),
            init_errors: state.init_errors.clone(),
        })
    }

    async fn shutdown(&self) -> ServiceResult<bool> {
        Err(ServiceError::terminate("coordinator shutdown requested"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{ControllerConfig, ResourceController};
    use crate::rules::RuleStore;
    use crate::source::ListSource;
    use crate::testing::{FakeLauncher, RecordingConnector, journal_lines};
    use fairshare_core::HostTable;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        controller: Arc<ResourceController>,
        launcher: FakeLauncher,
    }

    impl Fixture {
        fn new() -> Self {
            let mut hosts = HostTable::new();
            hosts.set(HostInfo::new("node1", 2.0));
            Self {
                dir: tempfile::tempdir().unwrap(),
                controller: Arc::new(ResourceController::new(
                    ControllerConfig::new("test"),
                    hosts,
                    RuleStore::in_memory(),
                    Arc::new(RecordingConnector::default()),
                )),
                launcher: FakeLauncher::default(),
            }
        }

        fn config(&self) -> CoordinatorConfig {
            CoordinatorConfig::new("job", "head:5001", "head:5000")
                .with_state_dir(self.dir.path())
                .with_log_dir(self.dir.path())
        }

        async fn coordinator(&self, config: CoordinatorConfig, tasks: &[&str]) -> Coordinator {
            Coordinator::new(
                config,
                Box::new(ListSource::new(tasks.iter().copied())),
                self.controller.clone(),
                Arc::new(self.launcher.clone()),
            )
            .await
            .unwrap()
        }
    }

    fn worker(pid: u32) -> ProcessorId {
        ProcessorId::new("node1", pid)
    }

    async fn take(coordinator: &Coordinator, p: &ProcessorId, last: Option<&TaskId>) -> Option<TaskId> {
        coordinator.next(p.clone(), last.cloned()).await.unwrap()
    }

    #[tokio::test]
    async fn test_restart_skips_completed_tasks() {
        let fx = Fixture::new();
        std::fs::write(
            fx.dir.path().join("job.success"),
            "\"1\"\tnode1:9\n3\tnode1:9\n5\tnode1:9\n",
        )
        .unwrap();
        let coordinator = fx.coordinator(fx.config(), &["1", "2", "3", "4", "5"]).await;
        let p = worker(1);
        coordinator.register_processor(p.clone()).await.unwrap();

        let mut issued = Vec::new();
        let mut last = None;
        while let Some(task) = take(&coordinator, &p, last.as_ref()).await {
            issued.push(task.as_str().to_string());
            last = Some(task);
        }
        assert_eq!(issued, vec!["2", "4"]);
        assert_eq!(coordinator.status().await.unwrap().completed, 5);
    }

    #[tokio::test]
    async fn test_each_task_has_one_holder() {
        let fx = Fixture::new();
        let coordinator = fx.coordinator(fx.config(), &["a", "b", "c"]).await;
        let (p1, p2) = (worker(1), worker(2));
        coordinator.register_processor(p1.clone()).await.unwrap();
        coordinator.register_processor(p2.clone()).await.unwrap();

        let a = take(&coordinator, &p1, None).await.unwrap();
        let b = take(&coordinator, &p2, None).await.unwrap();
        assert_ne!(a, b);

        // Only the holder can clear a pending task
        assert!(!coordinator.report_success(p2.clone(), a.clone()).await.unwrap());
        let status = coordinator.status().await.unwrap();
        assert_eq!(status.pending.len(), 2);
        assert_eq!(status.pending[0].processor, p1);

        assert!(coordinator.report_success(p1.clone(), a.clone()).await.unwrap());
        assert!(!coordinator.report_success(p1, a).await.unwrap());
        assert_eq!(coordinator.status().await.unwrap().pending.len(), 1);
    }

    #[tokio::test]
    async fn test_reports_for_unknown_tasks_are_dropped() {
        let fx = Fixture::new();
        let coordinator = fx.coordinator(fx.config(), &["a"]).await;
        let p = worker(1);
        coordinator.register_processor(p.clone()).await.unwrap();

        let ghost = TaskId::from("never-issued");
        assert!(!coordinator.report_success(p.clone(), ghost.clone()).await.unwrap());
        assert!(
            !coordinator
                .report_failure(p.clone(), ghost.clone(), "boom".to_string())
                .await
                .unwrap()
        );
        // A stale last_success does not stop the next hand-out
        assert_eq!(take(&coordinator, &p, Some(&ghost)).await, Some(TaskId::from("a")));
    }

    #[tokio::test]
    async fn test_failures_logged_and_counted_before_first_success() {
        let fx = Fixture::new();
        let config = fx.config().with_max_init_errors(1);
        let coordinator = fx.coordinator(config, &["a", "b", "c", "d"]).await;
        let p = worker(1);
        coordinator.register_processor(p.clone()).await.unwrap();

        for _ in 0..2 {
            let task = take(&coordinator, &p, None).await.unwrap();
            coordinator
                .report_failure(p.clone(), task, "segfault\nin main".to_string())
                .await
                .unwrap();
        }
        let status = coordinator.status().await.unwrap();
        assert_eq!(status.init_errors["node1"], 2);

        // Budget exceeded and still no success: no more work, no more launches
        assert_eq!(take(&coordinator, &p, None).await, None);
        let err = coordinator
            .launch_worker(&HostInfo::new("node1", 2.0))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::InitErrors { count: 2, .. }));

        let errors = journal_lines(&fx.dir.path().join("job.error"));
        assert_eq!(errors.len(), 2);
    }

    #[tokio::test]
    async fn test_failures_after_success_do_not_count() {
        let fx = Fixture::new();
        let coordinator = fx.coordinator(fx.config(), &["a", "b", "c"]).await;
        let p = worker(1);
        coordinator.register_processor(p.clone()).await.unwrap();

        let a = take(&coordinator, &p, None).await.unwrap();
        let b = take(&coordinator, &p, Some(&a)).await.unwrap();
        coordinator.report_failure(p.clone(), b, "bad input".to_string()).await.unwrap();
        assert!(coordinator.status().await.unwrap().init_errors.is_empty());
    }

    #[tokio::test]
    async fn test_launch_limits() {
        let fx = Fixture::new();
        let config = fx.config().with_max_clients(3).with_max_launching(2);
        let coordinator = fx.coordinator(config, &["a"]).await;
        let node1 = HostInfo::new("node1", 2.0);
        let node2 = HostInfo::new("node2", 2.0);

        coordinator.launch_worker(&node1).await.unwrap();
        coordinator.launch_worker(&node1).await.unwrap();
        let err = coordinator.launch_worker(&node1).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Launching { count: 2, .. }));

        coordinator.launch_worker(&node2).await.unwrap();
        let err = coordinator.launch_worker(&node2).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::ClientCap { current: 3, max: 3 }));

        // Registration acknowledges a launch
        coordinator.register_processor(worker(1)).await.unwrap();
        let status = coordinator.status().await.unwrap();
        assert_eq!(status.launching["node1"], 1);
    }

    #[tokio::test]
    async fn test_launch_respects_allocation() {
        let fx = Fixture::new();
        let coordinator = fx.coordinator(fx.config(), &["a"]).await;
        let hosts = vec![HostInfo::new("node1", 2.0), HostInfo::new("node2", 2.0)];

        assert_eq!(coordinator.start_processors(1, hosts).await.unwrap(), 1);
        let launches = fx.launcher.launches();
        assert_eq!(launches.len(), 1);
        let (host, command) = &launches[0];
        assert_eq!(host, "node1");
        assert_eq!(
            command.args,
            vec![
                "--coordinator-url",
                "head:5001",
                "--controller-url",
                "head:5000",
                "--host",
                "node1"
            ]
        );
        assert_eq!(command.log_path, fx.dir.path().join("job_node1_1.log"));
    }

    #[tokio::test]
    async fn test_over_budget_processor_is_stopped() {
        let fx = Fixture::new();
        let coordinator = fx.coordinator(fx.config(), &["a", "b", "c"]).await;
        let (p1, p2) = (worker(1), worker(2));
        coordinator.register_processor(p1.clone()).await.unwrap();
        coordinator.register_processor(p2.clone()).await.unwrap();
        coordinator.start_processors(1, Vec::new()).await.unwrap();

        assert_eq!(take(&coordinator, &p2, None).await, None);
        let status = coordinator.status().await.unwrap();
        assert!(status.processors.iter().any(|p| p.id == p2 && p.stopping));

        // Stop flags stick even after the budget frees up
        coordinator.unregister_processor(p1).await.unwrap();
        assert_eq!(take(&coordinator, &p2, None).await, None);
    }

    #[tokio::test]
    async fn test_stop_processor_and_client_cap() {
        let fx = Fixture::new();
        let coordinator = fx.coordinator(fx.config(), &["a", "b"]).await;
        let p = worker(1);
        coordinator.register_processor(p.clone()).await.unwrap();

        assert!(coordinator.stop_processor(p.clone()).await.unwrap());
        assert!(!coordinator.stop_processor(worker(99)).await.unwrap());
        assert_eq!(take(&coordinator, &p, None).await, None);

        coordinator.set_max_clients(0).await.unwrap();
        assert_eq!(coordinator.status().await.unwrap().max_clients, 0);
    }

    #[tokio::test]
    async fn test_unregistered_processor_gets_nothing() {
        let fx = Fixture::new();
        let coordinator = fx.coordinator(fx.config(), &["a"]).await;
        assert_eq!(take(&coordinator, &worker(1), None).await, None);
    }

    #[tokio::test]
    async fn test_departing_processor_abandons_pending() {
        let fx = Fixture::new();
        let coordinator = fx.coordinator(fx.config(), &["a", "b"]).await;
        let p = worker(1);
        coordinator.register_processor(p.clone()).await.unwrap();
        let task = take(&coordinator, &p, None).await.unwrap();

        assert!(coordinator.unregister_processor(p).await.unwrap());
        assert!(coordinator.status().await.unwrap().pending.is_empty());
        let errors = std::fs::read_to_string(fx.dir.path().join("job.error")).unwrap();
        assert!(errors.starts_with(&format!("{:?}\tnode1:1\tabandoned", task.as_str())));
    }

    #[tokio::test]
    async fn test_exhaustion_flow() {
        let fx = Fixture::new();
        let coordinator = fx.coordinator(fx.config(), &["only"]).await;
        coordinator.register().await.unwrap();
        let token = coordinator.shutdown_token();
        let p = worker(1);
        coordinator.register_processor(p.clone()).await.unwrap();

        let task = take(&coordinator, &p, None).await.unwrap();
        assert_eq!(take(&coordinator, &p, Some(&task)).await, None);
        let status = coordinator.status().await.unwrap();
        assert!(status.exhausted);
        assert_eq!(status.priority, 0.0);
        assert_eq!(status.completed, 1);

        for _ in 0..100 {
            let record = fx.controller.coordinator("job").await.unwrap();
            if record.registration.priority == 0.0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(fx.controller.coordinator("job").await.unwrap().registration.priority, 0.0);

        assert!(!token.is_cancelled());
        assert!(
            matches!(
                coordinator.launch_worker(&HostInfo::new("node1", 2.0)).await,
                Err(CoordinatorError::Exhausted)
            )
        );
        coordinator.unregister_processor(p).await.unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_prime_finishes_empty_job() {
        let fx = Fixture::new();
        std::fs::write(fx.dir.path().join("job.success"), "1\tnode1:9\n").unwrap();
        let coordinator = fx.coordinator(fx.config(), &["1"]).await;
        coordinator.prime().await;
        assert!(coordinator.shutdown_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_prime_keeps_first_task() {
        let fx = Fixture::new();
        let coordinator = fx.coordinator(fx.config(), &["1", "2"]).await;
        coordinator.prime().await;
        let p = worker(1);
        coordinator.register_processor(p.clone()).await.unwrap();
        assert_eq!(take(&coordinator, &p, None).await, Some(TaskId::from("1")));
    }

    #[tokio::test]
    async fn test_run_requires_agent() {
        let fx = Fixture::new();
        let coordinator = Arc::new(
            Coordinator::new(
                fx.config(),
                Box::new(ListSource::new(["a"])),
                fx.controller.clone(),
                Arc::new(FakeLauncher::without_agent()),
            )
            .await
            .unwrap(),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let err = coordinator.run(listener).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Launch(LaunchError::AgentUnavailable { .. })));
    }
}

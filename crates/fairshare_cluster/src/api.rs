//! Service interfaces and wire types shared by the three tiers.
//!
//! Each server's callable surface is a trait here. The controller and the
//! coordinator implement them in-process; [`crate::client`] implements them
//! over HTTP, so every caller only ever sees the trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fairshare_core::{HostInfo, JobId, ProcessorId, TaskId};
use fairshare_rpc::ServiceResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// What a coordinator tells the controller about itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorRegistration {
    /// Job name, unique per controller
    pub name: String,
    /// Address the coordinator serves RPC on
    pub url: String,
    /// User running the job
    pub owner: String,
    /// Fair-share weight; zero stops CPU requests
    pub priority: f64,
    /// Explicit job ID, or `None` to have the controller assign one
    pub job_id: Option<JobId>,
    /// Schedulable regardless of job ordering
    pub immediate: bool,
    /// Fixed CPU demand; non-zero bypasses priority shares
    pub demand_cpu: usize,
}

impl CoordinatorRegistration {
    /// Create a registration with priority 1.0
    #[must_use]
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            owner: String::new(),
            priority: 1.0,
            job_id: None,
            immediate: false,
            demand_cpu: 0,
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
    pub fn with_job_id(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
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
}

/// Recipe for materializing a shared artifact on a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRule {
    /// Path the artifact is materialized at
    pub target: String,
    /// Shell command that builds the artifact
    pub command: String,
}

impl ResourceRule {
    /// Create a rule
    #[must_use]
    pub fn new(target: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            command: command.into(),
        }
    }
}

/// Answer to a resource lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResourceStatus {
    /// Already materialized on this host
    Ready {
        /// Resolved path
        path: String,
    },
    /// Nobody is building it; the caller should acquire the rule
    NeedsBuild,
    /// Another process is building it; retry later
    Wait,
}

/// Answer to a rule acquisition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RuleGrant {
    /// The caller now holds the lock and must build the artifact
    Granted {
        /// Build specification
        rule: ResourceRule,
    },
    /// Another process holds the lock; retry later
    Wait,
    /// No rule registered under this key
    NotFound,
}

/// Controller view of one coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorSummary {
    /// Registration data
    pub registration: CoordinatorRegistration,
    /// Job ID in effect
    pub job_id: JobId,
    /// Whether the last rebalance found it runnable
    pub runnable: bool,
    /// CPUs allocated by the last rebalance
    pub allocated_cpu: usize,
    /// Processors registered under this coordinator
    pub processors: Vec<ProcessorId>,
    /// Hosts assigned but not yet confirmed by a processor
    pub pending_assignments: Vec<String>,
}

/// One held resource lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSummary {
    /// Host the artifact is built on
    pub host: String,
    /// Resource key
    pub key: String,
    /// Pid of the builder holding the lock
    pub pid: u32,
}

/// Full controller state for administration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerStatus {
    /// Capacity multiplier
    pub throttle: f64,
    /// Host table
    pub hosts: Vec<HostInfo>,
    /// Last reported load per host
    pub loads: BTreeMap<String, f64>,
    /// Registered coordinators
    pub coordinators: Vec<CoordinatorSummary>,
    /// Resource rules by key
    pub rules: BTreeMap<String, ResourceRule>,
    /// Resolved resources, host -> key -> path
    pub resources: BTreeMap<String, BTreeMap<String, String>>,
    /// Held locks
    pub locks: Vec<LockSummary>,
}

/// Lifecycle phase of a registered processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorPhase {
    /// Registered, no task has succeeded yet
    Initializing,
    /// At least one task succeeded
    Active,
}

/// Coordinator view of one processor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorSummary {
    /// Processor ID
    pub id: ProcessorId,
    /// Lifecycle phase
    pub phase: ProcessorPhase,
    /// Tasks completed successfully
    pub successes: u64,
    /// Flagged to stop at its next request
    pub stopping: bool,
}

/// One task currently handed out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSummary {
    /// Task ID
    pub task: TaskId,
    /// Processor working on it
    pub processor: ProcessorId,
    /// When it was handed out
    pub started_at: DateTime<Utc>,
}

/// Full coordinator state for administration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorStatus {
    /// Job name
    pub name: String,
    /// Current priority
    pub priority: f64,
    /// Job ID assigned by the controller
    pub job_id: Option<JobId>,
    /// CPUs allocated by the controller, once known
    pub allocated_cpu: Option<usize>,
    /// Client cap
    pub max_clients: usize,
    /// Whether the work source is drained
    pub exhausted: bool,
    /// Tasks recorded as completed, including previous runs
    pub completed: usize,
    /// Registered processors
    pub processors: Vec<ProcessorSummary>,
    /// Tasks handed out and not yet reported
    pub pending: Vec<PendingSummary>,
    /// Unacknowledged launches per host
    pub launching: BTreeMap<String, usize>,
    /// Initialization errors per host
    pub init_errors: BTreeMap<String, usize>,
}

/// Operations served by the resource controller
#[async_trait]
pub trait ControllerService: Send + Sync {
    /// Register or update a coordinator; returns its job ID
    async fn register_coordinator(&self, registration: CoordinatorRegistration)
    -> ServiceResult<JobId>;

    /// Forget a coordinator
    async fn unregister_coordinator(&self, name: String) -> ServiceResult<bool>;

    /// Ask for an immediate rebalance on behalf of a coordinator
    async fn request_cpus(&self, name: String) -> ServiceResult<bool>;

    /// Track a processor started for a coordinator
    async fn register_processor(
        &self,
        coordinator: String,
        processor: ProcessorId,
    ) -> ServiceResult<bool>;

    /// Stop tracking a processor and release any locks it still holds
    async fn unregister_processor(&self, processor: ProcessorId) -> ServiceResult<bool>;

    /// Record a host load; `false` asks the processor to exit
    async fn report_load(&self, processor: ProcessorId, load: f64) -> ServiceResult<bool>;

    /// Look up a shared artifact on a host
    async fn get_resource(&self, host: String, key: String) -> ServiceResult<ResourceStatus>;

    /// Try to lock a rule for building on the processor's host
    async fn acquire_rule(&self, processor: ProcessorId, key: String) -> ServiceResult<RuleGrant>;

    /// Unlock a rule, recording the built path when the build succeeded
    async fn release_rule(
        &self,
        processor: ProcessorId,
        key: String,
        path: Option<String>,
    ) -> ServiceResult<bool>;

    /// Define or replace a rule
    async fn set_rule(&self, key: String, rule: ResourceRule) -> ServiceResult<bool>;

    /// Delete a rule
    async fn del_rule(&self, key: String) -> ServiceResult<bool>;

    /// Add or update a host
    async fn set_host_info(&self, info: HostInfo) -> ServiceResult<bool>;

    /// Look up a host
    async fn get_host_info(&self, host: String) -> ServiceResult<Option<HostInfo>>;

    /// Set the capacity multiplier
    async fn set_throttle(&self, throttle: f64) -> ServiceResult<bool>;

    /// Forcibly clear a lock
    async fn del_lock(&self, host: String, key: String) -> ServiceResult<bool>;

    /// Zero stale loads on hosts without tracked processors
    async fn retry_unused_hosts(&self) -> ServiceResult<usize>;

    /// Full state dump
    async fn status(&self) -> ServiceResult<ControllerStatus>;

    /// Stop the controller process
    async fn shutdown(&self) -> ServiceResult<bool>;
}

/// Operations served by a job coordinator
#[async_trait]
pub trait CoordinatorService: Send + Sync {
    /// Register a processor; returns the job name
    async fn register_processor(&self, processor: ProcessorId) -> ServiceResult<String>;

    /// Deregister a processor
    async fn unregister_processor(&self, processor: ProcessorId) -> ServiceResult<bool>;

    /// Record the last success, if any, and hand out the next task
    async fn next(
        &self,
        processor: ProcessorId,
        last_success: Option<TaskId>,
    ) -> ServiceResult<Option<TaskId>>;

    /// Record a successful task
    async fn report_success(&self, processor: ProcessorId, task: TaskId) -> ServiceResult<bool>;

    /// Record a failed task
    async fn report_failure(
        &self,
        processor: ProcessorId,
        task: TaskId,
        diagnostic: String,
    ) -> ServiceResult<bool>;

    /// Accept a new allocation and launch workers on the assigned hosts
    async fn start_processors(
        &self,
        allocated_cpu: usize,
        hosts: Vec<HostInfo>,
    ) -> ServiceResult<usize>;

    /// Flag a processor to stop at its next request
    async fn stop_processor(&self, processor: ProcessorId) -> ServiceResult<bool>;

    /// Change the client cap
    async fn set_max_clients(&self, max_clients: usize) -> ServiceResult<bool>;

    /// Full state dump
    async fn status(&self) -> ServiceResult<CoordinatorStatus>;

    /// Stop the coordinator process
    async fn shutdown(&self) -> ServiceResult<bool>;
}

/// Resolves coordinator addresses to callable services
#[async_trait]
pub trait CoordinatorConnector: Send + Sync {
    /// Service for the coordinator serving at `url`
    async fn connect(&self, url: &str) -> Arc<dyn CoordinatorService>;
}

//! Cluster-wide resource controller.
//!
//! Owns the host table and the rule/lock store, tracks every registered
//! coordinator, and periodically rebalances CPUs between them:
//!
//! 1. [`assign_shares`] decides how many CPUs each coordinator deserves.
//! 2. [`assign_slots`] turns unmet allocations into concrete host slots.
//! 3. Every coordinator whose allocation or hosts changed is told so by a
//!    push that runs on its own task, so one dead coordinator cannot hold
//!    up the others.

use crate::api::{
    ControllerService, ControllerStatus, CoordinatorConnector, CoordinatorRegistration,
    CoordinatorSummary, ResourceRule, ResourceStatus, RuleGrant,
};
use crate::rules::RuleStore;
use async_trait::async_trait;
use fairshare_core::{CoreResult, HostInfo, HostTable, JobId, ProcessorId};
use fairshare_rpc::{ServiceError, ServiceResult};
use indexmap::IndexMap;
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Controller name; prefixes the state files
    pub name: String,
    /// Directory holding `<name>.hosts`, `<name>.rules` and `<name>.rsrc`
    pub state_dir: PathBuf,
    /// Load allowed above a host's max load before processors are told to exit
    pub overload_margin: f64,
    /// Seconds between periodic rebalances
    pub rebalance_interval_secs: u64,
    /// Capacity multiplier applied to the host table
    pub throttle: f64,
    /// Seconds before a coordinator may be sent new hosts again
    pub min_relaunch_interval_secs: u64,
    /// Seconds after which an unconfirmed host assignment is dropped
    pub assignment_expiry_secs: u64,
    /// Timeout for one allocation push in milliseconds
    pub push_timeout_ms: u64,
}

impl ControllerConfig {
    /// Create a controller config
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state_dir: PathBuf::from("."),
            overload_margin: 0.6,
            rebalance_interval_secs: 1200,
            throttle: 1.0,
            min_relaunch_interval_secs: 60,
            assignment_expiry_secs: 300,
            push_timeout_ms: 10_000,
        }
    }

    /// Set state directory
    #[must_use]
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    /// Set overload margin
    #[must_use]
    pub fn with_overload_margin(mut self, margin: f64) -> Self {
        self.overload_margin = margin;
        self
    }

    /// Set rebalance interval
    #[must_use]
    pub fn with_rebalance_interval(mut self, secs: u64) -> Self {
        self.rebalance_interval_secs = secs;
        self
    }

    /// Set initial throttle
    #[must_use]
    pub fn with_throttle(mut self, throttle: f64) -> Self {
        self.throttle = throttle;
        self
    }

    /// Set minimum relaunch interval
    #[must_use]
    pub fn with_min_relaunch_interval(mut self, secs: u64) -> Self {
        self.min_relaunch_interval_secs = secs;
        self
    }

    /// Set allocation push timeout
    #[must_use]
    pub fn with_push_timeout(mut self, ms: u64) -> Self {
        self.push_timeout_ms = ms;
        self
    }

    /// Host table file
    #[must_use]
    pub fn hosts_path(&self) -> PathBuf {
        self.state_dir.join(format!("{}.hosts", self.name))
    }

    /// Rule table file
    #[must_use]
    pub fn rules_path(&self) -> PathBuf {
        self.state_dir.join(format!("{}.rules", self.name))
    }

    /// Resolved resource file
    #[must_use]
    pub fn resources_path(&self) -> PathBuf {
        self.state_dir.join(format!("{}.rsrc", self.name))
    }

    fn rebalance_interval(&self) -> Duration {
        Duration::from_secs(self.rebalance_interval_secs)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::new("fairshare")
    }
}

/// A host handed to a coordinator and not yet confirmed by a processor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAssignment {
    /// Assigned host
    pub host: String,
    /// When the assignment was made
    pub issued_at: Instant,
}

/// Controller-side bookkeeping for one coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorRecord {
    /// Registration data
    pub registration: CoordinatorRegistration,
    /// Job ID in effect
    pub job_id: JobId,
    /// Whether the last rebalance found it runnable
    pub runnable: bool,
    /// CPUs allocated by the last rebalance
    pub allocated_cpu: usize,
    /// Registered processors
    pub processors: BTreeSet<ProcessorId>,
    /// Hosts assigned but not yet confirmed
    pub pending_assignments: Vec<PendingAssignment>,
    last_launch: Option<Instant>,
    last_pushed_cpu: Option<usize>,
}

impl CoordinatorRecord {
    /// Create a record for a fresh registration
    #[must_use]
    pub fn new(registration: CoordinatorRegistration, job_id: JobId) -> Self {
        Self {
            registration,
            job_id,
            runnable: false,
            allocated_cpu: 0,
            processors: BTreeSet::new(),
            pending_assignments: Vec::new(),
            last_launch: None,
            last_pushed_cpu: None,
        }
    }

    fn current_cpu(&self) -> usize {
        self.processors.len() + self.pending_assignments.len()
    }

    fn summary(&self) -> CoordinatorSummary {
        CoordinatorSummary {
            registration: self.registration.clone(),
            job_id: self.job_id,
            runnable: self.runnable,
            allocated_cpu: self.allocated_cpu,
            processors: self.processors.iter().cloned().collect(),
            pending_assignments: self
                .pending_assignments
                .iter()
                .map(|a| a.host.clone())
                .collect(),
        }
    }
}

/// Compute runnable flags and CPU allocations
///
/// The oldest job (lowest job ID among records with positive priority) has
/// the floor. Fixed-demand records always get exactly their demand, which
/// is taken off the top of `raw_capacity`; the remainder is split among the
/// runnable priority records in proportion to priority. Returns the
/// capacity left for priority shares.
pub fn assign_shares(coordinators: &mut IndexMap<String, CoordinatorRecord>, raw_capacity: f64) -> f64 {
    let floor_job = coordinators
        .values()
        .filter(|r| r.registration.priority > 0.0)
        .map(|r| r.job_id)
        .min();
    let demand: usize = coordinators.values().map(|r| r.registration.demand_cpu).sum();
    let capacity = (raw_capacity - demand as f64).max(0.0);

    for record in coordinators.values_mut() {
        record.runnable = record.registration.demand_cpu > 0
            || record.registration.immediate
            || Some(record.job_id) == floor_job;
    }

    let total_priority: f64 = coordinators
        .values()
        .filter(|r| r.runnable && r.registration.demand_cpu == 0)
        .map(|r| r.registration.priority.max(0.0))
        .sum();

    for record in coordinators.values_mut() {
        let reg = &record.registration;
        record.allocated_cpu = if !record.runnable {
            0
        } else if reg.demand_cpu > 0 {
            reg.demand_cpu
        } else if total_priority > 0.0 {
            (capacity * reg.priority.max(0.0) / total_priority).floor() as usize
        } else {
            0
        };
    }
    capacity
}

/// Slot assignment tuning
#[derive(Debug, Clone, Copy)]
pub struct SlotPolicy {
    /// Load allowed above a host's max load
    pub overload_margin: f64,
    /// Minimum time between host pushes to one coordinator
    pub min_relaunch_interval: Duration,
    /// Age at which unconfirmed assignments are dropped
    pub assignment_expiry: Duration,
}

/// Hand free host slots to runnable coordinators below their allocation
///
/// Returns the hosts newly assigned to each coordinator.
pub fn assign_slots<R: Rng + ?Sized>(
    coordinators: &mut IndexMap<String, CoordinatorRecord>,
    hosts: &HostTable,
    loads: &HashMap<String, f64>,
    policy: SlotPolicy,
    now: Instant,
    rng: &mut R,
) -> BTreeMap<String, Vec<HostInfo>> {
    let mut live: HashMap<&str, usize> = HashMap::new();
    for record in coordinators.values_mut() {
        record
            .pending_assignments
            .retain(|a| now.duration_since(a.issued_at) < policy.assignment_expiry);
    }
    for record in coordinators.values() {
        for processor in &record.processors {
            *live.entry(processor.host.as_str()).or_default() += 1;
        }
        for assignment in &record.pending_assignments {
            *live.entry(assignment.host.as_str()).or_default() += 1;
        }
    }

    let mut slots: Vec<&HostInfo> = Vec::new();
    for host in hosts.iter() {
        let reported = loads.get(&host.name).copied().unwrap_or(0.0);
        let occupied = live.get(host.name.as_str()).copied().unwrap_or(0) as f64;
        let free = (host.max_load + policy.overload_margin - reported.max(occupied)).floor();
        if free >= 1.0 {
            slots.extend(std::iter::repeat_n(host, free as usize));
        }
    }
    if slots.is_empty() {
        return BTreeMap::new();
    }

    let mut units: Vec<String> = Vec::new();
    for (name, record) in coordinators.iter() {
        if !record.runnable {
            continue;
        }
        if let Some(last) = record.last_launch {
            if now.duration_since(last) < policy.min_relaunch_interval {
                debug!(coordinator = %name, "within relaunch interval, skipping");
                continue;
            }
        }
        let deficit = record.allocated_cpu.saturating_sub(record.current_cpu());
        units.extend(std::iter::repeat_n(name.clone(), deficit));
    }
    units.shuffle(rng);

    let mut assigned: BTreeMap<String, Vec<HostInfo>> = BTreeMap::new();
    for (name, host) in units.into_iter().zip(slots) {
        if let Some(record) = coordinators.get_mut(&name) {
            record.pending_assignments.push(PendingAssignment {
                host: host.name.clone(),
                issued_at: now,
            });
            assigned.entry(name).or_default().push(host.clone());
        }
    }
    for name in assigned.keys() {
        if let Some(record) = coordinators.get_mut(name) {
            record.last_launch = Some(now);
        }
    }
    assigned
}

/// Outcome of one rebalance pass
#[derive(Debug, Default)]
pub struct Rebalance {
    /// CPUs allocated per coordinator
    pub allocations: BTreeMap<String, usize>,
    /// Hosts newly assigned per coordinator
    pub assignments: BTreeMap<String, Vec<String>>,
    pushes: Vec<JoinHandle<()>>,
}

impl Rebalance {
    /// Number of coordinators being notified
    #[must_use]
    pub fn push_count(&self) -> usize {
        self.pushes.len()
    }

    /// Wait for every allocation push to finish or time out
    pub async fn settle(self) {
        for result in futures::future::join_all(self.pushes).await {
            if let Err(err) = result {
                warn!(error = %err, "allocation push task failed");
            }
        }
    }
}

struct ControllerState {
    hosts: HostTable,
    hosts_path: Option<PathBuf>,
    loads: HashMap<String, f64>,
    coordinators: IndexMap<String, CoordinatorRecord>,
    rules: RuleStore,
    throttle: f64,
    next_job_id: JobId,
    last_rebalance: Option<Instant>,
}

/// The cluster-wide resource controller
pub struct ResourceController {
    /// Configuration
    config: ControllerConfig,
    /// Everything mutated by calls
    state: RwLock<ControllerState>,
    /// Reaches coordinators for allocation pushes
    connector: Arc<dyn CoordinatorConnector>,
}

impl ResourceController {
    /// Create a controller over in-memory tables
    #[must_use]
    pub fn new(
        config: ControllerConfig,
        hosts: HostTable,
        rules: RuleStore,
        connector: Arc<dyn CoordinatorConnector>,
    ) -> Self {
        Self::with_state(config, hosts, None, rules, connector)
    }

    fn with_state(
        config: ControllerConfig,
        hosts: HostTable,
        hosts_path: Option<PathBuf>,
        rules: RuleStore,
        connector: Arc<dyn CoordinatorConnector>,
    ) -> Self {
        let throttle = config.throttle;
        Self {
            config,
            state: RwLock::new(ControllerState {
                hosts,
                hosts_path,
                loads: HashMap::new(),
                coordinators: IndexMap::new(),
                rules,
                throttle,
                next_job_id: JobId::default(),
                last_rebalance: None,
            }),
            connector,
        }
    }

    /// Create a controller backed by the state files in the config
    ///
    /// # Errors
    ///
    /// Returns error if an existing state file cannot be read
    pub fn open(config: ControllerConfig, connector: Arc<dyn CoordinatorConnector>) -> CoreResult<Self> {
        let hosts_path = config.hosts_path();
        let hosts = HostTable::load(&hosts_path)?;
        let rules = RuleStore::open(config.rules_path(), config.resources_path())?;
        info!(
            controller = %config.name,
            hosts = hosts.len(),
            capacity = hosts.total_capacity(),
            rules = rules.rules().len(),
            "controller state loaded"
        );
        Ok(Self::with_state(config, hosts, Some(hosts_path), rules, connector))
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Rebalance CPUs and push new allocations
    ///
    /// Pushes run on their own tasks; the returned [`Rebalance`] can be
    /// settled to wait for them or dropped to let them run detached.
    pub async fn load_balance(&self) -> Rebalance {
        let now = Instant::now();
        let policy = SlotPolicy {
            overload_margin: self.config.overload_margin,
            min_relaunch_interval: Duration::from_secs(self.config.min_relaunch_interval_secs),
            assignment_expiry: Duration::from_secs(self.config.assignment_expiry_secs),
        };

        let mut rebalance = Rebalance::default();
        let mut pushes = Vec::new();
        {
            let mut state = self.state.write().await;
            let state = &mut *state;
            let raw_capacity = state.throttle * state.hosts.total_capacity();
            let capacity = assign_shares(&mut state.coordinators, raw_capacity);
            let assigned = assign_slots(
                &mut state.coordinators,
                &state.hosts,
                &state.loads,
                policy,
                now,
                &mut rand::thread_rng(),
            );
            state.last_rebalance = Some(now);

            for (name, record) in state.coordinators.iter_mut() {
                rebalance.allocations.insert(name.clone(), record.allocated_cpu);
                let hosts = assigned.get(name).cloned().unwrap_or_default();
                if hosts.is_empty() && record.last_pushed_cpu == Some(record.allocated_cpu) {
                    continue;
                }
                record.last_pushed_cpu = Some(record.allocated_cpu);
                rebalance
                    .assignments
                    .insert(name.clone(), hosts.iter().map(|h| h.name.clone()).collect());
                pushes.push((record.registration.url.clone(), name.clone(), record.allocated_cpu, hosts));
            }
            debug!(capacity, coordinators = state.coordinators.len(), "shares assigned");
        }

        let timeout = Duration::from_millis(self.config.push_timeout_ms);
        for (url, name, allocated_cpu, hosts) in pushes {
            let connector = Arc::clone(&self.connector);
            rebalance.pushes.push(tokio::spawn(async move {
                let coordinator = connector.connect(&url).await;
                let launch = coordinator.start_processors(allocated_cpu, hosts);
                match tokio::time::timeout(timeout, launch).await {
                    Ok(Ok(launched)) => {
                        debug!(coordinator = %name, allocated_cpu, launched, "allocation pushed");
                    }
                    Ok(Err(err)) => {
                        warn!(coordinator = %name, %url, error = %err, "allocation push failed");
                    }
                    Err(_) => {
                        warn!(coordinator = %name, %url, "allocation push timed out");
                    }
                }
            }));
        }
        rebalance
    }

    async fn rebalance_detached(&self) {
        let rebalance = self.load_balance().await;
        debug!(pushes = rebalance.push_count(), "rebalance started");
    }

    /// Controller-side record of one coordinator
    pub async fn coordinator(&self, name: &str) -> Option<CoordinatorSummary> {
        self.state
            .read()
            .await
            .coordinators
            .get(name)
            .map(CoordinatorRecord::summary)
    }

    /// Rebalance every `rebalance_interval_secs` until `shutdown` is cancelled
    pub fn spawn_periodic(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(controller.config.rebalance_interval());
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => controller.rebalance_detached().await,
                }
            }
        })
    }
}

#[async_trait]
impl ControllerService for ResourceController {
    async fn register_coordinator(
        &self,
        registration: CoordinatorRegistration,
    ) -> ServiceResult<JobId> {
        let job_id = {
            let mut state = self.state.write().await;
            let state = &mut *state;
            let name = registration.name.clone();
            let job_id = match state.coordinators.get_mut(&name) {
                Some(record) => {
                    if let Some(job_id) = registration.job_id {
                        record.job_id = job_id;
                    }
                    record.registration = registration;
                    record.job_id
                }
                None => {
                    let job_id = registration.job_id.unwrap_or(state.next_job_id);
                    state
                        .coordinators
                        .insert(name.clone(), CoordinatorRecord::new(registration, job_id));
                    job_id
                }
            };
            if job_id >= state.next_job_id {
                state.next_job_id = job_id.next();
            }
            let record = &state.coordinators[&name];
            info!(
                coordinator = %name,
                job = %job_id,
                priority = record.registration.priority,
                demand_cpu = record.registration.demand_cpu,
                url = %record.registration.url,
                "coordinator registered"
            );
            job_id
        };
        self.rebalance_detached().await;
        Ok(job_id)
    }

    async fn unregister_coordinator(&self, name: String) -> ServiceResult<bool> {
        let removed = self.state.write().await.coordinators.shift_remove(&name);
        match removed {
            Some(record) => {
                info!(coordinator = %name, processors = record.processors.len(), "coordinator unregistered");
                self.rebalance_detached().await;
                Ok(true)
            }
            None => {
                warn!(coordinator = %name, "unregister of unknown coordinator");
                Ok(false)
            }
        }
    }

    async fn request_cpus(&self, name: String) -> ServiceResult<bool> {
        let known = self.state.read().await.coordinators.contains_key(&name);
        if !known {
            warn!(coordinator = %name, "CPU request from unknown coordinator");
            return Ok(false);
        }
        self.rebalance_detached().await;
        Ok(true)
    }

    async fn register_processor(
        &self,
        coordinator: String,
        processor: ProcessorId,
    ) -> ServiceResult<bool> {
        let mut state = self.state.write().await;
        let Some(record) = state.coordinators.get_mut(&coordinator) else {
            warn!(%coordinator, %processor, "processor registered for unknown coordinator");
            return Ok(false);
        };
        if let Some(index) = record
            .pending_assignments
            .iter()
            .position(|a| a.host == processor.host)
        {
            record.pending_assignments.remove(index);
        }
        record.processors.insert(processor.clone());
        info!(%coordinator, %processor, "processor registered");
        Ok(true)
    }

    async fn unregister_processor(&self, processor: ProcessorId) -> ServiceResult<bool> {
        let found = {
            let mut state = self.state.write().await;
            let mut found = false;
            for record in state.coordinators.values_mut() {
                found |= record.processors.remove(&processor);
            }
            state.rules.release_orphans(&processor);
            found
        };
        if found {
            info!(%processor, "processor unregistered");
            self.rebalance_detached().await;
        } else {
            warn!(%processor, "unregister of unknown processor");
        }
        Ok(found)
    }

    async fn report_load(&self, processor: ProcessorId, load: f64) -> ServiceResult<bool> {
        let (ok, due) = {
            let mut state = self.state.write().await;
            state.loads.insert(processor.host.clone(), load);
            let ok = match state.hosts.get(&processor.host) {
                Some(info) => load <= info.max_load + self.config.overload_margin,
                None => {
                    debug!(%processor, "load report from host outside the host table");
                    true
                }
            };
            let due = state
                .last_rebalance
                .is_none_or(|t| t.elapsed() >= self.config.rebalance_interval());
            (ok, due)
        };
        if !ok {
            warn!(%processor, load, "host overloaded, asking processor to exit");
        }
        if due {
            self.rebalance_detached().await;
        }
        Ok(ok)
    }

    async fn get_resource(&self, host: String, key: String) -> ServiceResult<ResourceStatus> {
        Ok(self.state.read().await.rules.get_resource(&host, &key))
    }

    async fn acquire_rule(&self, processor: ProcessorId, key: String) -> ServiceResult<RuleGrant> {
        Ok(self.state.write().await.rules.acquire(&processor, &key))
    }

    async fn release_rule(
        &self,
        processor: ProcessorId,
        key: String,
        path: Option<String>,
    ) -> ServiceResult<bool> {
        Ok(self.state.write().await.rules.release(&processor, &key, path)?)
    }

    async fn set_rule(&self, key: String, rule: ResourceRule) -> ServiceResult<bool> {
        info!(%key, target = %rule.target, "rule set");
        self.state.write().await.rules.set_rule(&key, rule)?;
        Ok(true)
    }

    async fn del_rule(&self, key: String) -> ServiceResult<bool> {
        Ok(self.state.write().await.rules.del_rule(&key)?)
    }

    async fn set_host_info(&self, info: HostInfo) -> ServiceResult<bool> {
        if !info.max_load.is_finite() || info.max_load < 0.0 {
            return Err(ServiceError::InvalidRequest(format!(
                "invalid max load {} for host {}",
                info.max_load, info.name
            )));
        }
        {
            let mut state = self.state.write().await;
            info!(host = %info.name, max_load = info.max_load, "host info set");
            state.hosts.set(info);
            if let Some(path) = &state.hosts_path {
                state.hosts.save(path)?;
            }
        }
        self.rebalance_detached().await;
        Ok(true)
    }

    async fn get_host_info(&self, host: String) -> ServiceResult<Option<HostInfo>> {
        Ok(self.state.read().await.hosts.get(&host).cloned())
    }

    async fn set_throttle(&self, throttle: f64) -> ServiceResult<bool> {
        if !throttle.is_finite() || throttle < 0.0 {
            return Err(ServiceError::InvalidRequest(format!("invalid throttle {}", throttle)));
        }
        self.state.write().await.throttle = throttle;
        info!(throttle, "throttle set");
        self.rebalance_detached().await;
        Ok(true)
    }

    async fn del_lock(&self, host: String, key: String) -> ServiceResult<bool> {
        let removed = self.state.write().await.rules.del_lock(&host, &key);
        if removed {
            warn!(%host, %key, "lock cleared by administrator");
        }
        Ok(removed)
    }

    async fn retry_unused_hosts(&self) -> ServiceResult<usize> {
        let reset = {
            let mut state = self.state.write().await;
            let state = &mut *state;
            let used: BTreeSet<&str> = state
                .coordinators
                .values()
                .flat_map(|r| r.processors.iter().map(|p| p.host.as_str()))
                .collect();
            let mut reset = 0;
            for host in state.hosts.iter() {
                if used.contains(host.name.as_str()) {
                    continue;
                }
                if let Some(load) = state.loads.get_mut(&host.name) {
                    if *load > 0.0 {
                        debug!(host = %host.name, stale_load = *load, "resetting unused host load");
                        *load = 0.0;
                        reset += 1;
                    }
                }
            }
            reset
        };
        if reset > 0 {
            info!(reset, "stale host loads cleared");
            self.rebalance_detached().await;
        }
        Ok(reset)
    }

    async fn status(&self) -> ServiceResult<ControllerStatus> {
        let state = self.state.read().await;
        Ok(ControllerStatus {
            throttle: state.throttle,
            hosts: state.hosts.iter().cloned().collect(),
            loads: state.loads.iter().map(|(h, l)| (h.clone(), *l)).collect(),
            coordinators: state.coordinators.values().map(CoordinatorRecord::summary).collect(),
            rules: state.rules.rules().clone(),
            resources: state.rules.resources().clone(),
            locks: state.rules.locks(),
        })
    }

    async fn shutdown(&self) -> ServiceResult<bool> {
        Err(ServiceError::terminate("controller shutdown requested"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingConnector;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn record(name: &str, job: u64, priority: f64) -> CoordinatorRecord {
        CoordinatorRecord::new(
            CoordinatorRegistration::new(name, format!("{name}:5001")).with_priority(priority),
            JobId::new(job),
        )
    }

    fn table(records: Vec<CoordinatorRecord>) -> IndexMap<String, CoordinatorRecord> {
        records
            .into_iter()
            .map(|r| (r.registration.name.clone(), r))
            .collect()
    }

    fn hosts(entries: &[(&str, f64)]) -> HostTable {
        let mut table = HostTable::new();
        for (name, load) in entries {
            table.set(HostInfo::new(*name, *load));
        }
        table
    }

    fn controller(host_table: HostTable) -> (ResourceController, RecordingConnector) {
        let connector = RecordingConnector::default();
        let controller = ResourceController::new(
            ControllerConfig::new("test"),
            host_table,
            RuleStore::in_memory(),
            Arc::new(connector.clone()),
        );
        (controller, connector)
    }

    const POLICY: SlotPolicy = SlotPolicy {
        overload_margin: 0.6,
        min_relaunch_interval: Duration::from_secs(60),
        assignment_expiry: Duration::from_secs(300),
    };

    #[test]
    fn test_shares_split_by_priority() {
        let mut coords = table(vec![record("a", 0, 1.0), record("b", 0, 3.0)]);
        assign_shares(&mut coords, 10.0);
        assert_eq!(coords["a"].allocated_cpu, 2);
        assert_eq!(coords["b"].allocated_cpu, 7);
    }

    #[test]
    fn test_oldest_job_has_the_floor() {
        let mut coords = table(vec![record("old", 0, 1.0), record("new", 1, 1.0)]);
        assign_shares(&mut coords, 8.0);
        assert!(coords["old"].runnable);
        assert!(!coords["new"].runnable);
        assert_eq!(coords["old"].allocated_cpu, 8);
        assert_eq!(coords["new"].allocated_cpu, 0);
    }

    #[test]
    fn test_finished_job_yields_the_floor() {
        let mut coords = table(vec![record("old", 0, 0.0), record("new", 1, 1.0)]);
        assign_shares(&mut coords, 8.0);
        assert_eq!(coords["old"].allocated_cpu, 0);
        assert_eq!(coords["new"].allocated_cpu, 8);
    }

    #[test]
    fn test_immediate_jobs_share_with_the_floor() {
        let mut late = record("late", 5, 1.0);
        late.registration.immediate = true;
        let mut coords = table(vec![record("old", 0, 1.0), late]);
        assign_shares(&mut coords, 8.0);
        assert_eq!(coords["old"].allocated_cpu, 4);
        assert_eq!(coords["late"].allocated_cpu, 4);
    }

    #[test]
    fn test_fixed_demand_comes_off_the_top() {
        let mut fixed = record("fixed", 9, 0.5);
        fixed.registration.demand_cpu = 3;
        let mut coords = table(vec![record("share", 0, 1.0), fixed]);
        let remaining = assign_shares(&mut coords, 10.0);
        assert_eq!(remaining, 7.0);
        assert_eq!(coords["fixed"].allocated_cpu, 3);
        assert!(coords["fixed"].runnable);
        assert_eq!(coords["share"].allocated_cpu, 7);
    }

    #[test]
    fn test_demand_beyond_capacity_clamps_to_zero() {
        let mut fixed = record("fixed", 0, 1.0);
        fixed.registration.demand_cpu = 20;
        let mut coords = table(vec![fixed, record("share", 0, 1.0)]);
        assert_eq!(assign_shares(&mut coords, 10.0), 0.0);
        assert_eq!(coords["fixed"].allocated_cpu, 20);
        assert_eq!(coords["share"].allocated_cpu, 0);
    }

    proptest! {
        #[test]
        fn prop_shares_never_exceed_capacity(
            capacity in 0.0f64..500.0,
            priorities in proptest::collection::vec(0.01f64..100.0, 1..8),
        ) {
            let mut coords = table(
                priorities
                    .iter()
                    .enumerate()
                    .map(|(i, p)| record(&format!("c{i}"), 0, *p))
                    .collect(),
            );
            assign_shares(&mut coords, capacity);
            let total: usize = coords.values().map(|r| r.allocated_cpu).sum();
            prop_assert!(total as f64 <= capacity);
        }
    }

    #[test]
    fn test_slots_fill_deficits() {
        let host_table = hosts(&[("node1", 2.0), ("node2", 1.0)]);
        let mut coords = table(vec![record("a", 0, 1.0)]);
        assign_shares(&mut coords, host_table.total_capacity());
        let mut rng = StdRng::seed_from_u64(7);

        let assigned = assign_slots(
            &mut coords,
            &host_table,
            &HashMap::new(),
            POLICY,
            Instant::now(),
            &mut rng,
        );
        let names: Vec<_> = assigned["a"].iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["node1", "node1", "node2"]);
        assert_eq!(coords["a"].pending_assignments.len(), 3);
    }

    #[test]
    fn test_slots_respect_reported_load() {
        let host_table = hosts(&[("node1", 2.0)]);
        let mut coords = table(vec![record("a", 0, 1.0)]);
        assign_shares(&mut coords, 2.0);
        let loads = HashMap::from([("node1".to_string(), 2.5)]);
        let mut rng = StdRng::seed_from_u64(7);

        let assigned = assign_slots(&mut coords, &host_table, &loads, POLICY, Instant::now(), &mut rng);
        assert!(assigned.is_empty());
    }

    #[test]
    fn test_slots_count_live_processors() {
        let host_table = hosts(&[("node1", 2.0)]);
        let mut a = record("a", 0, 1.0);
        a.processors.insert(ProcessorId::new("node1", 1));
        let mut coords = table(vec![a]);
        assign_shares(&mut coords, 2.0);
        let mut rng = StdRng::seed_from_u64(7);

        let assigned = assign_slots(
            &mut coords,
            &host_table,
            &HashMap::new(),
            POLICY,
            Instant::now(),
            &mut rng,
        );
        assert_eq!(assigned["a"].len(), 1);
    }

    #[test]
    fn test_relaunch_interval_defers_new_hosts() {
        let host_table = hosts(&[("node1", 4.0)]);
        let mut coords = table(vec![record("a", 0, 1.0)]);
        assign_shares(&mut coords, 4.0);
        let mut rng = StdRng::seed_from_u64(7);
        let start = Instant::now();

        let first = assign_slots(&mut coords, &host_table, &HashMap::new(), POLICY, start, &mut rng);
        assert_eq!(first["a"].len(), 4);

        coords["a"].pending_assignments.clear();
        let second = assign_slots(&mut coords, &host_table, &HashMap::new(), POLICY, start, &mut rng);
        assert!(second.is_empty());

        let later = start + Duration::from_secs(61);
        let third = assign_slots(&mut coords, &host_table, &HashMap::new(), POLICY, later, &mut rng);
        assert_eq!(third["a"].len(), 4);
    }

    #[test]
    fn test_stale_assignments_expire() {
        let host_table = hosts(&[("node1", 1.0)]);
        let mut coords = table(vec![record("a", 0, 1.0)]);
        assign_shares(&mut coords, 1.0);
        let mut rng = StdRng::seed_from_u64(7);
        let start = Instant::now();

        assign_slots(&mut coords, &host_table, &HashMap::new(), POLICY, start, &mut rng);
        assert_eq!(coords["a"].pending_assignments.len(), 1);

        let later = start + Duration::from_secs(301);
        let again = assign_slots(&mut coords, &host_table, &HashMap::new(), POLICY, later, &mut rng);
        assert_eq!(again["a"].len(), 1);
        assert_eq!(coords["a"].pending_assignments.len(), 1);
    }

    #[tokio::test]
    async fn test_single_host_end_to_end() {
        let (controller, connector) = controller(hosts(&[("node1", 2.0)]));
        let reg = CoordinatorRegistration::new("align", "align:5001")
            .with_priority(1.0)
            .with_job_id(JobId::new(0));
        controller.register_coordinator(reg).await.unwrap();

        let rebalance = controller.load_balance().await;
        assert_eq!(rebalance.allocations["align"], 2);
        rebalance.settle().await;

        let summary = controller.coordinator("align").await.unwrap();
        assert_eq!(summary.allocated_cpu, 2);
        assert_eq!(summary.pending_assignments, vec!["node1", "node1"]);

        // Slots went out exactly once, with the allocation
        connector.wait_for_pushes(1).await;
        let pushes = connector.pushes();
        let with_hosts: Vec<_> = pushes.iter().filter(|p| !p.hosts.is_empty()).collect();
        assert_eq!(with_hosts.len(), 1);
        assert_eq!(with_hosts[0].url, "align:5001");
        assert_eq!(with_hosts[0].allocated_cpu, 2);
        assert_eq!(with_hosts[0].hosts, vec!["node1", "node1"]);
    }

    #[tokio::test]
    async fn test_job_ids_are_assigned_and_kept() {
        let (controller, _) = controller(HostTable::new());
        let first = controller
            .register_coordinator(CoordinatorRegistration::new("a", "a:1"))
            .await
            .unwrap();
        let second = controller
            .register_coordinator(CoordinatorRegistration::new("b", "b:1"))
            .await
            .unwrap();
        assert!(first < second);

        let again = controller
            .register_coordinator(CoordinatorRegistration::new("a", "a:1").with_priority(0.0))
            .await
            .unwrap();
        assert_eq!(again, first);
        assert_eq!(controller.coordinator("a").await.unwrap().registration.priority, 0.0);
    }

    #[tokio::test]
    async fn test_processor_registration_confirms_assignment() {
        let (controller, _) = controller(hosts(&[("node1", 2.0)]));
        controller
            .register_coordinator(CoordinatorRegistration::new("a", "a:1"))
            .await
            .unwrap();
        assert_eq!(controller.coordinator("a").await.unwrap().pending_assignments.len(), 2);

        let p = ProcessorId::new("node1", 100);
        assert!(controller.register_processor("a".to_string(), p.clone()).await.unwrap());
        let summary = controller.coordinator("a").await.unwrap();
        assert_eq!(summary.pending_assignments.len(), 1);
        assert_eq!(summary.processors, vec![p.clone()]);

        assert!(controller.unregister_processor(p.clone()).await.unwrap());
        assert!(!controller.unregister_processor(p).await.unwrap());
        assert!(
            !controller
                .register_processor("ghost".to_string(), ProcessorId::new("node1", 1))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_report_load_flags_overload() {
        let (controller, _) = controller(hosts(&[("node1", 2.0)]));
        let p = ProcessorId::new("node1", 100);
        assert!(controller.report_load(p.clone(), 2.5).await.unwrap());
        assert!(!controller.report_load(p.clone(), 2.7).await.unwrap());
        assert!(controller.report_load(ProcessorId::new("elsewhere", 1), 50.0).await.unwrap());
    }

    #[tokio::test]
    async fn test_retry_unused_hosts() {
        let (controller, _) = controller(hosts(&[("node1", 2.0), ("node2", 2.0)]));
        controller
            .register_coordinator(CoordinatorRegistration::new("a", "a:1"))
            .await
            .unwrap();
        let busy = ProcessorId::new("node1", 1);
        controller.register_processor("a".to_string(), busy.clone()).await.unwrap();
        controller.report_load(busy, 1.0).await.unwrap();
        controller.report_load(ProcessorId::new("node2", 9), 5.0).await.unwrap();

        assert_eq!(controller.retry_unused_hosts().await.unwrap(), 1);
        let status = controller.status().await.unwrap();
        assert_eq!(status.loads["node1"], 1.0);
        assert_eq!(status.loads["node2"], 0.0);
    }

    #[tokio::test]
    async fn test_departing_processor_releases_locks() {
        let (controller, _) = controller(HostTable::new());
        controller
            .set_rule("hg18".to_string(), ResourceRule::new("/scratch/hg18", "build"))
            .await
            .unwrap();
        controller
            .register_coordinator(CoordinatorRegistration::new("a", "a:1"))
            .await
            .unwrap();
        let builder = ProcessorId::new("node1", 1);
        controller.register_processor("a".to_string(), builder.clone()).await.unwrap();

        let grant = controller.acquire_rule(builder.clone(), "hg18".to_string()).await.unwrap();
        assert!(matches!(grant, RuleGrant::Granted { .. }));
        let waiting = controller
            .acquire_rule(ProcessorId::new("node1", 2), "hg18".to_string())
            .await
            .unwrap();
        assert_eq!(waiting, RuleGrant::Wait);

        controller.unregister_processor(builder).await.unwrap();
        let status = controller
            .get_resource("node1".to_string(), "hg18".to_string())
            .await
            .unwrap();
        assert_eq!(status, ResourceStatus::NeedsBuild);
    }

    #[tokio::test]
    async fn test_release_then_get_resource() {
        let (controller, _) = controller(HostTable::new());
        controller
            .set_rule("hg18".to_string(), ResourceRule::new("/scratch/hg18", "build"))
            .await
            .unwrap();
        let p = ProcessorId::new("node1", 1);
        controller.acquire_rule(p.clone(), "hg18".to_string()).await.unwrap();
        assert!(
            controller
                .release_rule(p, "hg18".to_string(), Some("/scratch/hg18".to_string()))
                .await
                .unwrap()
        );
        let status = controller
            .get_resource("node1".to_string(), "hg18".to_string())
            .await
            .unwrap();
        assert_eq!(
            status,
            ResourceStatus::Ready {
                path: "/scratch/hg18".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_throttle_scales_capacity() {
        let (controller, _) = controller(hosts(&[("node1", 8.0)]));
        controller
            .register_coordinator(CoordinatorRegistration::new("a", "a:1"))
            .await
            .unwrap();
        controller.set_throttle(0.5).await.unwrap();
        let rebalance = controller.load_balance().await;
        assert_eq!(rebalance.allocations["a"], 4);
        assert!(controller.set_throttle(-1.0).await.is_err());
    }

    #[tokio::test]
    async fn test_host_info_setter_persists() {
        let dir = tempfile::tempdir().unwrap();
        let config = ControllerConfig::new("grid").with_state_dir(dir.path());
        std::fs::write(config.hosts_path(), "node1 2\n").unwrap();
        let controller =
            ResourceController::open(config.clone(), Arc::new(RecordingConnector::default())).unwrap();

        controller
            .set_host_info(HostInfo::new("node2", 4.0).with_login_options("-p 2222"))
            .await
            .unwrap();
        let info = controller.get_host_info("node2".to_string()).await.unwrap().unwrap();
        assert_eq!(info.login_options, "-p 2222");

        let saved = HostTable::load(&config.hosts_path()).unwrap();
        assert_eq!(saved.len(), 2);
        assert!(controller.set_host_info(HostInfo::new("bad", f64::NAN)).await.is_err());
    }

    #[tokio::test]
    async fn test_unregister_coordinator() {
        let (controller, _) = controller(HostTable::new());
        controller
            .register_coordinator(CoordinatorRegistration::new("a", "a:1"))
            .await
            .unwrap();
        assert!(controller.request_cpus("a".to_string()).await.unwrap());
        assert!(controller.unregister_coordinator("a".to_string()).await.unwrap());
        assert!(!controller.unregister_coordinator("a".to_string()).await.unwrap());
        assert!(!controller.request_cpus("a".to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_requests_termination() {
        let (controller, _) = controller(HostTable::new());
        let err = controller.shutdown().await.unwrap_err();
        assert!(matches!(err, ServiceError::Terminate { .. }));
    }

    #[tokio::test]
    async fn test_slow_coordinator_does_not_hold_up_pushes() {
        let connector =
            RecordingConnector::default().with_delay("slow:5001", Duration::from_secs(30));
        let controller = ResourceController::new(
            ControllerConfig::new("test").with_push_timeout(100),
            hosts(&[("node1", 4.0)]),
            RuleStore::in_memory(),
            Arc::new(connector.clone()),
        );
        {
            let mut state = controller.state.write().await;
            for r in [record("slow", 0, 1.0), record("fast", 1, 1.0)] {
                state.coordinators.insert(r.registration.name.clone(), r);
            }
        }

        let started = Instant::now();
        let rebalance = controller.load_balance().await;
        assert_eq!(rebalance.push_count(), 2);
        rebalance.settle().await;
        assert!(started.elapsed() < Duration::from_secs(5));

        // The slow push was cut off by its timeout, the fast one landed
        let pushes = connector.pushes();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].url, "fast:5001");
    }
}

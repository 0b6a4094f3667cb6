//! Worker processor.
//!
//! A processor registers with its coordinator and the controller, pulls
//! task IDs until none are left, and runs each through a
//! [`TaskExecutor`]. It periodically reports the host load and exits when
//! the controller keeps saying the host is overloaded. Whatever ends the
//! run, the processor deregisters from both servers exactly once.

use crate::api::{ControllerService, CoordinatorService, ResourceStatus, RuleGrant};
use crate::executor::{LoadProbe, ResourceBuilder, TaskExecutor};
use fairshare_core::{ProcessorId, TaskId};
use fairshare_rpc::{ServiceError, diagnostic};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Processor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Coordinator address
    pub coordinator_url: String,
    /// Controller address
    pub controller_url: String,
    /// Seconds between load reports
    pub report_interval_secs: u64,
    /// Consecutive task failures tolerated
    pub max_consecutive_failures: usize,
    /// Consecutive overloaded reports before exiting
    pub overload_max: usize,
    /// Wait between resource polls in milliseconds
    pub resource_backoff_ms: u64,
}

impl ProcessorConfig {
    /// Create a processor config
    #[must_use]
    pub fn new(coordinator_url: impl Into<String>, controller_url: impl Into<String>) -> Self {
        Self {
            coordinator_url: coordinator_url.into(),
            controller_url: controller_url.into(),
            report_interval_secs: 600,
            max_consecutive_failures: 10,
            overload_max: 5,
            resource_backoff_ms: 5000,
        }
    }

    /// Set load report interval
    #[must_use]
    pub fn with_report_interval(mut self, secs: u64) -> Self {
        self.report_interval_secs = secs;
        self
    }

    /// Set consecutive failure limit
    #[must_use]
    pub fn with_max_consecutive_failures(mut self, max: usize) -> Self {
        self.max_consecutive_failures = max;
        self
    }

    /// Set overload limit
    #[must_use]
    pub fn with_overload_max(mut self, max: usize) -> Self {
        self.overload_max = max;
        self
    }

    /// Set resource poll backoff
    #[must_use]
    pub fn with_resource_backoff(mut self, backoff_ms: u64) -> Self {
        self.resource_backoff_ms = backoff_ms;
        self
    }
}

/// Processor errors
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    /// Too many tasks failed in a row
    #[error("{count} consecutive task failures")]
    FailureLimit { count: usize },

    /// Controller kept reporting the host overloaded
    #[error("Host overloaded for {count} consecutive load reports")]
    Overloaded { count: usize },

    /// No rule for the requested resource
    #[error("No rule for resource {key}")]
    UnknownResource { key: String },

    /// Building a resource failed
    #[error("Building resource {key} failed: {reason}")]
    ResourceBuild { key: String, reason: String },

    /// Server call failed
    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// Outcome of a completed run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Tasks that succeeded
    pub succeeded: u64,
    /// Tasks that failed
    pub failed: u64,
}

/// A worker bound to one coordinator
pub struct Processor {
    config: ProcessorConfig,
    id: ProcessorId,
    coordinator: Arc<dyn CoordinatorService>,
    controller: Arc<dyn ControllerService>,
    probe: Arc<dyn LoadProbe>,
    deregistered: AtomicBool,
    shutdown: CancellationToken,
}

impl Processor {
    /// Create a processor
    #[must_use]
    pub fn new(
        config: ProcessorConfig,
        id: ProcessorId,
        coordinator: Arc<dyn CoordinatorService>,
        controller: Arc<dyn ControllerService>,
        probe: Arc<dyn LoadProbe>,
    ) -> Self {
        Self {
            config,
            id,
            coordinator,
            controller,
            probe,
            deregistered: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop when `shutdown` is cancelled
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Processor ID
    #[must_use]
    pub fn id(&self) -> &ProcessorId {
        &self.id
    }

    /// Register with the coordinator, then with the controller under the
    /// job name the coordinator returns
    ///
    /// # Errors
    ///
    /// Returns error if the coordinator cannot be reached
    pub async fn register(&self) -> Result<String, ProcessorError> {
        let job = self.coordinator.register_processor(self.id.clone()).await?;
        match self.controller.register_processor(job.clone(), self.id.clone()).await {
            Ok(true) => {}
            Ok(false) => warn!(processor = %self.id, %job, "controller does not know the job"),
            Err(err) => warn!(processor = %self.id, error = %err, "controller registration failed"),
        }
        info!(processor = %self.id, %job, "processor registered");
        Ok(job)
    }

    /// Deregister from both servers; only the first call does anything
    ///
    /// Returns whether this call performed the deregistration.
    pub async fn deregister(&self) -> bool {
        if self.deregistered.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Err(err) = self.coordinator.unregister_processor(self.id.clone()).await {
            warn!(processor = %self.id, error = %err, "coordinator deregistration failed");
        }
        if let Err(err) = self.controller.unregister_processor(self.id.clone()).await {
            warn!(processor = %self.id, error = %err, "controller deregistration failed");
        }
        info!(processor = %self.id, "processor deregistered");
        true
    }

    /// Run tasks until the coordinator has none left for this processor
    ///
    /// # Errors
    ///
    /// Returns the fatal condition that ended the run; the processor has
    /// deregistered either way
    pub async fn run_all(&self, executor: &dyn TaskExecutor) -> Result<RunSummary, ProcessorError> {
        let mut last_success = None;
        let mut summary = RunSummary::default();
        let result = self.work(executor, &mut last_success, &mut summary).await;

        if let Some(task) = last_success {
            if let Err(err) = self.coordinator.report_success(self.id.clone(), task.clone()).await {
                warn!(processor = %self.id, %task, error = %err, "final success report failed");
            }
        }
        self.deregister().await;

        match &result {
            Ok(()) => info!(processor = %self.id, succeeded = summary.succeeded, failed = summary.failed, "no more work"),
            Err(err) => error!(processor = %self.id, error = %err, "processor stopping"),
        }
        result.map(|()| summary)
    }

    async fn work(
        &self,
        executor: &dyn TaskExecutor,
        last_success: &mut Option<TaskId>,
        summary: &mut RunSummary,
    ) -> Result<(), ProcessorError> {
        self.register().await?;
        let report_interval = Duration::from_secs(self.config.report_interval_secs);
        let mut last_report: Option<Instant> = None;
        let mut overloads = 0;
        let mut failures = 0;

        loop {
            if last_report.is_none_or(|t| t.elapsed() >= report_interval) {
                self.check_load(&mut overloads).await?;
                last_report = Some(Instant::now());
            }

            // The success stays with us until the coordinator has taken it,
            // so run_all can still report it if this request never lands
            let request = self.coordinator.next(self.id.clone(), last_success.clone());
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!(processor = %self.id, "cancelled");
                    return Ok(());
                }
                next = request => next?,
            };
            *last_success = None;
            let Some(task) = next else {
                return Ok(());
            };

            debug!(processor = %self.id, %task, "running task");
            let outcome = AssertUnwindSafe(executor.execute(&task)).catch_unwind().await;
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(diagnostic(err.as_ref())),
                Err(panic) => Some(format!("task panicked: {}", panic_text(panic.as_ref()))),
            };
            match failure {
                None => {
                    failures = 0;
                    summary.succeeded += 1;
                    *last_success = Some(task);
                }
                Some(text) => {
                    failures += 1;
                    summary.failed += 1;
                    warn!(processor = %self.id, %task, failures, "task failed");
                    self.coordinator.report_failure(self.id.clone(), task, text).await?;
                    if failures > self.config.max_consecutive_failures {
                        return Err(ProcessorError::FailureLimit { count: failures });
                    }
                }
            }
        }
    }

    /// Report the host load; fatal after `overload_max` overloaded reports
    /// in a row
    async fn check_load(&self, overloads: &mut usize) -> Result<(), ProcessorError> {
        let load = match self.probe.load().await {
            Ok(load) => load,
            Err(err) => {
                warn!(processor = %self.id, error = %err, "cannot read host load");
                return Ok(());
            }
        };
        match self.controller.report_load(self.id.clone(), load).await {
            Ok(true) => *overloads = 0,
            Ok(false) => {
                *overloads += 1;
                warn!(processor = %self.id, load, overloads = *overloads, "controller reports host overloaded");
                if *overloads >= self.config.overload_max {
                    return Err(ProcessorError::Overloaded { count: *overloads });
                }
            }
            Err(err) => warn!(processor = %self.id, error = %err, "load report failed"),
        }
        Ok(())
    }

    /// Path of resource `key` on this host, building it first if nobody has
    ///
    /// Waits while another processor holds the build lock.
    ///
    /// # Errors
    ///
    /// Returns error if no rule exists for `key` or the build fails
    pub async fn open_resource(&self, key: &str, builder: &dyn ResourceBuilder) -> Result<String, ProcessorError> {
        let backoff = Duration::from_millis(self.config.resource_backoff_ms);
        loop {
            match self.controller.get_resource(self.id.host.clone(), key.to_string()).await? {
                ResourceStatus::Ready { path } => return Ok(path),
                ResourceStatus::Wait => {}
                ResourceStatus::NeedsBuild => {
                    match self.controller.acquire_rule(self.id.clone(), key.to_string()).await? {
                        RuleGrant::Granted { rule } => return self.build(key, &rule, builder).await,
                        RuleGrant::Wait => {}
                        RuleGrant::NotFound => {
                            return Err(ProcessorError::UnknownResource { key: key.to_string() });
                        }
                    }
                }
            }
            debug!(processor = %self.id, key, "resource being built elsewhere, waiting");
            tokio::time::sleep(backoff).await;
        }
    }

    async fn build(
        &self,
        key: &str,
        rule: &crate::api::ResourceRule,
        builder: &dyn ResourceBuilder,
    ) -> Result<String, ProcessorError> {
        info!(processor = %self.id, key, target = %rule.target, "building resource");
        match builder.build(key, rule).await {
            Ok(path) => {
                self.controller
                    .release_rule(self.id.clone(), key.to_string(), Some(path.clone()))
                    .await?;
                Ok(path)
            }
            Err(err) => {
                let reason = format!("{err:#}");
                self.controller
                    .release_rule(self.id.clone(), key.to_string(), None)
                    .await?;
                Err(ProcessorError::ResourceBuild {
                    key: key.to_string(),
                    reason,
                })
            }
        }
    }
}

fn panic_text(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

//! In-process fakes shared by the unit tests.

use crate::api::{
    CoordinatorConnector, CoordinatorService, CoordinatorStatus, ResourceRule,
};
use crate::executor::{LoadProbe, ResourceBuilder};
use crate::launcher::{LaunchCommand, LaunchError, LaunchHandle, Launcher};
use async_trait::async_trait;
use fairshare_core::{HostInfo, ProcessorId, TaskId};
use fairshare_rpc::{ServiceError, ServiceResult};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One allocation push seen by [`RecordingConnector`]
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Push {
    pub url: String,
    pub allocated_cpu: usize,
    pub hosts: Vec<String>,
}

/// Connector whose coordinators only record allocation pushes
#[derive(Clone, Default)]
pub(crate) struct RecordingConnector {
    pushes: Arc<Mutex<Vec<Push>>>,
    delays: BTreeMap<String, Duration>,
}

impl RecordingConnector {
    /// Make the coordinator at `url` take `delay` to answer a push
    pub fn with_delay(mut self, url: &str, delay: Duration) -> Self {
        self.delays.insert(url.to_string(), delay);
        self
    }

    pub fn pushes(&self) -> Vec<Push> {
        self.pushes.lock().unwrap().clone()
    }

    pub async fn wait_for_pushes(&self, count: usize) {
        for _ in 0..200 {
            if self.pushes.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} pushes, saw {:?}", self.pushes());
    }
}

#[async_trait]
impl CoordinatorConnector for RecordingConnector {
    async fn connect(&self, url: &str) -> Arc<dyn CoordinatorService> {
        Arc::new(RecordingCoordinator {
            url: url.to_string(),
            pushes: Arc::clone(&self.pushes),
            delay: self.delays.get(url).copied(),
        })
    }
}

struct RecordingCoordinator {
    url: String,
    pushes: Arc<Mutex<Vec<Push>>>,
    delay: Option<Duration>,
}

fn unsupported<T>() -> ServiceResult<T> {
    Err(ServiceError::InvalidRequest("not supported by the recorder".to_string()))
}

#[async_trait]
impl CoordinatorService for RecordingCoordinator {
    async fn register_processor(&self, _processor: ProcessorId) -> ServiceResult<String> {
        unsupported()
    }

    async fn unregister_processor(&self, _processor: ProcessorId) -> ServiceResult<bool> {
        unsupported()
    }

    async fn next(
        &self,
        _processor: ProcessorId,
        _last_success: Option<TaskId>,
    ) -> ServiceResult<Option<TaskId>> {
        unsupported()
    }

    async fn report_success(&self, _processor: ProcessorId, _task: TaskId) -> ServiceResult<bool> {
        unsupported()
    }

    async fn report_failure(
        &self,
        _processor: ProcessorId,
        _task: TaskId,
        _diagnostic: String,
    ) -> ServiceResult<bool> {
        unsupported()
    }

    async fn start_processors(
        &self,
        allocated_cpu: usize,
        hosts: Vec<HostInfo>,
    ) -> ServiceResult<usize> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let launched = hosts.len();
        self.pushes.lock().unwrap().push(Push {
            url: self.url.clone(),
            allocated_cpu,
            hosts: hosts.into_iter().map(|h| h.name).collect(),
        });
        Ok(launched)
    }

    async fn stop_processor(&self, _processor: ProcessorId) -> ServiceResult<bool> {
        unsupported()
    }

    async fn set_max_clients(&self, _max_clients: usize) -> ServiceResult<bool> {
        unsupported()
    }

    async fn status(&self) -> ServiceResult<CoordinatorStatus> {
        unsupported()
    }

    async fn shutdown(&self) -> ServiceResult<bool> {
        unsupported()
    }
}

/// Launcher that records launches instead of starting processes
#[derive(Clone, Default)]
pub(crate) struct FakeLauncher {
    launches: Arc<Mutex<Vec<(String, LaunchCommand)>>>,
    refuse_preflight: bool,
}

impl FakeLauncher {
    pub fn without_agent() -> Self {
        Self {
            refuse_preflight: true,
            ..Self::default()
        }
    }

    pub fn launches(&self) -> Vec<(String, LaunchCommand)> {
        self.launches.lock().unwrap().clone()
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    fn preflight(&self) -> Result<(), LaunchError> {
        if self.refuse_preflight {
            return Err(LaunchError::AgentUnavailable {
                reason: "is not set".to_string(),
            });
        }
        Ok(())
    }

    async fn launch(&self, host: &HostInfo, command: &LaunchCommand) -> Result<LaunchHandle, LaunchError> {
        self.launches
            .lock()
            .unwrap()
            .push((host.name.clone(), command.clone()));
        Ok(LaunchHandle::new(&host.name, None, &command.log_path))
    }
}

/// Load probe replaying a fixed sequence, repeating the last value
pub(crate) struct ScriptedProbe {
    loads: Mutex<VecDeque<f64>>,
}

impl ScriptedProbe {
    pub fn new(loads: impl IntoIterator<Item = f64>) -> Self {
        Self {
            loads: Mutex::new(loads.into_iter().collect()),
        }
    }
}

#[async_trait]
impl LoadProbe for ScriptedProbe {
    async fn load(&self) -> anyhow::Result<f64> {
        let mut loads = self.loads.lock().unwrap();
        let load = loads.front().copied().unwrap_or(0.0);
        if loads.len() > 1 {
            loads.pop_front();
        }
        Ok(load)
    }
}

/// Builder that counts builds and takes a while about it
#[derive(Default)]
pub(crate) struct SlowBuilder {
    pub builds: AtomicUsize,
    pub fail: bool,
}

#[async_trait]
impl ResourceBuilder for SlowBuilder {
    async fn build(&self, key: &str, rule: &ResourceRule) -> anyhow::Result<String> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        if self.fail {
            anyhow::bail!("build of {key} failed");
        }
        Ok(rule.target.clone())
    }
}

/// Count of lines per first tab-separated field of a journal file
pub(crate) fn journal_lines(path: &std::path::Path) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for line in std::fs::read_to_string(path).unwrap_or_default().lines() {
        if let Some(task) = line.split('\t').next() {
            *counts.entry(task.to_string()).or_default() += 1;
        }
    }
    counts
}

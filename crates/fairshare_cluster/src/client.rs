//! HTTP implementations of the service interfaces.

use crate::api::{
    ControllerService, ControllerStatus, CoordinatorConnector, CoordinatorRegistration,
    CoordinatorService, CoordinatorStatus, ResourceRule, ResourceStatus, RuleGrant,
};
use crate::ops::{ControllerCall, CoordinatorCall};
use async_trait::async_trait;
use fairshare_core::{HostInfo, JobId, ProcessorId, TaskId};
use fairshare_rpc::{ConnectionPool, RpcClient, ServiceResult};
use std::sync::Arc;
use std::time::Duration;

/// Remote resource controller
#[derive(Clone)]
pub struct ControllerClient {
    rpc: RpcClient,
}

impl ControllerClient {
    /// Create a client for the controller at `address`
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self::from_rpc(RpcClient::new(address))
    }

    /// Wrap an existing RPC client
    #[must_use]
    pub fn from_rpc(rpc: RpcClient) -> Self {
        Self { rpc }
    }

    async fn call<R: serde::de::DeserializeOwned>(&self, call: ControllerCall) -> ServiceResult<R> {
        Ok(self.rpc.call(&call).await?)
    }
}

#[async_trait]
impl ControllerService for ControllerClient {
    async fn register_coordinator(
        &self,
        registration: CoordinatorRegistration,
    ) -> ServiceResult<JobId> {
        self.call(ControllerCall::RegisterCoordinator { registration }).await
    }

    async fn unregister_coordinator(&self, name: String) -> ServiceResult<bool> {
        self.call(ControllerCall::UnregisterCoordinator { name }).await
    }

    async fn request_cpus(&self, name: String) -> ServiceResult<bool> {
        self.call(ControllerCall::RequestCpus { name }).await
    }

    async fn register_processor(
        &self,
        coordinator: String,
        processor: ProcessorId,
    ) -> ServiceResult<bool> {
        self.call(ControllerCall::RegisterProcessor {
            coordinator,
            processor,
        })
        .await
    }

    async fn unregister_processor(&self, processor: ProcessorId) -> ServiceResult<bool> {
        self.call(ControllerCall::UnregisterProcessor { processor }).await
    }

    async fn report_load(&self, processor: ProcessorId, load: f64) -> ServiceResult<bool> {
        self.call(ControllerCall::ReportLoad { processor, load }).await
    }

    async fn get_resource(&self, host: String, key: String) -> ServiceResult<ResourceStatus> {
        self.call(ControllerCall::GetResource { host, key }).await
    }

    async fn acquire_rule(&self, processor: ProcessorId, key: String) -> ServiceResult<RuleGrant> {
        self.call(ControllerCall::AcquireRule { processor, key }).await
    }

    async fn release_rule(
        &self,
        processor: ProcessorId,
        key: String,
        path: Option<String>,
    ) -> ServiceResult<bool> {
        self.call(ControllerCall::ReleaseRule {
            processor,
            key,
            path,
        })
        .await
    }

    async fn set_rule(&self, key: String, rule: ResourceRule) -> ServiceResult<bool> {
        self.call(ControllerCall::SetRule { key, rule }).await
    }

    async fn del_rule(&self, key: String) -> ServiceResult<bool> {
        self.call(ControllerCall::DelRule { key }).await
    }

    async fn set_host_info(&self, info: HostInfo) -> ServiceResult<bool> {
        self.call(ControllerCall::SetHostInfo { info }).await
    }

    async fn get_host_info(&self, host: String) -> ServiceResult<Option<HostInfo>> {
        self.call(ControllerCall::GetHostInfo { host }).await
    }

    async fn set_throttle(&self, throttle: f64) -> ServiceResult<bool> {
        self.call(ControllerCall::SetThrottle { throttle }).await
    }

    async fn del_lock(&self, host: String, key: String) -> ServiceResult<bool> {
        self.call(ControllerCall::DelLock { host, key }).await
    }

    async fn retry_unused_hosts(&self) -> ServiceResult<usize> {
        self.call(ControllerCall::RetryUnusedHosts).await
    }

    async fn status(&self) -> ServiceResult<ControllerStatus> {
        self.call(ControllerCall::Status).await
    }

    async fn shutdown(&self) -> ServiceResult<bool> {
        self.call(ControllerCall::Shutdown).await
    }
}

/// Remote job coordinator
#[derive(Clone)]
pub struct CoordinatorClient {
    rpc: RpcClient,
}

impl CoordinatorClient {
    /// Create a client for the coordinator at `address`
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self::from_rpc(RpcClient::new(address))
    }

    /// Wrap an existing RPC client
    #[must_use]
    pub fn from_rpc(rpc: RpcClient) -> Self {
        Self { rpc }
    }

    async fn call<R: serde::de::DeserializeOwned>(&self, call: CoordinatorCall) -> ServiceResult<R> {
        Ok(self.rpc.call(&call).await?)
    }
}

#[async_trait]
impl CoordinatorService for CoordinatorClient {
    async fn register_processor(&self, processor: ProcessorId) -> ServiceResult<String> {
        self.call(CoordinatorCall::RegisterProcessor { processor }).await
    }

    async fn unregister_processor(&self, processor: ProcessorId) -> ServiceResult<bool> {
        self.call(CoordinatorCall::UnregisterProcessor { processor }).await
    }

    async fn next(
        &self,
        processor: ProcessorId,
        last_success: Option<TaskId>,
    ) -> ServiceResult<Option<TaskId>> {
        self.call(CoordinatorCall::Next {
            processor,
            last_success,
        })
        .await
    }

    async fn report_success(&self, processor: ProcessorId, task: TaskId) -> ServiceResult<bool> {
        self.call(CoordinatorCall::ReportSuccess { processor, task }).await
    }

    async fn report_failure(
        &self,
        processor: ProcessorId,
        task: TaskId,
        diagnostic: String,
    ) -> ServiceResult<bool> {
        self.call(CoordinatorCall::ReportFailure {
            processor,
            task,
            diagnostic,
        })
        .await
    }

    async fn start_processors(
        &self,
        allocated_cpu: usize,
        hosts: Vec<HostInfo>,
    ) -> ServiceResult<usize> {
        self.call(CoordinatorCall::StartProcessors {
            allocated_cpu,
            hosts,
        })
        .await
    }

    async fn stop_processor(&self, processor: ProcessorId) -> ServiceResult<bool> {
        self.call(CoordinatorCall::StopProcessor { processor }).await
    }

    async fn set_max_clients(&self, max_clients: usize) -> ServiceResult<bool> {
        self.call(CoordinatorCall::SetMaxClients { max_clients }).await
    }

    async fn status(&self) -> ServiceResult<CoordinatorStatus> {
        self.call(CoordinatorCall::Status).await
    }

    async fn shutdown(&self) -> ServiceResult<bool> {
        self.call(CoordinatorCall::Shutdown).await
    }
}

/// Connects to coordinators over HTTP through a pool owned by the controller
pub struct HttpConnector {
    pool: ConnectionPool,
}

impl HttpConnector {
    /// Create a connector whose calls time out after `timeout`
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            pool: ConnectionPool::new(timeout),
        }
    }
}

#[async_trait]
impl CoordinatorConnector for HttpConnector {
    async fn connect(&self, url: &str) -> Arc<dyn CoordinatorService> {
        Arc::new(CoordinatorClient::from_rpc(self.pool.client(url).await))
    }
}

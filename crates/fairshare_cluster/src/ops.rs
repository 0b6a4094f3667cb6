//! Wire operation sets for the controller and coordinator servers.
//!
//! The variants of each enum are the complete allow-list of its server.

use crate::api::{ControllerService, CoordinatorRegistration, CoordinatorService, ResourceRule};
use fairshare_core::{HostInfo, ProcessorId, TaskId};
use fairshare_rpc::{Operation, ServiceResult, encode};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Calls accepted by the resource controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "args", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum ControllerCall {
    RegisterCoordinator {
        registration: CoordinatorRegistration,
    },
    UnregisterCoordinator {
        name: String,
    },
    RequestCpus {
        name: String,
    },
    RegisterProcessor {
        coordinator: String,
        processor: ProcessorId,
    },
    UnregisterProcessor {
        processor: ProcessorId,
    },
    ReportLoad {
        processor: ProcessorId,
        load: f64,
    },
    GetResource {
        host: String,
        key: String,
    },
    AcquireRule {
        processor: ProcessorId,
        key: String,
    },
    ReleaseRule {
        processor: ProcessorId,
        key: String,
        path: Option<String>,
    },
    SetRule {
        key: String,
        rule: ResourceRule,
    },
    DelRule {
        key: String,
    },
    SetHostInfo {
        info: HostInfo,
    },
    GetHostInfo {
        host: String,
    },
    SetThrottle {
        throttle: f64,
    },
    DelLock {
        host: String,
        key: String,
    },
    RetryUnusedHosts,
    Status,
    Shutdown,
}

impl Operation for ControllerCall {
    type Service = dyn ControllerService;

    const OPERATIONS: &'static [&'static str] = &[
        "register_coordinator",
        "unregister_coordinator",
        "request_cpus",
        "register_processor",
        "unregister_processor",
        "report_load",
        "get_resource",
        "acquire_rule",
        "release_rule",
        "set_rule",
        "del_rule",
        "set_host_info",
        "get_host_info",
        "set_throttle",
        "del_lock",
        "retry_unused_hosts",
        "status",
        "shutdown",
    ];

    fn name(&self) -> &'static str {
        match self {
            Self::RegisterCoordinator { .. } => "register_coordinator",
            Self::UnregisterCoordinator { .. } => "unregister_coordinator",
            Self::RequestCpus { .. } => "request_cpus",
            Self::RegisterProcessor { .. } => "register_processor",
            Self::UnregisterProcessor { .. } => "unregister_processor",
            Self::ReportLoad { .. } => "report_load",
            Self::GetResource { .. } => "get_resource",
            Self::AcquireRule { .. } => "acquire_rule",
            Self::ReleaseRule { .. } => "release_rule",
            Self::SetRule { .. } => "set_rule",
            Self::DelRule { .. } => "del_rule",
            Self::SetHostInfo { .. } => "set_host_info",
            Self::GetHostInfo { .. } => "get_host_info",
            Self::SetThrottle { .. } => "set_throttle",
            Self::DelLock { .. } => "del_lock",
            Self::RetryUnusedHosts => "retry_unused_hosts",
            Self::Status => "status",
            Self::Shutdown => "shutdown",
        }
    }

    fn invoke(self, service: Arc<dyn ControllerService>) -> BoxFuture<'static, ServiceResult<Value>> {
        Box::pin(async move {
            match self {
                Self::RegisterCoordinator { registration } => {
                    encode(service.register_coordinator(registration).await?)
                }
                Self::UnregisterCoordinator { name } => {
                    encode(service.unregister_coordinator(name).await?)
                }
                Self::RequestCpus { name } => encode(service.request_cpus(name).await?),
                Self::RegisterProcessor {
                    coordinator,
                    processor,
                } => encode(service.register_processor(coordinator, processor).await?),
                Self::UnregisterProcessor { processor } => {
                    encode(service.unregister_processor(processor).await?)
                }
                Self::ReportLoad { processor, load } => {
                    encode(service.report_load(processor, load).await?)
                }
                Self::GetResource { host, key } => encode(service.get_resource(host, key).await?),
                Self::AcquireRule { processor, key } => {
                    encode(service.acquire_rule(processor, key).await?)
                }
                Self::ReleaseRule {
                    processor,
                    key,
                    path,
                } => encode(service.release_rule(processor, key, path).await?),
                Self::SetRule { key, rule } => encode(service.set_rule(key, rule).await?),
                Self::DelRule { key } => encode(service.del_rule(key).await?),
                Self::SetHostInfo { info } => encode(service.set_host_info(info).await?),
                Self::GetHostInfo { host } => encode(service.get_host_info(host).await?),
                Self::SetThrottle { throttle } => encode(service.set_throttle(throttle).await?),
                Self::DelLock { host, key } => encode(service.del_lock(host, key).await?),
                Self::RetryUnusedHosts => encode(service.retry_unused_hosts().await?),
                Self::Status => encode(service.status().await?),
                Self::Shutdown => encode(service.shutdown().await?),
            }
        })
    }
}

/// Calls accepted by a job coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "args", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum CoordinatorCall {
    RegisterProcessor {
        processor: ProcessorId,
    },
    UnregisterProcessor {
        processor: ProcessorId,
    },
    Next {
        processor: ProcessorId,
        last_success: Option<TaskId>,
    },
    ReportSuccess {
        processor: ProcessorId,
        task: TaskId,
    },
    ReportFailure {
        processor: ProcessorId,
        task: TaskId,
        diagnostic: String,
    },
    StartProcessors {
        allocated_cpu: usize,
        hosts: Vec<HostInfo>,
    },
    StopProcessor {
        processor: ProcessorId,
    },
    SetMaxClients {
        max_clients: usize,
    },
    Status,
    Shutdown,
}

impl Operation for CoordinatorCall {
    type Service = dyn CoordinatorService;

    const OPERATIONS: &'static [&'static str] = &[
        "register_processor",
        "unregister_processor",
        "next",
        "report_success",
        "report_failure",
        "start_processors",
        "stop_processor",
        "set_max_clients",
        "status",
        "shutdown",
    ];

    fn name(&self) -> &'static str {
        match self {
            Self::RegisterProcessor { .. } => "register_processor",
            Self::UnregisterProcessor { .. } => "unregister_processor",
            Self::Next { .. } => "next",
            Self::ReportSuccess { .. } => "report_success",
            Self::ReportFailure { .. } => "report_failure",
            Self::StartProcessors { .. } => "start_processors",
            Self::StopProcessor { .. } => "stop_processor",
            Self::SetMaxClients { .. } => "set_max_clients",
            Self::Status => "status",
            Self::Shutdown => "shutdown",
        }
    }

    fn invoke(self, service: Arc<dyn CoordinatorService>) -> BoxFuture<'static, ServiceResult<Value>> {
        Box::pin(async move {
            match self {
                Self::RegisterProcessor { processor } => {
                    encode(service.register_processor(processor).await?)
                }
                Self::UnregisterProcessor { processor } => {
                    encode(service.unregister_processor(processor).await?)
                }
                Self::Next {
                    processor,
                    last_success,
                } => encode(service.next(processor, last_success).await?),
                Self::ReportSuccess { processor, task } => {
                    encode(service.report_success(processor, task).await?)
                }
                Self::ReportFailure {
                    processor,
                    task,
                    diagnostic,
                } => encode(service.report_failure(processor, task, diagnostic).await?),
                Self::StartProcessors {
                    allocated_cpu,
                    hosts,
                } => encode(service.start_processors(allocated_cpu, hosts).await?),
                Self::StopProcessor { processor } => {
                    encode(service.stop_processor(processor).await?)
                }
                Self::SetMaxClients { max_clients } => {
                    encode(service.set_max_clients(max_clients).await?)
                }
                Self::Status => encode(service.status().await?),
                Self::Shutdown => encode(service.shutdown().await?),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_names_are_in_allow_list() {
        let calls = vec![
            ControllerCall::Status,
            ControllerCall::RetryUnusedHosts,
            ControllerCall::ReportLoad {
                processor: ProcessorId::new("node1", 7),
                load: 1.5,
            },
        ];
        for call in calls {
            assert!(ControllerCall::OPERATIONS.contains(&call.name()));
            let wire = serde_json::to_value(&call).unwrap();
            assert_eq!(wire["op"], call.name());
        }
    }

    #[test]
    fn test_next_wire_format() {
        let call = CoordinatorCall::Next {
            processor: ProcessorId::new("node1", 7),
            last_success: Some(TaskId::from("t3")),
        };
        assert_eq!(
            serde_json::to_value(&call).unwrap(),
            json!({
                "op": "next",
                "args": {"processor": {"host": "node1", "pid": 7}, "last_success": "t3"}
            })
        );
    }

    #[test]
    fn test_release_rule_path_is_optional() {
        let call: ControllerCall = serde_json::from_value(json!({
            "op": "release_rule",
            "args": {"processor": {"host": "node1", "pid": 7}, "key": "hg18"}
        }))
        .unwrap();
        match call {
            ControllerCall::ReleaseRule { path, .. } => assert!(path.is_none()),
            other => panic!("unexpected call {other:?}"),
        }
    }

    #[test]
    fn test_unit_calls_need_no_args() {
        let call: CoordinatorCall = serde_json::from_value(json!({"op": "status"})).unwrap();
        assert_eq!(call.name(), "status");
    }
}

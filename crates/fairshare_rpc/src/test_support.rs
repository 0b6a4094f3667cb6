//! Small operation set used by the transport tests.

use crate::operation::{Operation, encode};
use crate::{ServiceError, ServiceResult};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
pub(crate) struct Recorder {
    calls: AtomicUsize,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", content = "args", rename_all = "snake_case")]
pub(crate) enum Call {
    Echo { text: String },
    Count,
    Fail,
    Explode,
    Stop,
}

impl Operation for Call {
    type Service = Recorder;

    const OPERATIONS: &'static [&'static str] = &["echo", "count", "fail", "explode", "stop"];

    fn name(&self) -> &'static str {
        match self {
            Self::Echo { .. } => "echo",
            Self::Count => "count",
            Self::Fail => "fail",
            Self::Explode => "explode",
            Self::Stop => "stop",
        }
    }

    fn invoke(self, service: Arc<Recorder>) -> BoxFuture<'static, ServiceResult<Value>> {
        Box::pin(async move {
            match self {
                Self::Echo { text } => {
                    service.calls.fetch_add(1, Ordering::SeqCst);
                    encode(text)
                }
                Self::Count => encode(service.calls.load(Ordering::SeqCst)),
                Self::Fail => Err(ServiceError::InvalidRequest("always fails".to_string())),
                Self::Explode => panic!("handler exploded"),
                Self::Stop => Err(ServiceError::terminate("asked to stop")),
            }
        })
    }
}

//! Typed operation sets.
//!
//! A server's callable surface is an enum implementing [`Operation`]. On the
//! wire a call is `{"op": <name>, "args": {...}}`; a reply is either
//! `{"result": <value>}` or the falsy sentinel `false`.

use crate::ServiceResult;
use futures::future::BoxFuture;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Name of the field carrying the operation name
pub const OP_FIELD: &str = "op";

/// Name of the field carrying the operation arguments
pub const ARGS_FIELD: &str = "args";

/// Name of the field carrying a successful reply
pub const RESULT_FIELD: &str = "result";

/// A closed set of remotely callable operations
///
/// Implementors are serde enums tagged with `op` and `args`, so the set of
/// accepted names is fixed at compile time.
pub trait Operation: Serialize + DeserializeOwned + fmt::Debug + Send + 'static {
    /// Service the operations are applied to
    type Service: ?Sized + Send + Sync + 'static;

    /// Every operation name accepted on the wire
    const OPERATIONS: &'static [&'static str];

    /// Wire name of this operation
    fn name(&self) -> &'static str;

    /// Apply the operation to the service
    fn invoke(self, service: Arc<Self::Service>) -> BoxFuture<'static, ServiceResult<Value>>;
}

/// Encode a handler result for the wire
///
/// # Errors
///
/// Returns error if the value cannot be serialized
pub fn encode<T: Serialize>(value: T) -> ServiceResult<Value> {
    serde_json::to_value(value).map_err(|err| crate::ServiceError::Internal(err.to_string()))
}

/// Wrap a successful reply
#[must_use]
pub fn reply(value: Value) -> Value {
    let mut map = serde_json::Map::new();
    map.insert(RESULT_FIELD.to_string(), value);
    Value::Object(map)
}

/// The wire-safe falsy reply
#[must_use]
pub fn sentinel() -> Value {
    Value::Bool(false)
}

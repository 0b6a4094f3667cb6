//! RPC server.
//!
//! Binds an [`Operation`] set to an axum router. Dispatch never fails
//! towards the caller: unknown operations, malformed arguments, handler
//! errors and handler panics are all logged and answered with the falsy
//! sentinel. Only [`ServiceError::Terminate`] escapes, by cancelling the
//! server's shutdown token after the reply is produced.

use crate::operation::{self, ARGS_FIELD, OP_FIELD, Operation};
use crate::{RPC_PATH, ServiceError, TransportError, diagnostic};
use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::Uri;
use axum::routing::post;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

struct ServerState<O: Operation> {
    label: String,
    service: Arc<O::Service>,
    shutdown: CancellationToken,
    _operations: PhantomData<fn() -> O>,
}

/// RPC server for one operation set
pub struct RpcServer<O: Operation> {
    state: Arc<ServerState<O>>,
}

impl<O: Operation> Clone for RpcServer<O> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<O: Operation> RpcServer<O> {
    /// Create a server; `label` names it in logs
    #[must_use]
    pub fn new(label: impl Into<String>, service: Arc<O::Service>) -> Self {
        Self::with_shutdown(label, service, CancellationToken::new())
    }

    /// Create a server that stops when `shutdown` is cancelled
    #[must_use]
    pub fn with_shutdown(
        label: impl Into<String>,
        service: Arc<O::Service>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            state: Arc::new(ServerState {
                label: label.into(),
                service,
                shutdown,
                _operations: PhantomData,
            }),
        }
    }

    /// Token cancelled when the server is asked to terminate
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    /// Dispatch one raw request body and produce the reply
    pub async fn dispatch(&self, body: &[u8]) -> Value {
        dispatch_request(&self.state, body).await
    }

    /// Build the axum router for this server
    #[must_use]
    pub fn router(&self) -> Router {
        Router::new()
            .route(RPC_PATH, post(handle_rpc::<O>))
            .fallback(handle_unknown_route)
            .with_state(Arc::clone(&self.state))
    }

    /// Bind a listener
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be bound
    pub async fn bind(address: &str) -> Result<TcpListener, TransportError> {
        TcpListener::bind(address)
            .await
            .map_err(|err| TransportError::ConnectionFailed {
                address: address.to_string(),
                reason: err.to_string(),
            })
    }

    /// Serve until the shutdown token is cancelled
    ///
    /// # Errors
    ///
    /// Returns error if the listener fails
    pub async fn serve(self, listener: TcpListener) -> Result<(), TransportError> {
        let local: Option<SocketAddr> = listener.local_addr().ok();
        info!(server = %self.state.label, address = ?local, "RPC server listening");

        let router = self.router();
        let shutdown = self.state.shutdown.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(|err| TransportError::ConnectionFailed {
                address: local.map(|a| a.to_string()).unwrap_or_default(),
                reason: err.to_string(),
            })?;

        info!(server = %self.state.label, "RPC server stopped");
        Ok(())
    }

    /// Serve on a background task
    #[must_use]
    pub fn spawn(self, listener: TcpListener) -> JoinHandle<Result<(), TransportError>> {
        tokio::spawn(self.serve(listener))
    }
}

async fn handle_rpc<O: Operation>(
    State(state): State<Arc<ServerState<O>>>,
    body: Bytes,
) -> Json<Value> {
    Json(dispatch_request(&state, &body).await)
}

async fn handle_unknown_route(uri: Uri) -> Json<Value> {
    warn!(%uri, "rejected request to unknown route");
    Json(operation::sentinel())
}

async fn dispatch_request<O: Operation>(state: &ServerState<O>, body: &[u8]) -> Value {
    let request: Value = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(err) => {
            warn!(server = %state.label, error = %err, "rejected undecodable request");
            return operation::sentinel();
        }
    };

    let name = request
        .get(OP_FIELD)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if !O::OPERATIONS.contains(&name.as_str()) {
        warn!(server = %state.label, op = %name, "rejected call to unknown operation");
        return operation::sentinel();
    }

    let args = request.get(ARGS_FIELD).cloned().unwrap_or(Value::Null);
    let call: O = match serde_json::from_value(request) {
        Ok(call) => call,
        Err(err) => {
            warn!(server = %state.label, op = %name, error = %err, "rejected malformed arguments");
            return operation::sentinel();
        }
    };

    info!(
        target: "fairshare_rpc::audit",
        server = %state.label,
        op = %name,
        at = %chrono::Utc::now().to_rfc3339(),
        args = %args,
        "call"
    );

    let service = Arc::clone(&state.service);
    match AssertUnwindSafe(call.invoke(service)).catch_unwind().await {
        Ok(Ok(value)) => operation::reply(value),
        Ok(Err(ServiceError::Terminate { reason })) => {
            warn!(server = %state.label, op = %name, %reason, "termination requested");
            state.shutdown.cancel();
            operation::reply(Value::Bool(true))
        }
        Ok(Err(err)) => {
            error!(server = %state.label, op = %name, diagnostic = %diagnostic(&err), "operation failed");
            operation::sentinel()
        }
        Err(panic) => {
            error!(server = %state.label, op = %name, panic = %panic_message(panic.as_ref()), "operation panicked");
            operation::sentinel()
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

//! RPC client and per-component connection pool.

use crate::operation::{Operation, RESULT_FIELD};
use crate::{RPC_PATH, TransportError};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

/// Default request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for one remote server
#[derive(Clone)]
pub struct RpcClient {
    /// Address as given by the caller (`host:port` or a URL)
    address: String,
    /// Full URL of the RPC endpoint
    url: String,
    /// Shared HTTP client
    http: reqwest::Client,
    /// Request timeout
    timeout: Duration,
}

impl RpcClient {
    /// Create a client with its own HTTP connection pool
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self::with_http(address, reqwest::Client::new())
    }

    /// Create a client sharing an existing HTTP client
    #[must_use]
    pub fn with_http(address: impl Into<String>, http: reqwest::Client) -> Self {
        let address = address.into();
        Self {
            url: endpoint_url(&address),
            address,
            http,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Address this client talks to
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Call an operation and decode its reply
    ///
    /// # Errors
    ///
    /// Returns error if the server is unreachable, times out, answers with
    /// the falsy sentinel, or replies with something undecodable
    pub async fn call<O, R>(&self, operation: &O) -> Result<R, TransportError>
    where
        O: Operation,
        R: DeserializeOwned,
    {
        let response = self
            .http
            .post(&self.url)
            .timeout(self.timeout)
            .json(operation)
            .send()
            .await
            .map_err(|err| self.request_error(&err))?;

        if !response.status().is_success() {
            return Err(TransportError::InvalidResponse {
                address: self.address.clone(),
                reason: format!("HTTP status {}", response.status()),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|err| self.request_error(&err))?;
        decode_reply(&self.address, operation.name(), body)
    }

    fn request_error(&self, err: &reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout {
                address: self.address.clone(),
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else if err.is_decode() {
            TransportError::InvalidResponse {
                address: self.address.clone(),
                reason: err.to_string(),
            }
        } else {
            TransportError::ConnectionFailed {
                address: self.address.clone(),
                reason: err.to_string(),
            }
        }
    }
}

/// Turn `host:port` or a base URL into the RPC endpoint URL
#[must_use]
pub fn endpoint_url(address: &str) -> String {
    let base = address.trim_end_matches('/');
    if base.contains("://") {
        format!("{}{}", base, RPC_PATH)
    } else {
        format!("http://{}{}", base, RPC_PATH)
    }
}

/// Decode a wire reply
///
/// # Errors
///
/// Returns [`TransportError::Rejected`] for the falsy sentinel and
/// [`TransportError::InvalidResponse`] for anything else unexpected
pub fn decode_reply<R: DeserializeOwned>(
    address: &str,
    op: &str,
    body: Value,
) -> Result<R, TransportError> {
    match body {
        Value::Object(mut map) => {
            let result = map
                .remove(RESULT_FIELD)
                .ok_or_else(|| TransportError::InvalidResponse {
                    address: address.to_string(),
                    reason: format!("reply to {} has no result", op),
                })?;
            serde_json::from_value(result)
                .map_err(|err| TransportError::Serialization(format!("{}: {}", op, err)))
        }
        Value::Bool(false) => Err(TransportError::Rejected {
            address: address.to_string(),
            op: op.to_string(),
        }),
        other => Err(TransportError::InvalidResponse {
            address: address.to_string(),
            reason: format!("unexpected reply to {}: {}", op, other),
        }),
    }
}

/// Connection pool keyed by address, owned by one component
pub struct ConnectionPool {
    /// HTTP client shared by every pooled connection
    http: reqwest::Client,
    /// Timeout applied to pooled clients
    timeout: Duration,
    /// Clients by address
    clients: RwLock<HashMap<String, RpcClient>>,
}

impl ConnectionPool {
    /// Create a pool whose clients use `timeout`
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            timeout,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Get the client for an address, creating it on first use
    pub async fn client(&self, address: &str) -> RpcClient {
        if let Some(client) = self.clients.read().await.get(address) {
            return client.clone();
        }
        let mut clients = self.clients.write().await;
        clients
            .entry(address.to_string())
            .or_insert_with(|| {
                RpcClient::with_http(address, self.http.clone()).with_timeout(self.timeout)
            })
            .clone()
    }

    /// Drop the client for an address
    pub async fn evict(&self, address: &str) -> bool {
        self.clients.write().await.remove(address).is_some()
    }

    /// Number of pooled clients
    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Whether the pool is empty
    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

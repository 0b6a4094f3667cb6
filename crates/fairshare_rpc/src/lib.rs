//! FAIRSHARE RPC
//!
//! Restricted remote-procedure calls over HTTP. Every server exposes a
//! fixed operation set described by an [`Operation`] enum; anything outside
//! that set is rejected with a falsy sentinel instead of an error, and no
//! handler failure can take the serving loop down.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod error;
pub mod operation;
pub mod server;

pub use client::{ConnectionPool, RpcClient};
pub use error::{ServiceError, ServiceResult, TransportError, diagnostic};
pub use operation::{Operation, encode};
pub use server::RpcServer;

/// HTTP path every server accepts calls on
pub const RPC_PATH: &str = "/rpc";

#[cfg(test)]
mod test_support;

//! FAIRSHARE Core Types
//!
//! Pure types shared by every tier of the job coordination system:
//! identifiers, the core error type, and the static host table.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod host;
pub mod id;

// Re-exports
pub use error::{CoreError, CoreResult};
pub use host::{HostInfo, HostTable};
pub use id::{JobId, ProcessorId, TaskId};

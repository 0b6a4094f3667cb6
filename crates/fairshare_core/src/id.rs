//! Identifiers for FAIRSHARE entities.
//!
//! Task IDs are opaque strings produced by a work source. Processors are
//! identified by the host they run on plus their operating-system pid.

use crate::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Task identifier - one opaque unit of work from a work source
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Create a task ID
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw identifier
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Processor identifier - a worker process on a host
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessorId {
    /// Host the processor runs on
    pub host: String,
    /// Operating-system process ID
    pub pid: u32,
}

impl ProcessorId {
    /// Create a processor ID
    #[must_use]
    pub fn new(host: impl Into<String>, pid: u32) -> Self {
        Self {
            host: host.into(),
            pid,
        }
    }

    /// Identify the current process running on `host`
    #[must_use]
    pub fn current(host: impl Into<String>) -> Self {
        Self::new(host, std::process::id())
    }
}

impl fmt::Display for ProcessorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.pid)
    }
}

impl FromStr for ProcessorId {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        let (host, pid) = s.rsplit_once(':').ok_or_else(|| CoreError::InvalidId {
            reason: format!("expected host:pid, got {:?}", s),
        })?;
        if host.is_empty() {
            return Err(CoreError::InvalidId {
                reason: format!("empty host in {:?}", s),
            });
        }
        let pid = pid.parse().map_err(|_| CoreError::InvalidId {
            reason: format!("invalid pid in {:?}", s),
        })?;
        Ok(Self::new(host, pid))
    }
}

/// Job identifier - orders jobs for fair-share admission (lower is older)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(u64);

impl JobId {
    /// Create a job ID
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the numeric value
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The job ID following this one
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job_{}", self.0)
    }
}

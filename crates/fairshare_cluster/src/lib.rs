//! FAIRSHARE Cluster
//!
//! The three tiers of a fair-share batch system: a cluster-wide
//! [`ResourceController`] dividing CPUs among jobs, one [`Coordinator`] per
//! job handing out task IDs, and [`Processor`] workers running them.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod client;
pub mod controller;
pub mod coordinator;
pub mod executor;
pub mod journal;
pub mod launcher;
pub mod ops;
pub mod processor;
pub mod rules;
pub mod source;

pub use api::{
    ControllerService, ControllerStatus, CoordinatorConnector, CoordinatorRegistration,
    CoordinatorService, CoordinatorStatus, ResourceRule, ResourceStatus, RuleGrant,
};
pub use client::{ControllerClient, CoordinatorClient, HttpConnector};
pub use controller::{ControllerConfig, ResourceController};
pub use coordinator::{Coordinator, CoordinatorConfig, CoordinatorError};
pub use executor::{
    FnExecutor, LoadAverage, LoadProbe, ResourceBuilder, ShellBuilder, ShellExecutor,
    TaskExecutor,
};
pub use journal::TaskJournal;
pub use launcher::{LaunchCommand, LaunchError, LaunchHandle, Launcher, LocalLauncher, SshLauncher};
pub use ops::{ControllerCall, CoordinatorCall};
pub use processor::{Processor, ProcessorConfig, ProcessorError, RunSummary};
pub use rules::RuleStore;
pub use source::{ListSource, TaskFileSource, WorkSource};

#[cfg(test)]
mod testing;

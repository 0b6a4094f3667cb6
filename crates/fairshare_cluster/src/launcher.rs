//! Starting processor processes on worker hosts.
//!
//! A launch never waits for the processor: the child is spawned with its
//! output redirected to a per-launch log file and a background task reaps
//! it. The processor acknowledges the launch by registering with its
//! coordinator.

use async_trait::async_trait;
use fairshare_core::HostInfo;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Environment variable naming the SSH agent socket
pub const SSH_AGENT_ENV: &str = "SSH_AUTH_SOCK";

/// Command line of a processor to start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchCommand {
    /// Executable
    pub program: String,
    /// Arguments
    pub args: Vec<String>,
    /// File receiving the processor's stdout and stderr
    pub log_path: PathBuf,
}

impl LaunchCommand {
    /// Create a command with no arguments
    #[must_use]
    pub fn new(program: impl Into<String>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            log_path: log_path.into(),
        }
    }

    /// Append an argument
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append arguments
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Single shell-safe string for remote execution
    #[must_use]
    pub fn to_shell(&self) -> String {
        std::iter::once(&self.program)
            .chain(&self.args)
            .map(|word| shell_quote(word))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A started processor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchHandle {
    /// Launch ID
    pub id: Uuid,
    /// Target host
    pub host: String,
    /// Local pid of the spawned child, when there is one
    pub pid: Option<u32>,
    /// Launch log
    pub log_path: PathBuf,
}

impl LaunchHandle {
    /// Create a handle for a launch on `host`
    #[must_use]
    pub fn new(host: impl Into<String>, pid: Option<u32>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            host: host.into(),
            pid,
            log_path: log_path.into(),
        }
    }
}

/// Launch errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LaunchError {
    /// No SSH agent to authenticate remote logins
    #[error("No SSH agent available: SSH_AUTH_SOCK {reason}")]
    AgentUnavailable {
        /// What is wrong with the agent socket
        reason: String,
    },

    /// Launch log could not be created
    #[error("Cannot create launch log {path}: {reason}")]
    Log {
        /// Log path
        path: String,
        /// Reason
        reason: String,
    },

    /// Process could not be spawned
    #[error("Failed to launch on {host}: {reason}")]
    Spawn {
        /// Target host
        host: String,
        /// Reason
        reason: String,
    },
}

/// Starts processors on hosts
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Check that launches can work at all
    ///
    /// # Errors
    ///
    /// Returns error if no launch could succeed
    fn preflight(&self) -> Result<(), LaunchError> {
        Ok(())
    }

    /// Start `command` on `host` without waiting for it
    async fn launch(&self, host: &HostInfo, command: &LaunchCommand) -> Result<LaunchHandle, LaunchError>;
}

/// Launches processors over `ssh`
#[derive(Debug, Clone)]
pub struct SshLauncher {
    program: String,
}

impl SshLauncher {
    /// Create a launcher using the `ssh` found on `PATH`
    #[must_use]
    pub fn new() -> Self {
        Self::with_program("ssh")
    }

    /// Create a launcher using a specific ssh client
    #[must_use]
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, host: &HostInfo, command: &LaunchCommand) -> Command {
        let mut ssh = Command::new(&self.program);
        ssh.arg("-n")
            .args(host.login_options.split_whitespace())
            .arg(&host.name)
            .arg(command.to_shell());
        ssh
    }
}

impl Default for SshLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Launcher for SshLauncher {
    fn preflight(&self) -> Result<(), LaunchError> {
        let socket = std::env::var_os(SSH_AGENT_ENV).ok_or_else(|| LaunchError::AgentUnavailable {
            reason: "is not set".to_string(),
        })?;
        if !Path::new(&socket).exists() {
            return Err(LaunchError::AgentUnavailable {
                reason: format!("points at missing socket {}", Path::new(&socket).display()),
            });
        }
        Ok(())
    }

    async fn launch(&self, host: &HostInfo, command: &LaunchCommand) -> Result<LaunchHandle, LaunchError> {
        spawn_detached(self.command(host, command), &host.name, &command.log_path)
    }
}

/// Launches processors as local child processes, ignoring the host name
///
/// For single-machine runs where every host entry is an alias of localhost.
#[derive(Debug, Clone, Default)]
pub struct LocalLauncher;

#[async_trait]
impl Launcher for LocalLauncher {
    async fn launch(&self, host: &HostInfo, command: &LaunchCommand) -> Result<LaunchHandle, LaunchError> {
        let mut child = Command::new(&command.program);
        child.args(&command.args);
        spawn_detached(child, &host.name, &command.log_path)
    }
}

fn spawn_detached(mut command: Command, host: &str, log_path: &Path) -> Result<LaunchHandle, LaunchError> {
    let log_error = |e: std::io::Error| LaunchError::Log {
        path: log_path.display().to_string(),
        reason: e.to_string(),
    };
    let stdout = std::fs::File::create(log_path).map_err(log_error)?;
    let stderr = stdout.try_clone().map_err(log_error)?;

    let mut child = command
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .spawn()
        .map_err(|e| LaunchError::Spawn {
            host: host.to_string(),
            reason: e.to_string(),
        })?;
    let handle = LaunchHandle::new(host, child.id(), log_path);
    info!(host, launch = %handle.id, log = %log_path.display(), "processor launched");

    let host = host.to_string();
    let id = handle.id;
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) if status.success() => debug!(%host, launch = %id, "launched processor exited"),
            Ok(status) => warn!(%host, launch = %id, %status, "launched processor exited abnormally"),
            Err(err) => warn!(%host, launch = %id, error = %err, "lost track of launched processor"),
        }
    });
    Ok(handle)
}

/// Quote `word` for a POSIX shell
#[must_use]
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+%".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

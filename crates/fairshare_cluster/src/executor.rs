//! User code run by a processor: task executors, resource builders and the
//! host load probe.

use crate::api::ResourceRule;
use anyhow::{Context, bail};
use async_trait::async_trait;
use fairshare_core::TaskId;
use std::path::PathBuf;
use tokio::process::Command;

/// Placeholder replaced by the task ID in shell templates
pub const TASK_PLACEHOLDER: &str = "{task}";

/// Environment variable carrying a rule's target path to its build command
pub const TARGET_ENV: &str = "FAIRSHARE_TARGET";

/// Runs one task
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run `task` to completion
    ///
    /// # Errors
    ///
    /// Any error is reported to the coordinator as the task's failure
    async fn execute(&self, task: &TaskId) -> anyhow::Result<()>;
}

/// Executor backed by a closure
pub struct FnExecutor<F> {
    run: F,
}

impl<F> FnExecutor<F>
where
    F: Fn(&TaskId) -> anyhow::Result<()> + Send + Sync,
{
    /// Wrap `run`
    pub fn new(run: F) -> Self {
        Self { run }
    }
}

#[async_trait]
impl<F> TaskExecutor for FnExecutor<F>
where
    F: Fn(&TaskId) -> anyhow::Result<()> + Send + Sync,
{
    async fn execute(&self, task: &TaskId) -> anyhow::Result<()> {
        (self.run)(task)
    }
}

/// Runs a shell command per task, with `{task}` replaced by the task ID
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    template: String,
}

impl ShellExecutor {
    /// Create an executor for `template`
    #[must_use]
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Command line for `task`
    #[must_use]
    pub fn render(&self, task: &TaskId) -> String {
        self.template.replace(TASK_PLACEHOLDER, task.as_str())
    }
}

#[async_trait]
impl TaskExecutor for ShellExecutor {
    async fn execute(&self, task: &TaskId) -> anyhow::Result<()> {
        let script = self.render(task);
        run_shell(&script, &[]).await.with_context(|| format!("task {task}"))
    }
}

/// Materializes a shared resource from its rule
#[async_trait]
pub trait ResourceBuilder: Send + Sync {
    /// Build `key` from `rule` and return the resulting path
    ///
    /// # Errors
    ///
    /// Returns error if the build fails; the lock is released without a path
    async fn build(&self, key: &str, rule: &ResourceRule) -> anyhow::Result<String>;
}

/// Runs the rule's command in a shell and yields the rule's target
#[derive(Debug, Clone, Default)]
pub struct ShellBuilder;

#[async_trait]
impl ResourceBuilder for ShellBuilder {
    async fn build(&self, key: &str, rule: &ResourceRule) -> anyhow::Result<String> {
        run_shell(&rule.command, &[(TARGET_ENV, rule.target.as_str())])
            .await
            .with_context(|| format!("building resource {key}"))?;
        Ok(rule.target.clone())
    }
}

async fn run_shell(script: &str, env: &[(&str, &str)]) -> anyhow::Result<()> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(script)
        .envs(env.iter().copied())
        .output()
        .await
        .context("spawning sh")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("`{}` failed with {}: {}", script, output.status, stderr.trim());
    }
    Ok(())
}

/// Measures the load of the local host
#[async_trait]
pub trait LoadProbe: Send + Sync {
    /// Current load
    ///
    /// # Errors
    ///
    /// Returns error if the load cannot be read
    async fn load(&self) -> anyhow::Result<f64>;
}

/// One-minute load average from `/proc/loadavg`
#[derive(Debug, Clone)]
pub struct LoadAverage {
    path: PathBuf,
}

impl LoadAverage {
    /// Probe the running kernel
    #[must_use]
    pub fn new() -> Self {
        Self::from_path("/proc/loadavg")
    }

    /// Probe a file in `/proc/loadavg` format
    #[must_use]
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for LoadAverage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LoadProbe for LoadAverage {
    async fn load(&self) -> anyhow::Result<f64> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        let first = text
            .split_whitespace()
            .next()
            .with_context(|| format!("{} is empty", self.path.display()))?;
        first
            .parse()
            .with_context(|| format!("bad load average {first:?}"))
    }
}

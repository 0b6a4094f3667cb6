//! Task ID streams consumed by a coordinator.

use async_trait::async_trait;
use fairshare_core::{CoreError, CoreResult, TaskId};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tracing::warn;

/// Lazy stream of task IDs
#[async_trait]
pub trait WorkSource: Send {
    /// Next task ID, or `None` once drained
    async fn next_task(&mut self) -> Option<TaskId>;
}

/// In-memory list of task IDs
#[derive(Debug, Clone, Default)]
pub struct ListSource {
    tasks: VecDeque<TaskId>,
}

impl ListSource {
    /// Create a source over `tasks`
    pub fn new<I, T>(tasks: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        Self {
            tasks: tasks.into_iter().map(Into::into).collect(),
        }
    }

    /// Tasks not yet handed out
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.tasks.len()
    }
}

#[async_trait]
impl WorkSource for ListSource {
    async fn next_task(&mut self) -> Option<TaskId> {
        self.tasks.pop_front()
    }
}

/// Task IDs read one per line from a file
///
/// Surrounding whitespace is trimmed; blank lines and `#` comments are
/// skipped. Lines are read on demand, so arbitrarily large task lists do
/// not have to fit in memory.
pub struct TaskFileSource {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
}

impl TaskFileSource {
    /// Open a task file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be opened
    pub fn open(path: &Path) -> CoreResult<Self> {
        let file = std::fs::File::open(path).map_err(|e| CoreError::io(path, &e))?;
        Ok(Self {
            path: path.to_path_buf(),
            lines: BufReader::new(File::from_std(file)).lines(),
        })
    }
}

#[async_trait]
impl WorkSource for TaskFileSource {
    async fn next_task(&mut self) -> Option<TaskId> {
        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    return Some(TaskId::from(line));
                }
                Ok(None) => return None,
                Err(err) => {
                    warn!(path = %self.path.display(), error = %err, "task file unreadable, treating as drained");
                    return None;
                }
            }
        }
    }
}

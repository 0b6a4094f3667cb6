//! Durable success and error logs of a coordinator.
//!
//! `<name>.success` is append-only and replayed at startup, so a restarted
//! job never reissues a completed task. `<name>.error` is truncated each run.
//! Both hold one tab-separated record per line: task ID, processor, and for
//! errors a diagnostic with line breaks flattened. The task ID is written as a
//! JSON string so that any ID, whitespace and tabs included, replays exactly.
//! A first field that is not a JSON string is taken verbatim, which keeps
//! hand-written logs usable.

use fairshare_core::{CoreError, CoreResult, ProcessorId, TaskId};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::info;

/// Success and error logs of one job
pub struct TaskJournal {
    success_path: PathBuf,
    error_path: PathBuf,
    success: File,
    errors: File,
    completed: HashSet<TaskId>,
}

impl TaskJournal {
    /// Open the logs of job `name` in `dir`, replaying earlier successes
    ///
    /// # Errors
    ///
    /// Returns error if either log cannot be read or created
    pub async fn open(dir: &Path, name: &str) -> CoreResult<Self> {
        let success_path = dir.join(format!("{name}.success"));
        let error_path = dir.join(format!("{name}.error"));

        let completed = match tokio::fs::read_to_string(&success_path).await {
            Ok(text) => text
                .lines()
                .filter(|line| !line.is_empty())
                .map(decode_task)
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
            Err(e) => return Err(CoreError::io(&success_path, &e)),
        };
        if !completed.is_empty() {
            info!(job = name, completed = completed.len(), "replayed success log");
        }

        let success = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&success_path)
            .await
            .map_err(|e| CoreError::io(&success_path, &e))?;
        let errors = File::create(&error_path)
            .await
            .map_err(|e| CoreError::io(&error_path, &e))?;

        Ok(Self {
            success_path,
            error_path,
            success,
            errors,
            completed,
        })
    }

    /// Whether `task` completed in this or an earlier run
    #[must_use]
    pub fn is_completed(&self, task: &TaskId) -> bool {
        self.completed.contains(task)
    }

    /// Number of completed tasks
    #[must_use]
    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Append a success record
    ///
    /// # Errors
    ///
    /// Returns error if the record cannot be written
    pub async fn record_success(&mut self, task: &TaskId, processor: &ProcessorId) -> CoreResult<()> {
        let line = format!("{}\t{}\n", encode_task(task)?, processor);
        write_line(&mut self.success, &self.success_path, &line).await?;
        self.completed.insert(task.clone());
        Ok(())
    }

    /// Append an error record
    ///
    /// # Errors
    ///
    /// Returns error if the record cannot be written
    pub async fn record_failure(
        &mut self,
        task: &TaskId,
        processor: &ProcessorId,
        diagnostic: &str,
    ) -> CoreResult<()> {
        let line = format!("{}\t{}\t{}\n", encode_task(task)?, processor, flatten(diagnostic));
        write_line(&mut self.errors, &self.error_path, &line).await
    }

    /// Path of the success log
    #[must_use]
    pub fn success_path(&self) -> &Path {
        &self.success_path
    }

    /// Path of the error log
    #[must_use]
    pub fn error_path(&self) -> &Path {
        &self.error_path
    }
}

async fn write_line(file: &mut File, path: &Path, line: &str) -> CoreResult<()> {
    file.write_all(line.as_bytes())
        .await
        .map_err(|e| CoreError::io(path, &e))?;
    file.flush().await.map_err(|e| CoreError::io(path, &e))
}

fn encode_task(task: &TaskId) -> CoreResult<String> {
    Ok(serde_json::to_string(task)?)
}

// JSON escapes tabs, so the first tab always ends the task field
fn decode_task(line: &str) -> TaskId {
    let field = line.split_once('\t').map_or(line, |(task, _)| task);
    serde_json::from_str(field).unwrap_or_else(|_| TaskId::from(field))
}

fn flatten(text: &str) -> String {
    text.replace(['\n', '\r', '\t'], " ")
}

//! Per-job append-only execution log.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::error;

/// An append-only log file owned by a single job.
///
/// Every line is `"{task_id} {YYYY-mm-dd HH:MM:SS}: {message}"`. Writes to a
/// closed log, or to a file removed out-of-band, are skipped and reported to
/// the process log instead.
#[derive(Debug)]
pub struct JobLog {
    task_id: String,
    path: PathBuf,
    file: Option<File>,
}

impl JobLog {
    /// Allocate a fresh, uniquely named log file inside `dir`.
    pub fn create(dir: &Path, task_id: &str) -> io::Result<Self> {
        let (_, path) = tempfile::Builder::new()
            .prefix("job-")
            .suffix(".log")
            .tempfile_in(dir)?
            .keep()?;
        let file = OpenOptions::new().append(true).open(&path)?;
        Ok(Self {
            task_id: task_id.to_string(),
            path,
            file: Some(file),
        })
    }

    /// Reattach to an existing log file, e.g. for a job recovered from the
    /// store. Returns `None` if the file is gone.
    pub fn reopen(path: impl Into<PathBuf>, task_id: &str) -> Option<Self> {
        let path = path.into();
        let file = OpenOptions::new().append(true).open(&path).ok()?;
        Some(Self {
            task_id: task_id.to_string(),
            path,
            file: Some(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn write(&mut self, message: &str) {
        let Some(file) = self.file.as_mut() else {
            error!(task_id = %self.task_id, line = message, "cannot log: logfile is closed");
            return;
        };
        if !self.path.exists() {
            error!(
                task_id = %self.task_id,
                path = %self.path.display(),
                line = message,
                "cannot log: logfile does not exist"
            );
            return;
        }

        let line = format!(
            "{} {}: {}\n",
            self.task_id,
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            message
        );
        if let Err(e) = file.write_all(line.as_bytes()).and_then(|_| file.flush()) {
            error!(task_id = %self.task_id, "log write failed: {e}");
        }
    }

    pub fn close(&mut self) {
        self.file = None;
    }
}

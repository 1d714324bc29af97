use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a job.
///
/// `Queued -> InProgress -> {Done, Stopped}` and `Queued -> Stopped`.
/// `Done` and `Stopped` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Registered and waiting for a worker slot.
    Queued,
    /// A worker is executing the work function.
    InProgress,
    /// Stopped by an operator before it could finish.
    Stopped,
    /// Work function returned (successfully or not).
    Done,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Stopped | JobStatus::Done)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::InProgress)
                | (JobStatus::Queued, JobStatus::Stopped)
                | (JobStatus::InProgress, JobStatus::Stopped)
                | (JobStatus::InProgress, JobStatus::Done)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::InProgress => "in_progress",
            JobStatus::Stopped => "stopped",
            JobStatus::Done => "done",
        };
        f.pad(s)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "in_progress" => Ok(JobStatus::InProgress),
            "stopped" => Ok(JobStatus::Stopped),
            "done" => Ok(JobStatus::Done),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A persisted job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// UUID v4 string, primary key.
    pub task_id: String,
    /// Display name, the first job argument.
    pub name: String,
    /// Full argument list.
    pub args: Vec<String>,
    pub status: JobStatus,
    /// Path of the append-only execution log, if one could be created.
    pub logfile: Option<String>,
    /// 0..=100
    pub progress: u8,
    /// Owning user. `None` means the job was started by the system.
    pub user_id: Option<String>,
    pub created: String,
    pub started: Option<String>,
    pub done: Option<String>,
}

/// Outcome category of an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "NOK")]
    Nok,
}

impl std::fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            AuditStatus::Ok => "OK",
            AuditStatus::Nok => "NOK",
        })
    }
}

impl std::str::FromStr for AuditStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "OK" => Ok(AuditStatus::Ok),
            "NOK" => Ok(AuditStatus::Nok),
            other => Err(format!("unknown audit status: {other}")),
        }
    }
}

/// A structured policy-outcome record, independent of any job log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub by_user: String,
    pub category: String,
    pub description: String,
    pub status: AuditStatus,
    pub created: String,
}

/// Result handed back to operators for stop/delete requests.
///
/// Engine-internal failures never escape as errors from these calls; they
/// are folded into `success = false` with a readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutcome {
    pub success: bool,
    pub message: String,
}

impl CommandOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Canonical persisted timestamp: UTC, fixed microsecond precision, so
/// string order equals time order in SQL comparisons.
pub fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn now_ts() -> String {
    format_ts(Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn status_strings_parse_back() {
        for status in [
            JobStatus::Queued,
            JobStatus::InProgress,
            JobStatus::Stopped,
            JobStatus::Done,
        ] {
            assert_eq!(status.to_string().parse::<JobStatus>(), Ok(status));
        }
        assert!("IN PROGRESS".parse::<JobStatus>().is_err());
    }

    #[test]
    fn terminal_states_have_no_way_out() {
        for next in [JobStatus::Queued, JobStatus::InProgress, JobStatus::Done] {
            assert!(!JobStatus::Stopped.can_transition_to(next));
        }
        for next in [JobStatus::Queued, JobStatus::InProgress, JobStatus::Stopped] {
            assert!(!JobStatus::Done.can_transition_to(next));
        }
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Done));
    }

    #[test]
    fn timestamps_sort_chronologically() {
        let base = Utc::now();
        let earlier = format_ts(base);
        let later = format_ts(base + Duration::milliseconds(1));
        assert!(earlier < later);
        assert!(earlier.ends_with('Z'));
    }
}

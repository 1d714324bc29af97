//! One-shot operator commands. Each runs against a registry freshly
//! recovered from the store, so it sees jobs owned by a running `serve`.

use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Subcommand, ValueEnum};
use jobhost_core::config::CleanupTarget;
use jobhost_core::JobhostConfig;
use jobhost_jobs::kinds::{
    CleanupJob, DailyStat, DbStatJob, EmptyJob, HealthCheckJob, HealthSnapshot, SnapshotKind,
    TableCount, UsageStatsJob,
};
use jobhost_jobs::{
    AuditEntry, AuditStatus, CommandOutcome, CommandProcessor, Job, JobRecord, JobRegistry,
    JobStatus,
};
use serde::Serialize;

/// Most lines `jobhost log` prints.
pub const MAX_TAIL_LINES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopTarget {
    Job(String),
    AllActive,
    AllQueued,
}

impl FromStr for StopTarget {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "all-active" => StopTarget::AllActive,
            "all-queued" => StopTarget::AllQueued,
            id => StopTarget::Job(id.to_string()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteTarget {
    Job(String),
    AllStopped,
    AllDone,
}

impl FromStr for DeleteTarget {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "all-stopped" => DeleteTarget::AllStopped,
            "all-done" => DeleteTarget::AllDone,
            id => DeleteTarget::Job(id.to_string()),
        })
    }
}

/// Job kinds an operator can run on demand.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum RunKind {
    /// Timed no-op that reports progress every step
    Empty {
        #[arg(default_value = "manual")]
        label: String,
        #[arg(long, default_value_t = 60)]
        steps: u32,
        /// Milliseconds per step
        #[arg(long, default_value_t = 1000)]
        step_ms: u64,
    },
    /// Record a health snapshot
    Health,
    /// Aggregate new access rows into usage statistics
    UsageStats,
    /// Purge rows of TABLE older than DAYS
    Cleanup { table: String, days: i64 },
    /// Record the row count of every table
    DbStat,
}

pub fn build_job(kind: &RunKind, config: &JobhostConfig) -> Job {
    match kind {
        RunKind::Empty {
            label,
            steps,
            step_ms,
        } => Job::new(
            vec!["empty".to_string(), label.clone()],
            EmptyJob::with_timing(*steps, Duration::from_millis(*step_ms)),
        ),
        RunKind::Health => HealthCheckJob::job(&config.health),
        RunKind::UsageStats => UsageStatsJob::job(&config.stats),
        RunKind::Cleanup { table, days } => CleanupJob::job(&CleanupTarget {
            table: table.clone(),
            retention_days: *days,
        }),
        RunKind::DbStat => DbStatJob::job(SnapshotKind::Adhoc),
    }
}

/// Submit `job` to a processor without workers and drain it on this thread.
///
/// `on_queued` sees the task id before the job starts, so callers can print
/// it while the job runs.
pub fn run(
    registry: Arc<JobRegistry>,
    job: Job,
    on_queued: impl FnOnce(&Job),
) -> jobhost_jobs::Result<CommandOutcome> {
    let processor = CommandProcessor::new(registry.clone());
    processor.start(0)?;
    let job = Arc::new(job);
    processor.submit(job.clone())?;
    on_queued(&job);
    processor.drain();

    let task_id = job.task_id();
    Ok(match registry.store().status_of(task_id)? {
        Some(JobStatus::Done) => CommandOutcome::ok(format!("OK: job {task_id} done")),
        Some(status) => CommandOutcome::failed(format!("Error: job {task_id} ended {status}")),
        None => CommandOutcome::failed(format!("Error: job {task_id} not found")),
    })
}

/// Last `lines` lines of a job's log.
pub fn tail_log(registry: &JobRegistry, task_id: &str, lines: usize) -> anyhow::Result<String> {
    if lines == 0 || lines > MAX_TAIL_LINES {
        anyhow::bail!("Error: line count must be between 1 and {MAX_TAIL_LINES}");
    }
    let Some(path) = registry.get_logfile(task_id) else {
        anyhow::bail!("Error: no logfile for job {task_id}");
    };
    let text = std::fs::read_to_string(&path)?;
    let all: Vec<&str> = text.lines().collect();
    Ok(all[all.len().saturating_sub(lines)..].join("\n"))
}

/// The `limit` most recent audit entries, oldest first. With `nok_only`,
/// only entries that did not succeed.
pub fn recent_audit(entries: Vec<AuditEntry>, nok_only: bool, limit: usize) -> Vec<AuditEntry> {
    let mut picked: Vec<_> = entries
        .into_iter()
        .filter(|e| !nok_only || e.status != AuditStatus::Ok)
        .take(limit)
        .collect();
    picked.reverse();
    picked
}

pub fn stop(registry: &JobRegistry, target: &StopTarget) -> CommandOutcome {
    match target {
        StopTarget::Job(id) => registry.stop_job(id),
        StopTarget::AllActive => {
            let n = registry.stop_all(JobStatus::InProgress);
            CommandOutcome::ok(format!("OK: {n} active jobs stopped"))
        }
        StopTarget::AllQueued => {
            let n = registry.stop_all(JobStatus::Queued);
            CommandOutcome::ok(format!("OK: {n} queued jobs stopped"))
        }
    }
}

pub fn delete(registry: &JobRegistry, target: &DeleteTarget) -> CommandOutcome {
    match target {
        DeleteTarget::Job(id) => registry.delete_job(id),
        DeleteTarget::AllStopped => {
            let n = registry.del_all(JobStatus::Stopped);
            CommandOutcome::ok(format!("OK: {n} stopped jobs deleted"))
        }
        DeleteTarget::AllDone => {
            let n = registry.del_all(JobStatus::Done);
            CommandOutcome::ok(format!("OK: {n} done jobs deleted"))
        }
    }
}

pub fn render_jobs(records: &[JobRecord], format: OutputFormat) -> anyhow::Result<String> {
    if format == OutputFormat::Json {
        return json(records);
    }
    if records.is_empty() {
        return Ok("No jobs found.".to_string());
    }

    let mut out = format!(
        "{:<36}  {:<14}  {:<11}  {:>4}  {:<12}  {}\n",
        "TASK ID", "NAME", "STATUS", "PCT", "USER", "CREATED"
    );
    for r in records {
        let _ = writeln!(
            out,
            "{:<36}  {:<14}  {:<11}  {:>4}  {:<12}  {}",
            r.task_id,
            r.name,
            r.status,
            r.progress,
            r.user_id.as_deref().unwrap_or("-"),
            r.created
        );
    }
    Ok(out.trim_end().to_string())
}

pub fn render_health(snapshot: Option<&HealthSnapshot>, format: OutputFormat) -> anyhow::Result<String> {
    let Some(s) = snapshot else {
        return Ok("No health snapshot recorded yet.".to_string());
    };
    if format == OutputFormat::Json {
        return json(s);
    }
    let probe = match s.response_time {
        t if t < 0.0 => "failed".to_string(),
        t if t == 0.0 => "disabled".to_string(),
        t => format!("{t:.3}s"),
    };
    Ok(format!(
        "Taken:        {}\nMemory:       {:.2} MiB\nQueued jobs:  {}\nActive jobs:  {}\nActive users: {}\nAudit rows:   {}\nProbe:        {probe}",
        s.created, s.mem_mb, s.queued_jobs, s.active_jobs, s.active_users, s.audit_count
    ))
}

pub fn render_stats(stats: &[DailyStat], format: OutputFormat) -> anyhow::Result<String> {
    if format == OutputFormat::Json {
        return json(stats);
    }
    if stats.is_empty() {
        return Ok("No usage statistics yet.".to_string());
    }
    let mut out = format!(
        "{:<10}  {:<20}  {:>6}  {:>9}  {:>7}\n",
        "DAY", "PAGE", "HITS", "MEAN MS", "MAX MS"
    );
    for s in stats {
        let _ = writeln!(
            out,
            "{:<10}  {:<20}  {:>6}  {:>9.1}  {:>7}",
            s.day, s.path, s.hits, s.mean_response_time, s.max_response_time
        );
    }
    Ok(out.trim_end().to_string())
}

pub fn render_audit(entries: &[AuditEntry], format: OutputFormat) -> anyhow::Result<String> {
    if format == OutputFormat::Json {
        return json(entries);
    }
    if entries.is_empty() {
        return Ok("No audit entries.".to_string());
    }
    let mut out = format!(
        "{:<6}  {:<16}  {:<10}  {:<6}  {}\n",
        "ID", "BY", "CATEGORY", "STATUS", "CREATED"
    );
    for e in entries {
        let _ = writeln!(
            out,
            "{:<6}  {:<16}  {:<10}  {:<6}  {}\n{:<6}  {}",
            e.id, e.by_user, e.category, e.status, e.created, "", e.description
        );
    }
    Ok(out.trim_end().to_string())
}

pub fn render_table_counts(counts: &[TableCount], format: OutputFormat) -> anyhow::Result<String> {
    if format == OutputFormat::Json {
        return json(counts);
    }
    let Some(first) = counts.first() else {
        return Ok("No table counts recorded yet.".to_string());
    };
    let mut out = format!("Taken: {} ({})\n{:<24}  {:>10}\n", first.created, first.kind, "TABLE", "ROWS");
    for c in counts {
        let _ = writeln!(out, "{:<24}  {:>10}", c.table, c.counter);
    }
    Ok(out.trim_end().to_string())
}

fn json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

use std::time::{Duration, Instant};

use jobhost_core::config::HealthConfig;
use rusqlite::OptionalExtension;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::Result;
use crate::job::{Job, JobContext, Work};
use crate::store::JobStore;
use crate::types::{now_ts, JobStatus};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// One row of `health_snapshots`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    /// Resident memory of this process in MiB; 0 where unavailable.
    pub mem_mb: f64,
    pub queued_jobs: usize,
    pub active_jobs: usize,
    /// Distinct users owning at least one running job.
    pub active_users: usize,
    pub audit_count: usize,
    /// Probe round-trip in seconds; 0 when no probe is configured, -1 when it
    /// failed or did not answer `200`.
    pub response_time: f64,
    pub created: String,
}

/// Records a point-in-time snapshot of process and job health.
pub struct HealthCheckJob {
    probe_url: String,
}

impl HealthCheckJob {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            probe_url: config.probe_url.trim().to_string(),
        }
    }

    pub fn job(config: &HealthConfig) -> Job {
        Job::new(vec!["health".to_string()], Self::new(config))
    }
}

impl Work for HealthCheckJob {
    fn kind(&self) -> &'static str {
        "health"
    }

    fn work(&self, ctx: &JobContext<'_>) -> Result<()> {
        let store = ctx.store();
        let mem_mb = resident_memory_mb();
        ctx.set_progress(20)?;

        let queued_jobs = store.count_by_status(JobStatus::Queued)?;
        let active_jobs = store.count_by_status(JobStatus::InProgress)?;
        let active_users = store.count_active_users()?;
        let audit_count = store.count_audit()?;
        ctx.set_progress(50)?;

        let response_time = probe(&self.probe_url);
        ctx.set_progress(80)?;

        let snapshot = HealthSnapshot {
            mem_mb,
            queued_jobs,
            active_jobs,
            active_users,
            audit_count,
            response_time,
            created: now_ts(),
        };
        insert_snapshot(store, &snapshot)?;
        ctx.log(&format!(
            "health snapshot mem {:.2} MiB, {queued_jobs} queued, {active_jobs} active, probe {response_time}",
            snapshot.mem_mb
        ));
        Ok(())
    }
}

fn insert_snapshot(store: &JobStore, s: &HealthSnapshot) -> Result<()> {
    store.with_conn(|conn| {
        conn.execute(
            "INSERT INTO health_snapshots
             (mem_mb, queued_jobs, active_jobs, active_users, audit_count, response_time, created)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                s.mem_mb,
                s.queued_jobs as i64,
                s.active_jobs as i64,
                s.active_users as i64,
                s.audit_count as i64,
                s.response_time,
                s.created,
            ],
        )
    })?;
    Ok(())
}

/// Most recent snapshot, if any was recorded.
pub fn latest_snapshot(store: &JobStore) -> Result<Option<HealthSnapshot>> {
    store.with_conn(|conn| {
        conn.query_row(
            "SELECT mem_mb, queued_jobs, active_jobs, active_users, audit_count,
                    response_time, created
             FROM health_snapshots ORDER BY id DESC LIMIT 1",
            [],
            |row| {
                Ok(HealthSnapshot {
                    mem_mb: row.get(0)?,
                    queued_jobs: row.get::<_, i64>(1)? as usize,
                    active_jobs: row.get::<_, i64>(2)? as usize,
                    active_users: row.get::<_, i64>(3)? as usize,
                    audit_count: row.get::<_, i64>(4)? as usize,
                    response_time: row.get(5)?,
                    created: row.get(6)?,
                })
            },
        )
        .optional()
    })
}

/// Time a GET of `url`. Empty URL disables the probe.
fn probe(url: &str) -> f64 {
    if url.is_empty() {
        return 0.0;
    }
    let client = match reqwest::blocking::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            warn!("health probe client unavailable: {e}");
            return -1.0;
        }
    };

    let started = Instant::now();
    match client.get(url).send() {
        Ok(resp) if resp.status() == reqwest::StatusCode::OK => started.elapsed().as_secs_f64(),
        Ok(resp) => {
            debug!(url, status = %resp.status(), "health probe got non-200 answer");
            -1.0
        }
        Err(e) => {
            debug!(url, "health probe failed: {e}");
            -1.0
        }
    }
}

fn resident_memory_mb() -> f64 {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| parse_vm_rss_mb(&status))
        .unwrap_or(0.0)
}

/// Extract `VmRSS` (reported in kB) from `/proc/<pid>/status` text as MiB,
/// rounded to two decimals.
fn parse_vm_rss_mb(status: &str) -> Option<f64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: f64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some((kb / 1024.0 * 100.0).round() / 100.0)
}

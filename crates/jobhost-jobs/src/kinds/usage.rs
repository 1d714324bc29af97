use std::collections::HashSet;

use chrono::{Duration, Utc};
use jobhost_core::config::StatsConfig;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::job::{Job, JobContext, Work};
use crate::store::JobStore;
use crate::types::{format_ts, now_ts};

/// Bucket for every request that was not answered `200 OK`.
pub const NOT_OK_PATH: &str = "NOTOK";
const OK_RESPONSE: &str = "200 OK";

/// One served request, as written by the access logger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRecord {
    pub remote_addr: Option<String>,
    pub method: Option<String>,
    pub protocol: Option<String>,
    pub path: String,
    /// Status line, e.g. `"200 OK"`.
    pub response: String,
    /// Milliseconds.
    pub response_time: i64,
    pub user: Option<String>,
    pub created: String,
}

/// Aggregated traffic for one day and top-level path segment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyStat {
    pub day: String,
    pub path: String,
    pub hits: i64,
    pub mean_response_time: f64,
    pub max_response_time: i64,
    /// Highest access id folded into this row.
    pub last_processed: i64,
}

/// Append an access record. Returns its id.
pub fn record_access(store: &JobStore, record: &AccessRecord) -> Result<i64> {
    store.with_conn(|conn| {
        conn.execute(
            "INSERT INTO access
             (remote_addr, method, protocol, path, response, response_time, user, created)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                record.remote_addr,
                record.method,
                record.protocol,
                record.path,
                record.response,
                record.response_time,
                record.user,
                record.created,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    })
}

/// Every stats row, newest day first.
pub fn daily_stats(store: &JobStore) -> Result<Vec<DailyStat>> {
    store.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT day, path, hits, mean_response_time, max_response_time, last_processed
             FROM stats ORDER BY day DESC, path",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(DailyStat {
                day: row.get(0)?,
                path: row.get(1)?,
                hits: row.get(2)?,
                mean_response_time: row.get(3)?,
                max_response_time: row.get(4)?,
                last_processed: row.get(5)?,
            })
        })?;
        rows.collect()
    })
}

struct AccessRow {
    id: i64,
    path: String,
    response: String,
    response_time: i64,
    created: String,
}

/// Folds new access records into per-day, per-page usage statistics.
///
/// Only records after the high-water mark (the largest `last_processed` over
/// all stats rows) are read, so re-running never counts a request twice.
pub struct UsageStatsJob {
    window_days: i64,
    excluded_user: String,
}

impl UsageStatsJob {
    pub fn new(config: &StatsConfig) -> Self {
        Self {
            window_days: config.window_days,
            excluded_user: config.excluded_user.clone(),
        }
    }

    pub fn job(config: &StatsConfig) -> Job {
        Job::new(vec!["usage-stats".to_string()], Self::new(config))
    }
}

impl Work for UsageStatsJob {
    fn kind(&self) -> &'static str {
        "usage-stats"
    }

    fn work(&self, ctx: &JobContext<'_>) -> Result<()> {
        let store = ctx.store();
        let high_water: i64 = store.with_conn(|conn| {
            conn.query_row(
                "SELECT COALESCE(MAX(last_processed), 0) FROM stats",
                [],
                |row| row.get(0),
            )
        })?;
        let since = format_ts(Utc::now() - Duration::days(self.window_days));

        let rows = store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, path, response, response_time, created FROM access
                 WHERE id > ?1 AND created > ?2 AND user IS NOT ?3
                 ORDER BY id",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![high_water, since, self.excluded_user],
                |row| {
                    Ok(AccessRow {
                        id: row.get(0)?,
                        path: row.get(1)?,
                        response: row.get(2)?,
                        response_time: row.get(3)?,
                        created: row.get(4)?,
                    })
                },
            )?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        ctx.log(&format!(
            "aggregating {} access records after id {high_water}",
            rows.len()
        ));
        ctx.set_progress(40)?;

        let touched = store.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let mut touched = HashSet::new();
            for row in &rows {
                let Some(page) = page_of(&row.path, &row.response) else {
                    continue;
                };
                let day = row.created.get(..10).unwrap_or(&row.created).to_string();

                let mut stat = load_stat(&tx, &day, &page)?.unwrap_or(DailyStat {
                    day,
                    path: page,
                    hits: 0,
                    mean_response_time: 0.0,
                    max_response_time: 0,
                    last_processed: 0,
                });
                if stat.last_processed >= row.id {
                    continue;
                }
                fold(&mut stat, row);
                save_stat(&tx, &stat)?;
                touched.insert((stat.day, stat.path));
            }
            tx.commit()?;
            Ok(touched.len())
        })?;

        ctx.log(&format!("usage statistics updated for {touched} day/page pairs"));
        Ok(())
    }
}

/// Top-level page for an access record, or `None` if it is not counted.
///
/// `/reports/42` → `reports`; non-`200 OK` answers collapse into
/// [`NOT_OK_PATH`]; query-only requests (`/?q=1`) are skipped.
fn page_of(path: &str, response: &str) -> Option<String> {
    let page = if response != OK_RESPONSE {
        NOT_OK_PATH
    } else {
        path.split('/').nth(1).unwrap_or("")
    };
    (!page.starts_with('?')).then(|| page.to_string())
}

fn fold(stat: &mut DailyStat, row: &AccessRow) {
    let hits = stat.hits as f64;
    stat.mean_response_time =
        (stat.mean_response_time * hits + row.response_time as f64) / (hits + 1.0);
    stat.hits += 1;
    stat.max_response_time = stat.max_response_time.max(row.response_time);
    stat.last_processed = row.id;
}

fn load_stat(
    conn: &rusqlite::Connection,
    day: &str,
    path: &str,
) -> rusqlite::Result<Option<DailyStat>> {
    conn.query_row(
        "SELECT day, path, hits, mean_response_time, max_response_time, last_processed
         FROM stats WHERE day = ?1 AND path = ?2",
        [day, path],
        |row| {
            Ok(DailyStat {
                day: row.get(0)?,
                path: row.get(1)?,
                hits: row.get(2)?,
                mean_response_time: row.get(3)?,
                max_response_time: row.get(4)?,
                last_processed: row.get(5)?,
            })
        },
    )
    .optional()
}

fn save_stat(conn: &rusqlite::Connection, stat: &DailyStat) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO stats
         (day, path, hits, mean_response_time, max_response_time, last_processed, created)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (day, path) DO UPDATE SET
             hits = excluded.hits,
             mean_response_time = excluded.mean_response_time,
             max_response_time = excluded.max_response_time,
             last_processed = excluded.last_processed",
        rusqlite::params![
            stat.day,
            stat.path,
            stat.hits,
            stat.mean_response_time,
            stat.max_response_time,
            stat.last_processed,
            now_ts(),
        ],
    )?;
    Ok(())
}

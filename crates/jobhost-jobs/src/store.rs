use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info, instrument};

use crate::db::init_db;
use crate::error::Result;
use crate::types::{now_ts, AuditEntry, AuditStatus, JobRecord, JobStatus};

const SELECT_JOB: &str = "SELECT task_id, name, action, status, logfile, progress,
                                 user_id, created, started, done
                          FROM jobs";

/// Thread-safe persisted record store for jobs and audit entries.
///
/// Wraps a single SQLite connection in a `Mutex`; every call is one short
/// critical section, so concurrent writers from worker threads and request
/// handlers are serialized here.
pub struct JobStore {
    conn: Mutex<Connection>,
}

impl JobStore {
    /// Wrap an open connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open (or create) a file-backed store in WAL mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        info!(path = %path.as_ref().display(), "job store opened");
        Self::new(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    /// Run `f` against the underlying connection while holding the lock.
    ///
    /// Used by job kinds that read or write their own tables.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = lock_unpoisoned(&self.conn);
        Ok(f(&conn)?)
    }

    // --- jobs ----------------------------------------------------------------

    #[instrument(skip(self, record), fields(task_id = %record.task_id))]
    pub fn insert_job(&self, record: &JobRecord) -> Result<()> {
        let action = serde_json::to_string(&record.args)?;
        let conn = lock_unpoisoned(&self.conn);
        conn.execute(
            "INSERT INTO jobs
             (task_id, name, action, status, logfile, progress, user_id, created, started, done)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            rusqlite::params![
                record.task_id,
                record.name,
                action,
                record.status.to_string(),
                record.logfile,
                record.progress,
                record.user_id,
                record.created,
                record.started,
                record.done,
            ],
        )?;
        debug!("job row created");
        Ok(())
    }

    pub fn get_job(&self, task_id: &str) -> Result<Option<JobRecord>> {
        let conn = lock_unpoisoned(&self.conn);
        let record = conn
            .query_row(
                &format!("{SELECT_JOB} WHERE task_id = ?1"),
                [task_id],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    pub fn status_of(&self, task_id: &str) -> Result<Option<JobStatus>> {
        Ok(self.get_job(task_id)?.map(|r| r.status))
    }

    /// Persist a status change. Entering `InProgress` stamps `started`;
    /// entering a terminal state stamps `done`.
    ///
    /// Returns `false` when no row exists for `task_id`.
    #[instrument(skip(self))]
    pub fn update_status(&self, task_id: &str, status: JobStatus) -> Result<bool> {
        let now = now_ts();
        let conn = lock_unpoisoned(&self.conn);
        let n = conn.execute(
            "UPDATE jobs SET status = ?1,
                    started = CASE WHEN ?1 = 'in_progress' THEN ?2 ELSE started END,
                    done    = CASE WHEN ?1 IN ('stopped', 'done') THEN ?2 ELSE done END
             WHERE task_id = ?3",
            rusqlite::params![status.to_string(), now, task_id],
        )?;
        Ok(n > 0)
    }

    /// Move a job to `to` only if its persisted status is one of `from`.
    ///
    /// Returns `false` when the row is gone or holds another status; the
    /// caller re-reads the row to tell the two apart.
    #[instrument(skip(self))]
    pub fn transition(&self, task_id: &str, from: &[JobStatus], to: JobStatus) -> Result<bool> {
        let allowed = serde_json::to_string(&from.iter().map(|s| s.to_string()).collect::<Vec<_>>())?;
        let now = now_ts();
        let conn = lock_unpoisoned(&self.conn);
        let n = conn.execute(
            "UPDATE jobs SET status = ?1,
                    started = CASE WHEN ?1 = 'in_progress' THEN ?2 ELSE started END,
                    done    = CASE WHEN ?1 IN ('stopped', 'done') THEN ?2 ELSE done END
             WHERE task_id = ?3
               AND status IN (SELECT value FROM json_each(?4))",
            rusqlite::params![to.to_string(), now, task_id, allowed],
        )?;
        Ok(n > 0)
    }

    /// Mark a running job done and set its progress to 100, unless someone
    /// else already moved it to a terminal state.
    ///
    /// Returns `true` only if this call performed the transition.
    #[instrument(skip(self))]
    pub fn complete_running(&self, task_id: &str) -> Result<bool> {
        let now = now_ts();
        let conn = lock_unpoisoned(&self.conn);
        let n = conn.execute(
            "UPDATE jobs SET status = 'done', progress = 100, done = ?1
             WHERE task_id = ?2 AND status = 'in_progress'",
            rusqlite::params![now, task_id],
        )?;
        Ok(n > 0)
    }

    /// Persist progress and return the status read back in the same critical
    /// section, or `None` if the row is gone.
    pub fn update_progress(&self, task_id: &str, progress: u8) -> Result<Option<JobStatus>> {
        let conn = lock_unpoisoned(&self.conn);
        conn.execute(
            "UPDATE jobs SET progress = ?1 WHERE task_id = ?2",
            rusqlite::params![progress, task_id],
        )?;
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM jobs WHERE task_id = ?1",
                [task_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status.and_then(|s| s.parse().ok()))
    }

    /// Returns `false` if no row was deleted.
    #[instrument(skip(self))]
    pub fn delete_job(&self, task_id: &str) -> Result<bool> {
        let conn = lock_unpoisoned(&self.conn);
        let n = conn.execute("DELETE FROM jobs WHERE task_id = ?1", [task_id])?;
        Ok(n > 0)
    }

    /// All jobs with `status`, most recent first.
    pub fn jobs_by_status(&self, status: JobStatus) -> Result<Vec<JobRecord>> {
        self.query_jobs(
            &format!("{SELECT_JOB} WHERE status = ?1 ORDER BY created DESC, rowid DESC"),
            rusqlite::params![status.to_string()],
        )
    }

    pub fn count_by_status(&self, status: JobStatus) -> Result<usize> {
        let conn = lock_unpoisoned(&self.conn);
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = ?1",
            [status.to_string()],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Distinct owners with at least one running job. System jobs are not
    /// counted.
    pub fn count_active_users(&self) -> Result<usize> {
        let conn = lock_unpoisoned(&self.conn);
        let n: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT user_id) FROM jobs
             WHERE status = 'in_progress' AND user_id IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Every job of `user_id` (`None` = system), most recent first.
    pub fn jobs_by_user(&self, user_id: Option<&str>) -> Result<Vec<JobRecord>> {
        self.query_jobs(
            &format!("{SELECT_JOB} WHERE user_id IS ?1 ORDER BY created DESC, rowid DESC"),
            rusqlite::params![user_id],
        )
    }

    pub fn active_jobs_by_user(&self, user_id: Option<&str>) -> Result<Vec<JobRecord>> {
        self.query_jobs(
            &format!(
                "{SELECT_JOB} WHERE user_id IS ?1 AND status = 'in_progress'
                 ORDER BY created DESC, rowid DESC"
            ),
            rusqlite::params![user_id],
        )
    }

    /// Most recent running job of `user_id`, optionally restricted to a
    /// display name.
    pub fn last_active_job_by_user(
        &self,
        user_id: Option<&str>,
        name: Option<&str>,
    ) -> Result<Option<JobRecord>> {
        let conn = lock_unpoisoned(&self.conn);
        let record = conn
            .query_row(
                &format!(
                    "{SELECT_JOB} WHERE user_id IS ?1 AND status = 'in_progress'
                       AND (?2 IS NULL OR name = ?2)
                     ORDER BY created DESC, rowid DESC LIMIT 1"
                ),
                rusqlite::params![user_id, name],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Every job, most recent first.
    pub fn all_jobs(&self) -> Result<Vec<JobRecord>> {
        self.query_jobs(
            &format!("{SELECT_JOB} ORDER BY created DESC, rowid DESC"),
            rusqlite::params![],
        )
    }

    fn query_jobs(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<JobRecord>> {
        let conn = lock_unpoisoned(&self.conn);
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, row_to_record)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // --- audit ---------------------------------------------------------------

    pub fn insert_audit(
        &self,
        by_user: &str,
        category: &str,
        description: &str,
        status: AuditStatus,
    ) -> Result<i64> {
        let conn = lock_unpoisoned(&self.conn);
        conn.execute(
            "INSERT INTO audit (by_user, category, description, status, created)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![by_user, category, description, status.to_string(), now_ts()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Audit entries, newest first, optionally filtered by category.
    pub fn audit_entries(&self, category: Option<&str>) -> Result<Vec<AuditEntry>> {
        let conn = lock_unpoisoned(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT id, by_user, category, description, status, created FROM audit
             WHERE (?1 IS NULL OR category = ?1)
             ORDER BY id DESC",
        )?;
        let rows = stmt.query_map(rusqlite::params![category], |row| {
            let status: String = row.get(4)?;
            Ok(AuditEntry {
                id: row.get(0)?,
                by_user: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                category: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                description: row.get(3)?,
                status: status.parse().unwrap_or(AuditStatus::Nok),
                created: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn count_audit(&self) -> Result<usize> {
        let conn = lock_unpoisoned(&self.conn);
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM audit", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

/// Take `mutex` even if a panicking holder poisoned it. A work function that
/// panics inside [`JobStore::with_conn`] must not take the store down with it.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Map a `SELECT_JOB` row to a `JobRecord`.
fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRecord> {
    let action: String = row.get(2)?;
    let status_str: String = row.get(3)?;
    let status = status_str.parse::<JobStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
    })?;
    // Rows written by older tooling may hold a bare string instead of a JSON
    // array; keep it as the single argument.
    let args = serde_json::from_str(&action).unwrap_or_else(|_| vec![action.clone()]);

    Ok(JobRecord {
        task_id: row.get(0)?,
        name: row.get(1)?,
        args,
        status,
        logfile: row.get(4)?,
        progress: row.get(5)?,
        user_id: row.get(6)?,
        created: row.get(7)?,
        started: row.get(8)?,
        done: row.get(9)?,
    })
}

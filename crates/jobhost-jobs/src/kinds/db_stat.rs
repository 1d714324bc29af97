use rusqlite::OptionalExtension;
use serde::Serialize;

use crate::error::{JobError, Result};
use crate::job::{Job, JobContext, Work};
use crate::store::JobStore;
use crate::types::now_ts;

/// How a row-count snapshot was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    /// Requested by an operator.
    Adhoc,
    /// Fired by the periodic scheduler.
    Periodic,
}

impl SnapshotKind {
    fn as_str(self) -> &'static str {
        match self {
            SnapshotKind::Adhoc => "adhoc",
            SnapshotKind::Periodic => "periodic",
        }
    }
}

/// One row of `db_stats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableCount {
    pub table: String,
    pub counter: i64,
    /// `adhoc` or `periodic`.
    pub kind: String,
    pub created: String,
}

/// Records the row count of every table in the store.
pub struct DbStatJob {
    kind: SnapshotKind,
}

impl DbStatJob {
    pub fn new(kind: SnapshotKind) -> Self {
        Self { kind }
    }

    pub fn job(kind: SnapshotKind) -> Job {
        Job::new(vec!["dbstat".to_string()], Self::new(kind))
    }
}

impl Work for DbStatJob {
    fn kind(&self) -> &'static str {
        "db-stat"
    }

    fn work(&self, ctx: &JobContext<'_>) -> Result<()> {
        let store = ctx.store();
        let tables = store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
                 ORDER BY name",
            )?;
            let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
            names.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        if tables.is_empty() {
            return Err(JobError::Work("no tables to count".to_string()));
        }

        let created = now_ts();
        for (n, table) in tables.iter().enumerate() {
            let counted = store.with_conn(|conn| {
                let counter: i64 = conn.query_row(
                    &format!("SELECT COUNT(*) FROM \"{}\"", table.replace('"', "\"\"")),
                    [],
                    |row| row.get(0),
                )?;
                conn.execute(
                    "INSERT INTO db_stats (task_id, kind, table_name, counter, created)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![ctx.task_id(), self.kind.as_str(), table, counter, created],
                )?;
                Ok(counter)
            });
            match counted {
                Ok(counter) => ctx.log(&format!("db stat {table} {counter}")),
                Err(e) => {
                    ctx.log(&format!("db stat failed {table} {e}"));
                    return Err(e);
                }
            }
            let done = (n + 1) * 100 / tables.len();
            ctx.set_progress(done.min(99) as u8)?;
        }
        Ok(())
    }
}

/// Row counts of the most recent snapshot, by table name.
pub fn latest_table_counts(store: &JobStore) -> Result<Vec<TableCount>> {
    store.with_conn(|conn| {
        let last: Option<String> = conn
            .query_row(
                "SELECT task_id FROM db_stats ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let Some(task_id) = last else {
            return Ok(Vec::new());
        };

        let mut stmt = conn.prepare(
            "SELECT table_name, counter, kind, created FROM db_stats
             WHERE task_id = ?1 ORDER BY table_name",
        )?;
        let rows = stmt.query_map([task_id], |row| {
            Ok(TableCount {
                table: row.get(0)?,
                counter: row.get(1)?,
                kind: row.get(2)?,
                created: row.get(3)?,
            })
        })?;
        rows.collect()
    })
}

use chrono::{Duration, Utc};
use jobhost_core::config::{is_protected_table, CleanupTarget};

use crate::error::{JobError, Result};
use crate::job::{Job, JobContext, Work};
use crate::types::{format_ts, AuditStatus};

/// Purges rows older than a retention period from one table.
///
/// Arguments are `[name, table, days]`. The table must have a `created`
/// column holding canonical UTC timestamps. The outcome is audited: `OK` when
/// no expired row remains afterwards, `NOK` otherwise.
pub struct CleanupJob;

impl CleanupJob {
    pub fn job(target: &CleanupTarget) -> Job {
        Job::new(
            vec![
                "cleanup".to_string(),
                target.table.clone(),
                target.retention_days.to_string(),
            ],
            CleanupJob,
        )
    }
}

impl Work for CleanupJob {
    fn kind(&self) -> &'static str {
        "cleanup"
    }

    fn work(&self, ctx: &JobContext<'_>) -> Result<()> {
        let [name, table, days] = ctx.args() else {
            return Err(JobError::InvalidArgs(format!(
                "cleanup expects [name, table, days], got {} arguments",
                ctx.args().len()
            )));
        };
        let days: i64 = days
            .parse()
            .map_err(|_| JobError::InvalidArgs(format!("retention days is not a number: {days}")))?;
        let quoted = quote_table(table)?;

        let cutoff = format_ts(Utc::now() - Duration::days(days));
        ctx.log(&format!("cleanup {name} start {table} until {cutoff}"));
        ctx.set_progress(10)?;

        let counted = ctx.store().with_conn(|conn| {
            let count_sql = format!("SELECT COUNT(*) FROM {quoted} WHERE created < ?1");
            let expired: i64 = conn.query_row(&count_sql, [&cutoff], |row| row.get(0))?;
            let deleted = conn.execute(&format!("DELETE FROM {quoted} WHERE created < ?1"), [&cutoff])?;
            let remaining: i64 = conn.query_row(&count_sql, [&cutoff], |row| row.get(0))?;
            Ok((expired, deleted, remaining))
        });
        let (expired, deleted, remaining) = match counted {
            Ok(counts) => counts,
            Err(e) => {
                ctx.log(&format!("cleanup {table} until {cutoff} failed {e}"));
                ctx.audit(
                    AuditStatus::Nok,
                    &format!("cleanup table {table} retention {days} days failed"),
                )?;
                return Err(e);
            }
        };
        ctx.set_progress(90)?;

        if remaining == 0 {
            ctx.audit(
                AuditStatus::Ok,
                &format!(
                    "cleanup table {table} retention {days} days until {cutoff} ({expired} records deleted)"
                ),
            )?;
        } else {
            ctx.audit(
                AuditStatus::Nok,
                &format!(
                    "cleanup table {table} retention {days} days until {cutoff} ({remaining} records remain)"
                ),
            )?;
        }
        ctx.log(&format!("cleanup finished, {deleted} rows deleted"));
        Ok(())
    }
}

/// Validate `table` (`name` or `schema.name`) and quote each part for SQL.
fn quote_table(table: &str) -> Result<String> {
    let parts: Vec<&str> = table.split('.').collect();
    if parts.len() > 2 || !parts.iter().all(|p| is_identifier(p)) {
        return Err(JobError::InvalidArgs(format!("invalid table name: {table}")));
    }
    if is_protected_table(table) {
        return Err(JobError::InvalidArgs(format!("refusing to purge engine table {table}")));
    }
    Ok(parts
        .iter()
        .map(|p| format!("\"{p}\""))
        .collect::<Vec<_>>()
        .join("."))
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::AUDIT_CATEGORY;
    use crate::kinds::usage::{record_access, AccessRecord};
    use crate::store::JobStore;

    fn seed(store: &JobStore, old: usize, fresh: usize) {
        let insert = |age_days: i64| {
            record_access(
                store,
                &AccessRecord {
                    remote_addr: None,
                    method: Some("GET".into()),
                    protocol: None,
                    path: "/home".into(),
                    response: "200 OK".into(),
                    response_time: 5,
                    user: None,
                    created: format_ts(Utc::now() - Duration::days(age_days)),
                },
            )
            .unwrap();
        };
        (0..old).for_each(|_| insert(10));
        (0..fresh).for_each(|_| insert(1));
    }

    fn run(store: &JobStore, job: &Job) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        job.queue(store, dir.path()).unwrap();
        job.start(store).unwrap();
        dir
    }

    fn access_rows(store: &JobStore) -> i64 {
        store
            .with_conn(|c| c.query_row("SELECT COUNT(*) FROM access", [], |r| r.get(0)))
            .unwrap()
    }

    #[test]
    fn identifiers() {
        assert_eq!(quote_table("access").unwrap(), "\"access\"");
        assert_eq!(quote_table("main.access").unwrap(), "\"main\".\"access\"");
        for bad in ["", "a.b.c", "access; DROP TABLE jobs", "1access", "acc-ess", "main.", "jobs", "main.Jobs"] {
            assert!(quote_table(bad).is_err(), "{bad} accepted");
        }
    }

    #[test]
    fn purges_expired_rows_and_audits() {
        let store = JobStore::open_in_memory().unwrap();
        seed(&store, 10, 5);

        let job = CleanupJob::job(&CleanupTarget {
            table: "access".into(),
            retention_days: 7,
        });
        run(&store, &job);

        assert_eq!(access_rows(&store), 5);
        let entries = store.audit_entries(Some(AUDIT_CATEGORY)).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, AuditStatus::Ok);
        assert!(entries[0].description.contains("retention 7 days"));
        assert!(entries[0].description.contains("(10 records deleted)"));
        assert!(entries[0].description.ends_with("job: [cleanup,access,7]"));
    }

    #[test]
    fn schema_qualified_table() {
        let store = JobStore::open_in_memory().unwrap();
        seed(&store, 2, 1);
        run(
            &store,
            &CleanupJob::job(&CleanupTarget {
                table: "main.access".into(),
                retention_days: 7,
            }),
        );
        assert_eq!(access_rows(&store), 1);
    }

    #[test]
    fn bad_arguments_touch_nothing() {
        let store = JobStore::open_in_memory().unwrap();
        seed(&store, 3, 0);

        let short = Job::new(vec!["cleanup".into(), "access".into()], CleanupJob);
        let _logs = run(&store, &short);
        let injected = Job::new(
            vec!["cleanup".into(), "access; DELETE FROM jobs".into(), "0".into()],
            CleanupJob,
        );
        run(&store, &injected);

        assert_eq!(access_rows(&store), 3);
        assert!(store.audit_entries(None).unwrap().is_empty());
        let log = std::fs::read_to_string(short.logfile().unwrap()).unwrap();
        assert!(log.contains("job execute error Invalid arguments"));
    }

    #[test]
    fn engine_table_is_never_purged() {
        let store = JobStore::open_in_memory().unwrap();
        let job = CleanupJob::job(&CleanupTarget {
            table: "jobs".into(),
            retention_days: 0,
        });
        let _logs = run(&store, &job);

        assert!(store.get_job(job.task_id()).unwrap().is_some());
        assert!(store.audit_entries(None).unwrap().is_empty());
        let log = std::fs::read_to_string(job.logfile().unwrap()).unwrap();
        assert!(log.contains("refusing to purge engine table jobs"));
    }

    #[test]
    fn missing_table_is_audited_as_failure() {
        let store = JobStore::open_in_memory().unwrap();
        run(
            &store,
            &CleanupJob::job(&CleanupTarget {
                table: "nope".into(),
                retention_days: 1,
            }),
        );
        let entries = store.audit_entries(None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, AuditStatus::Nok);
    }
}

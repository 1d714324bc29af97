//! The job lifecycle shared by every job kind.
//!
//! A [`Job`] owns the identity, arguments, log and status of one unit of
//! background work. What the job actually *does* lives behind the [`Work`]
//! trait; the lifecycle (`queue` → `start` → done/stopped) is identical for
//! every kind and is driven by the registry and the worker pool.

use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{JobError, Result};
use crate::log::JobLog;
use crate::store::{lock_unpoisoned, JobStore};
use crate::types::{now_ts, AuditStatus, JobRecord, JobStatus};

/// Actor recorded on audit entries written by jobs.
pub const SYSTEM_ACTOR: &str = "SYSTEM";
/// Audit category for every job-originated entry.
pub const AUDIT_CATEGORY: &str = "JOBS";

/// The work function of a job kind.
///
/// Implementations should call [`JobContext::set_progress`] or
/// [`JobContext::checkpoint`] at regular safe points and propagate the
/// returned error with `?`: that is the only place a stop request can take
/// effect.
pub trait Work: Send + Sync {
    /// Short kind name used in process logs.
    fn kind(&self) -> &'static str;

    fn work(&self, ctx: &JobContext<'_>) -> Result<()>;
}

/// Work for jobs rebuilt from the store during recovery. They only exist so
/// that progress can be read and a stop can be issued; they never run.
pub struct Placeholder;

impl Work for Placeholder {
    fn kind(&self) -> &'static str {
        "placeholder"
    }

    fn work(&self, ctx: &JobContext<'_>) -> Result<()> {
        ctx.log("placeholder job has no work");
        Ok(())
    }
}

struct JobState {
    status: JobStatus,
    progress: u8,
    log: Option<JobLog>,
}

impl JobState {
    fn write(&mut self, task_id: &str, message: &str) {
        match self.log.as_mut() {
            Some(log) => log.write(message),
            None => error!(task_id, line = message, "cannot log: logfile is not set"),
        }
    }

    fn close_log(&mut self) {
        if let Some(log) = self.log.as_mut() {
            log.close();
        }
    }
}

/// One unit of background work with a persisted identity.
pub struct Job {
    task_id: String,
    args: Vec<String>,
    user_id: Option<String>,
    work: Box<dyn Work>,
    state: Mutex<JobState>,
    cancel: CancellationToken,
}

impl Job {
    /// Create a job owned by the system. The first argument is its display
    /// name.
    pub fn new(args: Vec<String>, work: impl Work + 'static) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            args,
            user_id: None,
            work: Box::new(work),
            state: Mutex::new(JobState {
                status: JobStatus::Queued,
                progress: 0,
                log: None,
            }),
            cancel: CancellationToken::new(),
        }
    }

    /// Attribute the job to the acting user (`None` = system).
    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    /// Rebuild a lightweight stand-in for a persisted job.
    pub fn recovered(record: &JobRecord) -> Self {
        let log = record
            .logfile
            .as_deref()
            .and_then(|path| JobLog::reopen(path, &record.task_id));
        Self {
            task_id: record.task_id.clone(),
            args: record.args.clone(),
            user_id: record.user_id.clone(),
            work: Box::new(Placeholder),
            state: Mutex::new(JobState {
                status: record.status,
                progress: record.progress,
                log,
            }),
            cancel: CancellationToken::new(),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Display name: the first argument, or `"noname"`.
    pub fn name(&self) -> &str {
        self.args.first().map(String::as_str).unwrap_or("noname")
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn kind(&self) -> &'static str {
        self.work.kind()
    }

    pub fn status(&self) -> JobStatus {
        self.state().status
    }

    pub fn progress(&self) -> u8 {
        self.state().progress
    }

    pub fn logfile(&self) -> Option<PathBuf> {
        let state = self.state();
        state.log.as_ref().map(|l| l.path().to_path_buf())
    }

    /// Token cancelled when the job is stopped in this process.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Arguments rendered for audit descriptions, e.g. `[cleanup,access,7]`.
    pub fn args_str(&self) -> String {
        serde_json::to_string(&self.args)
            .unwrap_or_else(|_| "Not Serializable args".to_string())
            .replace('"', "")
    }

    pub fn write_to_log(&self, message: &str) {
        self.state().write(&self.task_id, message);
    }

    /// Record a policy outcome, independent of the job log.
    pub fn write_to_audit(&self, store: &JobStore, status: AuditStatus, message: &str) -> Result<()> {
        let description = format!("{message} job: {}", self.args_str());
        store.insert_audit(SYSTEM_ACTOR, AUDIT_CATEGORY, &description, status)?;
        Ok(())
    }

    // --- lifecycle ---------------------------------------------------------

    /// Persist the job as queued and allocate its log.
    ///
    /// A log directory that cannot be written is not fatal: the job is
    /// queued without a log.
    pub fn queue(&self, store: &JobStore, log_dir: &Path) -> Result<()> {
        let logfile = {
            let mut state = self.state();
            state.status = JobStatus::Queued;
            state.progress = 0;

            match JobLog::create(log_dir, &self.task_id) {
                Ok(mut log) => {
                    log.write("queued");
                    state.log = Some(log);
                }
                Err(e) => {
                    error!(task_id = %self.task_id, dir = %log_dir.display(), "cannot create logfile: {e}");
                }
            }
            state.log.as_ref().map(|l| l.path().display().to_string())
        };

        let record = JobRecord {
            task_id: self.task_id.clone(),
            name: self.name().to_string(),
            args: self.args.clone(),
            status: JobStatus::Queued,
            logfile,
            progress: 0,
            user_id: self.user_id.clone(),
            created: now_ts(),
            started: None,
            done: None,
        };
        if let Err(e) = store.insert_job(&record) {
            if let Some(log) = self.state().log.take() {
                let _ = std::fs::remove_file(log.path());
            }
            return Err(e);
        }

        info!(task_id = %self.task_id, name = %self.name(), kind = self.kind(), "job queued");
        Ok(())
    }

    /// Move the job to in-progress and run it to completion on the calling
    /// thread.
    ///
    /// Returns `Cancelled` if the job was stopped before or while running,
    /// and `RecordMissing` if its row vanished. Errors raised by the work
    /// function itself are logged and do not surface here.
    pub fn start(&self, store: &JobStore) -> Result<()> {
        let status = self.status();
        if status == JobStatus::Stopped || self.cancel.is_cancelled() {
            return Err(self.cancelled());
        }
        if !status.can_transition_to(JobStatus::InProgress) {
            return Err(JobError::InvalidTransition {
                task_id: self.task_id.clone(),
                from: status,
                to: JobStatus::InProgress,
            });
        }

        if !store.transition(&self.task_id, &[JobStatus::Queued], JobStatus::InProgress)? {
            let persisted = store.status_of(&self.task_id)?.ok_or_else(|| self.record_missing())?;
            // Stopped through another registry while it waited.
            let mut state = self.state();
            if persisted.is_terminal() {
                state.status = persisted;
            }
            state.write(&self.task_id, &format!("not started: job is {persisted}"));
            state.close_log();
            return Err(self.cancelled());
        }

        {
            let mut state = self.state();
            if state.status != JobStatus::Stopped {
                state.status = JobStatus::InProgress;
            }
            state.write(&self.task_id, "started");
        }

        info!(task_id = %self.task_id, kind = self.kind(), "job started");
        self.execute(store)
    }

    /// Mark the job stopped. Valid while queued or in progress.
    ///
    /// A running work function notices at its next safe point.
    pub fn stop(&self, store: &JobStore) -> Result<()> {
        let from = self.status();
        if !from.can_transition_to(JobStatus::Stopped) {
            return Err(JobError::InvalidTransition {
                task_id: self.task_id.clone(),
                from,
                to: JobStatus::Stopped,
            });
        }

        let unfinished = [JobStatus::Queued, JobStatus::InProgress];
        if !store.transition(&self.task_id, &unfinished, JobStatus::Stopped)? {
            match store.status_of(&self.task_id)? {
                None => return Err(self.record_missing()),
                // Already stopped through another registry.
                Some(JobStatus::Stopped) => {}
                Some(persisted) => {
                    self.state().status = persisted;
                    return Err(JobError::InvalidTransition {
                        task_id: self.task_id.clone(),
                        from: persisted,
                        to: JobStatus::Stopped,
                    });
                }
            }
        }

        self.cancel.cancel();
        let mut state = self.state();
        state.status = JobStatus::Stopped;
        state.write(&self.task_id, "stopped");
        state.close_log();
        info!(task_id = %self.task_id, progress = state.progress, "job stopped");
        Ok(())
    }

    fn execute(&self, store: &JobStore) -> Result<()> {
        self.write_to_log("start execution");
        self.state().progress = 0;

        let ctx = JobContext::open(self, store);
        let outcome = ctx.set_progress(0).and_then(|_| {
            match panic::catch_unwind(AssertUnwindSafe(|| self.work.work(&ctx))) {
                Ok(result) => result,
                Err(payload) => Err(JobError::Work(panic_message(payload.as_ref()))),
            }
        });
        drop(ctx);

        match outcome {
            Err(e) if e.is_fatal_to_job() => {
                let persisted = store.status_of(&self.task_id).ok().flatten();
                let mut state = self.state();
                if let Some(persisted) = persisted.filter(|p| p.is_terminal()) {
                    state.status = persisted;
                }
                state.write(&self.task_id, "finally");
                state.write(&self.task_id, &format!("cancelled: {e}"));
                state.close_log();
                return Err(e);
            }
            Err(e) => {
                warn!(task_id = %self.task_id, kind = self.kind(), "work failed: {e}");
                self.write_to_log(&format!("job execute error {e}"));
            }
            Ok(()) => {}
        }
        self.write_to_log("finally");
        self.finish(store)
    }

    /// Finalize a run whose work function returned.
    fn finish(&self, store: &JobStore) -> Result<()> {
        if store.complete_running(&self.task_id)? {
            let mut state = self.state();
            state.status = JobStatus::Done;
            state.progress = 100;
            state.write(&self.task_id, "done");
            state.close_log();
            info!(task_id = %self.task_id, kind = self.kind(), "job done");
            return Ok(());
        }

        // Someone finalized the row between the last safe point and now.
        let persisted = store.status_of(&self.task_id)?.ok_or_else(|| self.record_missing())?;
        let mut state = self.state();
        if persisted.is_terminal() {
            state.status = persisted;
        }
        state.write(&self.task_id, &format!("finished after being marked {persisted}"));
        state.close_log();
        debug!(task_id = %self.task_id, %persisted, "job finished late");
        Ok(())
    }

    /// Persist progress, then honour any stop recorded since the last call.
    fn set_progress(&self, store: &JobStore, value: u8) -> Result<()> {
        let value = {
            let mut state = self.state();
            // Never report going backwards within a run.
            let value = value.min(100).max(state.progress);
            state.progress = value;
            value
        };

        match store.update_progress(&self.task_id, value)? {
            None => Err(self.record_missing()),
            Some(status) if status.is_terminal() => {
                info!(task_id = %self.task_id, %status, "job marked finished externally");
                self.cancel.cancel();
                Err(self.cancelled())
            }
            Some(_) if self.cancel.is_cancelled() => Err(self.cancelled()),
            Some(_) => Ok(()),
        }
    }

    fn checkpoint(&self, store: &JobStore) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(self.cancelled());
        }
        match store.status_of(&self.task_id)? {
            None => Err(self.record_missing()),
            Some(status) if status.is_terminal() => {
                self.cancel.cancel();
                Err(self.cancelled())
            }
            Some(_) => Ok(()),
        }
    }

    fn state(&self) -> MutexGuard<'_, JobState> {
        lock_unpoisoned(&self.state)
    }

    fn cancelled(&self) -> JobError {
        JobError::Cancelled {
            task_id: self.task_id.clone(),
        }
    }

    fn record_missing(&self) -> JobError {
        error!(task_id = %self.task_id, "job record not found");
        JobError::RecordMissing {
            task_id: self.task_id.clone(),
        }
    }
}

/// Execution scope handed to a work function for exactly one run.
///
/// Opened right before the work function is called and released right after
/// it returns, whatever the outcome.
pub struct JobContext<'a> {
    job: &'a Job,
    store: &'a JobStore,
}

impl<'a> JobContext<'a> {
    fn open(job: &'a Job, store: &'a JobStore) -> Self {
        debug!(task_id = %job.task_id, "execution context opened");
        Self { job, store }
    }

    pub fn task_id(&self) -> &str {
        &self.job.task_id
    }

    pub fn args(&self) -> &[String] {
        &self.job.args
    }

    pub fn user_id(&self) -> Option<&str> {
        self.job.user_id()
    }

    pub fn store(&self) -> &JobStore {
        self.store
    }

    /// Append a line to the job's own log.
    pub fn log(&self, message: &str) {
        self.job.write_to_log(message);
    }

    pub fn audit(&self, status: AuditStatus, message: &str) -> Result<()> {
        self.job.write_to_audit(self.store, status, message)
    }

    /// Report progress (0..=100). Returns `Cancelled` once the job has been
    /// stopped; propagate it with `?`.
    pub fn set_progress(&self, value: u8) -> Result<()> {
        self.job.set_progress(self.store, value)
    }

    /// Safe point without a progress report.
    pub fn checkpoint(&self) -> Result<()> {
        self.job.checkpoint(self.store)
    }

    pub fn is_cancelled(&self) -> bool {
        self.job.cancel.is_cancelled()
    }
}

impl Drop for JobContext<'_> {
    fn drop(&mut self) {
        debug!(task_id = %self.job.task_id, "execution context released");
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    /// Reports the given progress values in order, then returns.
    struct Steps(Vec<u8>);

    impl Work for Steps {
        fn kind(&self) -> &'static str {
            "steps"
        }

        fn work(&self, ctx: &JobContext<'_>) -> Result<()> {
            for value in &self.0 {
                ctx.set_progress(*value)?;
            }
            Ok(())
        }
    }

    struct Failing;

    impl Work for Failing {
        fn kind(&self) -> &'static str {
            "failing"
        }

        fn work(&self, _ctx: &JobContext<'_>) -> Result<()> {
            Err(JobError::Work("boom".to_string()))
        }
    }

    struct Panicking;

    impl Work for Panicking {
        fn kind(&self) -> &'static str {
            "panicking"
        }

        fn work(&self, _ctx: &JobContext<'_>) -> Result<()> {
            panic!("kaput");
        }
    }

    /// Panics while holding the store connection.
    struct PanicsInStore;

    impl Work for PanicsInStore {
        fn kind(&self) -> &'static str {
            "panics-in-store"
        }

        fn work(&self, ctx: &JobContext<'_>) -> Result<()> {
            ctx.set_progress(40)?;
            ctx.store()
                .with_conn(|_| -> rusqlite::Result<()> { panic!("bad row") })?;
            Ok(())
        }
    }

    /// Stops its own job through the store after `after` progress reports.
    struct StopsItself {
        after: u32,
        calls: Arc<AtomicU32>,
    }

    impl Work for StopsItself {
        fn kind(&self) -> &'static str {
            "stops-itself"
        }

        fn work(&self, ctx: &JobContext<'_>) -> Result<()> {
            for step in 1..=10u8 {
                if self.calls.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
                    ctx.store().update_status(ctx.task_id(), JobStatus::Stopped)?;
                }
                ctx.set_progress(step * 10)?;
            }
            Ok(())
        }
    }

    fn setup() -> (JobStore, tempfile::TempDir) {
        (JobStore::open_in_memory().unwrap(), tempfile::tempdir().unwrap())
    }

    fn args(name: &str) -> Vec<String> {
        vec![name.to_string()]
    }

    #[test]
    fn queue_persists_a_fresh_record() {
        let (store, dir) = setup();
        let job = Job::new(args("steps"), Steps(vec![])).with_user(Some("u1".into()));
        job.queue(&store, dir.path()).unwrap();

        let rec = store.get_job(job.task_id()).unwrap().expect("row missing");
        assert_eq!(rec.status, JobStatus::Queued);
        assert_eq!(rec.progress, 0);
        assert_eq!(rec.name, "steps");
        assert_eq!(rec.user_id.as_deref(), Some("u1"));

        let logfile = job.logfile().expect("log allocated");
        assert_eq!(rec.logfile.as_deref(), Some(logfile.to_str().unwrap()));
        let text = std::fs::read_to_string(logfile).unwrap();
        assert!(text.contains(": queued"));
    }

    #[test]
    fn unwritable_log_dir_still_queues() {
        let (store, dir) = setup();
        let job = Job::new(args("steps"), Steps(vec![]));
        job.queue(&store, &dir.path().join("missing")).unwrap();

        assert!(job.logfile().is_none());
        let rec = store.get_job(job.task_id()).unwrap().unwrap();
        assert!(rec.logfile.is_none());
    }

    #[test]
    fn successful_run_ends_done_at_full_progress() {
        let (store, dir) = setup();
        let job = Job::new(args("steps"), Steps(vec![10, 50, 30, 80]));
        job.queue(&store, dir.path()).unwrap();
        job.start(&store).unwrap();

        assert_eq!(job.status(), JobStatus::Done);
        assert_eq!(job.progress(), 100);
        let rec = store.get_job(job.task_id()).unwrap().unwrap();
        assert_eq!(rec.status, JobStatus::Done);
        assert_eq!(rec.progress, 100);
        assert!(rec.started.is_some());
        assert!(rec.done.is_some());

        let text = std::fs::read_to_string(job.logfile().unwrap()).unwrap();
        for marker in ["queued", "started", "start execution", "finally", "done"] {
            assert!(text.contains(&format!(": {marker}")), "missing {marker}");
        }
    }

    #[test]
    fn work_errors_are_logged_not_raised() {
        let (store, dir) = setup();
        let job = Job::new(args("failing"), Failing);
        job.queue(&store, dir.path()).unwrap();
        job.start(&store).unwrap();

        assert_eq!(job.status(), JobStatus::Done);
        let text = std::fs::read_to_string(job.logfile().unwrap()).unwrap();
        assert!(text.contains("job execute error Work failed: boom"));
    }

    #[test]
    fn panics_in_work_are_contained() {
        let (store, dir) = setup();
        let job = Job::new(args("panicking"), Panicking);
        job.queue(&store, dir.path()).unwrap();
        job.start(&store).unwrap();

        assert_eq!(store.status_of(job.task_id()).unwrap(), Some(JobStatus::Done));
        let text = std::fs::read_to_string(job.logfile().unwrap()).unwrap();
        assert!(text.contains("panic: kaput"));
    }

    #[test]
    fn panic_while_holding_the_store_still_finishes() {
        let (store, dir) = setup();
        let job = Job::new(args("panics-in-store"), PanicsInStore);
        job.queue(&store, dir.path()).unwrap();
        job.start(&store).unwrap();

        assert_eq!(job.status(), JobStatus::Done);
        assert_eq!(job.progress(), 100);
        assert_eq!(store.status_of(job.task_id()).unwrap(), Some(JobStatus::Done));
        let text = std::fs::read_to_string(job.logfile().unwrap()).unwrap();
        assert!(text.contains("panic: bad row"));

        let next = Job::new(args("steps"), Steps(vec![50]));
        next.queue(&store, dir.path()).unwrap();
        next.start(&store).unwrap();
        assert_eq!(next.status(), JobStatus::Done);
    }

    #[test]
    fn stop_is_idempotent_across_registries_but_not_after_done() {
        let (store, dir) = setup();
        let job = Job::new(args("steps"), Steps(vec![]));
        job.queue(&store, dir.path()).unwrap();
        store.update_status(job.task_id(), JobStatus::Stopped).unwrap();
        job.stop(&store).unwrap();
        assert_eq!(job.status(), JobStatus::Stopped);

        let done = Job::new(args("steps"), Steps(vec![]));
        done.queue(&store, dir.path()).unwrap();
        store.update_status(done.task_id(), JobStatus::Done).unwrap();
        assert!(matches!(
            done.stop(&store),
            Err(JobError::InvalidTransition { from: JobStatus::Done, .. })
        ));
        assert_eq!(store.status_of(done.task_id()).unwrap(), Some(JobStatus::Done));
    }

    #[test]
    fn external_stop_unwinds_at_next_progress_report() {
        let (store, dir) = setup();
        let calls = Arc::new(AtomicU32::new(0));
        let job = Job::new(
            args("stops-itself"),
            StopsItself {
                after: 3,
                calls: calls.clone(),
            },
        );
        job.queue(&store, dir.path()).unwrap();

        let err = job.start(&store).unwrap_err();
        assert!(matches!(err, JobError::Cancelled { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let rec = store.get_job(job.task_id()).unwrap().unwrap();
        assert_eq!(rec.status, JobStatus::Stopped);
        assert_eq!(rec.progress, 30);
        assert!(job.cancellation_token().is_cancelled());
    }

    #[test]
    fn stopped_queued_job_never_starts() {
        let (store, dir) = setup();
        let job = Job::new(args("steps"), Steps(vec![50]));
        job.queue(&store, dir.path()).unwrap();
        job.stop(&store).unwrap();

        assert!(matches!(job.start(&store), Err(JobError::Cancelled { .. })));
        let rec = store.get_job(job.task_id()).unwrap().unwrap();
        assert_eq!(rec.status, JobStatus::Stopped);
        assert!(rec.started.is_none());
    }

    #[test]
    fn stop_recorded_elsewhere_prevents_start() {
        let (store, dir) = setup();
        let job = Job::new(args("steps"), Steps(vec![50]));
        job.queue(&store, dir.path()).unwrap();
        store.update_status(job.task_id(), JobStatus::Stopped).unwrap();

        assert!(matches!(job.start(&store), Err(JobError::Cancelled { .. })));
        assert_eq!(job.status(), JobStatus::Stopped);
        assert!(store.get_job(job.task_id()).unwrap().unwrap().started.is_none());
    }

    #[test]
    fn finished_jobs_cannot_be_stopped_or_restarted() {
        let (store, dir) = setup();
        let job = Job::new(args("steps"), Steps(vec![]));
        job.queue(&store, dir.path()).unwrap();
        job.start(&store).unwrap();

        assert!(matches!(
            job.stop(&store),
            Err(JobError::InvalidTransition { .. })
        ));
        assert!(matches!(
            job.start(&store),
            Err(JobError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn deleted_row_is_fatal_to_the_job() {
        let (store, dir) = setup();
        let job = Job::new(args("steps"), Steps(vec![50]));
        job.queue(&store, dir.path()).unwrap();
        store.delete_job(job.task_id()).unwrap();

        assert!(matches!(
            job.start(&store),
            Err(JobError::RecordMissing { .. })
        ));
    }

    #[test]
    fn audit_entries_carry_the_arguments() {
        let (store, dir) = setup();
        let job = Job::new(
            vec!["cleanup".into(), "access".into(), "7".into()],
            Steps(vec![]),
        );
        job.queue(&store, dir.path()).unwrap();
        job.write_to_audit(&store, AuditStatus::Ok, "scheduler triggers")
            .unwrap();

        let entries = store.audit_entries(Some(AUDIT_CATEGORY)).unwrap();
        assert_eq!(entries[0].description, "scheduler triggers job: [cleanup,access,7]");
        assert_eq!(entries[0].by_user, SYSTEM_ACTOR);
    }
}

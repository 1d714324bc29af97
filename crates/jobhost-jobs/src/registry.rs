use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{error, info, warn};

use crate::error::{JobError, Result};
use crate::job::Job;
use crate::store::JobStore;
use crate::types::{CommandOutcome, JobRecord, JobStatus};

/// Sentinel task id used by UIs for "no job".
pub const NO_TASK: &str = "-";

/// In-memory bookkeeping of queued and active jobs.
///
/// The two maps are disjoint: a task id is either waiting for a worker,
/// running on one, or not tracked at all. Membership checks only consult
/// these maps; a registry built with [`JobRegistry::recover`] reproduces them
/// from the store, which is how a fresh request handler or a restarted
/// process sees the same picture as the worker that owns the job.
pub struct JobRegistry {
    store: Arc<JobStore>,
    log_dir: PathBuf,
    queued: DashMap<String, Arc<Job>>,
    active: DashMap<String, Arc<Job>>,
}

impl JobRegistry {
    /// An empty registry that does not look at existing rows.
    pub fn new(store: Arc<JobStore>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            log_dir: log_dir.into(),
            queued: DashMap::new(),
            active: DashMap::new(),
        }
    }

    /// Build a registry whose queued/active sets mirror the persisted
    /// `queued` and `in_progress` rows.
    ///
    /// Recovered jobs are placeholders: they report progress and can be
    /// stopped, but are never re-executed.
    pub fn recover(store: Arc<JobStore>, log_dir: impl Into<PathBuf>) -> Result<Self> {
        let registry = Self::new(store, log_dir);

        for record in registry.store.jobs_by_status(JobStatus::InProgress)? {
            registry
                .active
                .insert(record.task_id.clone(), Arc::new(Job::recovered(&record)));
        }
        for record in registry.store.jobs_by_status(JobStatus::Queued)? {
            registry
                .queued
                .insert(record.task_id.clone(), Arc::new(Job::recovered(&record)));
        }

        if !registry.active.is_empty() || !registry.queued.is_empty() {
            info!(
                active = registry.active.len(),
                queued = registry.queued.len(),
                "jobs recovered from store"
            );
        }
        Ok(registry)
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn total_active(&self) -> usize {
        self.active.len()
    }

    pub fn total_queued(&self) -> usize {
        self.queued.len()
    }

    pub fn is_active(&self, task_id: &str) -> bool {
        self.active.contains_key(task_id)
    }

    pub fn is_queued(&self, task_id: &str) -> bool {
        self.queued.contains_key(task_id)
    }

    /// Sorted ids of queued jobs.
    pub fn queued_ids(&self) -> Vec<String> {
        sorted_keys(&self.queued)
    }

    /// Sorted ids of active jobs.
    pub fn active_ids(&self) -> Vec<String> {
        sorted_keys(&self.active)
    }

    /// Track `job` as queued and persist it.
    ///
    /// Callers must not submit the same task id twice; a second call simply
    /// replaces the map entry.
    pub fn queue_job(&self, job: Arc<Job>) -> Result<Arc<Job>> {
        let task_id = job.task_id().to_string();
        self.queued.insert(task_id.clone(), job.clone());
        if let Err(e) = job.queue(&self.store, &self.log_dir) {
            self.queued.remove(&task_id);
            return Err(e);
        }
        Ok(job)
    }

    /// Move `job` from queued to active and run it on the calling thread.
    pub fn start_job(&self, job: &Arc<Job>) -> Result<()> {
        let task_id = job.task_id().to_string();
        // Insert before removing so a concurrent stop always finds it.
        self.active.insert(task_id.clone(), job.clone());
        self.queued.remove(&task_id);

        let result = job.start(&self.store);
        self.finish_job(&task_id);
        result
    }

    /// Forget an active job. Called from the job's own completion path.
    pub fn finish_job(&self, task_id: &str) -> bool {
        self.active.remove(task_id).is_some()
    }

    /// Progress for UI polling.
    ///
    /// Unknown ids (finished, purged, or the `"-"` sentinel) read as 100,
    /// queued jobs as 0, running jobs as their live value.
    pub fn get_progress(&self, task_id: &str) -> u8 {
        if task_id == NO_TASK {
            return 100;
        }
        if let Some(job) = self.active.get(task_id) {
            return job.progress();
        }
        if self.is_queued(task_id) {
            return 0;
        }
        100
    }

    /// The job's log path, if its row exists and the file is still on disk.
    pub fn get_logfile(&self, task_id: &str) -> Option<PathBuf> {
        let record = match self.store.get_job(task_id) {
            Ok(record) => record?,
            Err(e) => {
                error!(task_id, "logfile lookup failed: {e}");
                return None;
            }
        };
        record
            .logfile
            .map(PathBuf::from)
            .filter(|path| path.exists())
    }

    pub fn stop_job(&self, task_id: &str) -> CommandOutcome {
        let (job, map) = if let Some(job) = self.active.get(task_id).map(|e| e.value().clone()) {
            (job, &self.active)
        } else if let Some(job) = self.queued.get(task_id).map(|e| e.value().clone()) {
            (job, &self.queued)
        } else {
            return CommandOutcome::failed(format!("Error: Job {task_id} Not Found"));
        };

        match job.stop(&self.store) {
            Ok(()) => {
                map.remove(task_id);
                CommandOutcome::ok(format!("OK: Job {task_id} stopped"))
            }
            Err(e @ JobError::RecordMissing { .. }) => {
                map.remove(task_id);
                CommandOutcome::failed(format!("Error: {e}"))
            }
            Err(e) => {
                warn!(task_id, "stop failed: {e}");
                CommandOutcome::failed(format!("Error: Job {task_id} cannot be stopped: {e}"))
            }
        }
    }

    /// Stop every tracked job in the queued (`Queued`) or active
    /// (`InProgress`) set. Returns how many were stopped.
    pub fn stop_all(&self, status: JobStatus) -> usize {
        let ids = match status {
            JobStatus::Queued => self.queued_ids(),
            JobStatus::InProgress => self.active_ids(),
            _ => Vec::new(),
        };
        let stopped = ids
            .iter()
            .filter(|id| self.stop_job(id).success)
            .count();
        info!(%status, stopped, "stop all");
        stopped
    }

    /// Delete every persisted job with `status`. Tracked jobs are skipped.
    pub fn del_all(&self, status: JobStatus) -> usize {
        let records = match self.store.jobs_by_status(status) {
            Ok(records) => records,
            Err(e) => {
                error!(%status, "cannot list jobs to delete: {e}");
                return 0;
            }
        };
        let deleted = records
            .iter()
            .filter(|r| self.delete_job(&r.task_id).success)
            .count();
        info!(%status, deleted, "delete all");
        deleted
    }

    /// Remove a finished job's row and log file.
    ///
    /// Refused while the job is queued or active.
    pub fn delete_job(&self, task_id: &str) -> CommandOutcome {
        if self.is_active(task_id) || self.is_queued(task_id) {
            return CommandOutcome::failed(format!(
                "Error: Cannot delete active or queued job {task_id}"
            ));
        }

        let record = match self.store.get_job(task_id) {
            Ok(Some(record)) => record,
            Ok(None) => return CommandOutcome::failed(format!("Error: Job {task_id} not found")),
            Err(e) => {
                error!(task_id, "delete lookup failed: {e}");
                return CommandOutcome::failed(format!("Error: Job {task_id} cannot be deleted: {e}"));
            }
        };

        match record.logfile.as_deref().map(Path::new) {
            Some(path) if path.exists() => {
                if let Err(e) = std::fs::remove_file(path) {
                    error!(task_id, path = %path.display(), "cannot remove logfile: {e}");
                }
            }
            Some(path) => error!(task_id, path = %path.display(), "logfile does not exist"),
            None => {}
        }

        match self.store.delete_job(task_id) {
            Ok(_) => {
                info!(task_id, "job deleted");
                CommandOutcome::ok(format!("OK: Job {task_id} deleted"))
            }
            Err(e) => {
                error!(task_id, "delete failed: {e}");
                CommandOutcome::failed(format!("Error: Job {task_id} cannot be deleted: {e}"))
            }
        }
    }

    pub fn get_all_jobs_by_user(&self, user_id: Option<&str>) -> Result<Vec<JobRecord>> {
        self.store.jobs_by_user(user_id)
    }

    pub fn get_all_active_jobs_by_user(&self, user_id: Option<&str>) -> Result<Vec<JobRecord>> {
        self.store.active_jobs_by_user(user_id)
    }

    pub fn get_last_active_job_by_user(
        &self,
        user_id: Option<&str>,
        name: Option<&str>,
    ) -> Result<Option<JobRecord>> {
        self.store.last_active_job_by_user(user_id, name)
    }
}

fn sorted_keys(map: &DashMap<String, Arc<Job>>) -> Vec<String> {
    let mut keys: Vec<String> = map.iter().map(|e| e.key().clone()).collect();
    keys.sort();
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobContext, Work};

    struct Quick;

    impl Work for Quick {
        fn kind(&self) -> &'static str {
            "quick"
        }

        fn work(&self, ctx: &JobContext<'_>) -> Result<()> {
            ctx.set_progress(50)
        }
    }

    fn setup() -> (JobRegistry, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        (JobRegistry::new(store, dir.path()), dir)
    }

    fn quick(name: &str) -> Arc<Job> {
        Arc::new(Job::new(vec![name.to_string()], Quick))
    }

    #[test]
    fn queued_then_started_moves_between_sets() {
        let (registry, _dir) = setup();
        let job = registry.queue_job(quick("a")).unwrap();
        let id = job.task_id().to_string();

        assert!(registry.is_queued(&id));
        assert!(!registry.is_active(&id));
        assert_eq!(registry.get_progress(&id), 0);

        registry.start_job(&job).unwrap();
        assert!(!registry.is_queued(&id));
        assert!(!registry.is_active(&id));
        assert_eq!(registry.get_progress(&id), 100);
        assert_eq!(
            registry.store().status_of(&id).unwrap(),
            Some(JobStatus::Done)
        );
    }

    #[test]
    fn progress_of_unknown_and_sentinel_is_full() {
        let (registry, _dir) = setup();
        assert_eq!(registry.get_progress("nope"), 100);
        assert_eq!(registry.get_progress(NO_TASK), 100);
    }

    #[test]
    fn stop_queued_job() {
        let (registry, _dir) = setup();
        let job = registry.queue_job(quick("a")).unwrap();
        let id = job.task_id().to_string();

        let outcome = registry.stop_job(&id);
        assert!(outcome.success, "{}", outcome.message);
        assert!(!registry.is_queued(&id));
        assert_eq!(
            registry.store().status_of(&id).unwrap(),
            Some(JobStatus::Stopped)
        );

        let again = registry.stop_job(&id);
        assert!(!again.success);
        assert!(again.message.contains("Not Found"));
    }

    #[test]
    fn delete_refuses_tracked_jobs() {
        let (registry, _dir) = setup();
        let job = registry.queue_job(quick("a")).unwrap();
        let id = job.task_id().to_string();

        let outcome = registry.delete_job(&id);
        assert!(!outcome.success);
        assert!(registry.store().get_job(&id).unwrap().is_some());
    }

    #[test]
    fn delete_done_job_removes_row_and_log() {
        let (registry, _dir) = setup();
        let job = registry.queue_job(quick("a")).unwrap();
        let id = job.task_id().to_string();
        registry.start_job(&job).unwrap();

        let logfile = registry.get_logfile(&id).expect("log present");
        let outcome = registry.delete_job(&id);
        assert!(outcome.success, "{}", outcome.message);
        assert!(!logfile.exists());
        assert!(registry.store().get_job(&id).unwrap().is_none());
        assert!(registry.get_logfile(&id).is_none());

        assert!(!registry.delete_job(&id).success);
    }

    #[test]
    fn bulk_stop_and_delete() {
        let (registry, _dir) = setup();
        for name in ["a", "b", "c"] {
            registry.queue_job(quick(name)).unwrap();
        }
        assert_eq!(registry.stop_all(JobStatus::Queued), 3);
        assert_eq!(registry.total_queued(), 0);
        assert_eq!(registry.stop_all(JobStatus::InProgress), 0);

        assert_eq!(registry.del_all(JobStatus::Stopped), 3);
        assert!(registry.store().all_jobs().unwrap().is_empty());
    }

    #[test]
    fn recovery_mirrors_persisted_sets() {
        let (registry, dir) = setup();
        let waiting = registry.queue_job(quick("waiting")).unwrap();
        let running = registry.queue_job(quick("running")).unwrap();
        // Simulate a worker that was mid-run when the process died.
        registry
            .store()
            .update_status(running.task_id(), JobStatus::InProgress)
            .unwrap();
        registry.store().update_progress(running.task_id(), 40).unwrap();

        let fresh = JobRegistry::recover(registry.store().clone(), dir.path()).unwrap();
        assert_eq!(fresh.queued_ids(), vec![waiting.task_id().to_string()]);
        assert_eq!(fresh.active_ids(), vec![running.task_id().to_string()]);
        assert_eq!(fresh.get_progress(running.task_id()), 40);

        let again = JobRegistry::recover(registry.store().clone(), dir.path()).unwrap();
        assert_eq!(again.queued_ids(), fresh.queued_ids());
        assert_eq!(again.active_ids(), fresh.active_ids());
    }

    #[test]
    fn fresh_registry_can_stop_a_running_job() {
        let (registry, dir) = setup();
        let job = registry.queue_job(quick("a")).unwrap();
        registry
            .store()
            .update_status(job.task_id(), JobStatus::InProgress)
            .unwrap();

        let fresh = JobRegistry::recover(registry.store().clone(), dir.path()).unwrap();
        assert!(fresh.stop_job(job.task_id()).success);
        assert_eq!(
            registry.store().status_of(job.task_id()).unwrap(),
            Some(JobStatus::Stopped)
        );
    }

    #[test]
    fn user_queries_go_to_the_store() {
        let (registry, _dir) = setup();
        let owned = Arc::new(Job::new(vec!["mine".into()], Quick).with_user(Some("u1".into())));
        registry.queue_job(owned.clone()).unwrap();
        registry.queue_job(quick("system")).unwrap();

        let mine = registry.get_all_jobs_by_user(Some("u1")).unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].task_id, owned.task_id());
        assert!(registry.get_all_active_jobs_by_user(Some("u1")).unwrap().is_empty());
        assert!(registry
            .get_last_active_job_by_user(Some("u1"), Some("mine"))
            .unwrap()
            .is_none());
    }
}

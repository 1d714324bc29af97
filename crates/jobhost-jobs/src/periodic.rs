//! Recurring job triggers.
//!
//! The scheduler polls once a second and fires every trigger whose period
//! has elapsed, building a fresh [`Job`] for each run and handing it to
//! [`CommandProcessor::trigger_periodic`].

use std::sync::Arc;
use std::time::Duration;

use jobhost_core::JobhostConfig;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::job::Job;
use crate::kinds::{CleanupJob, DbStatJob, HealthCheckJob, SnapshotKind, UsageStatsJob};
use crate::processor::CommandProcessor;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

type BuildJob = Box<dyn Fn() -> Job + Send + Sync>;

/// A job recipe fired every `every`.
pub struct PeriodicTrigger {
    name: String,
    every: Duration,
    build: BuildJob,
}

impl PeriodicTrigger {
    pub fn new(
        name: impl Into<String>,
        every: Duration,
        build: impl Fn() -> Job + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            every,
            build: Box::new(build),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn every(&self) -> Duration {
        self.every
    }
}

struct Slot {
    trigger: PeriodicTrigger,
    next_due: Instant,
}

pub struct PeriodicScheduler {
    processor: Arc<CommandProcessor>,
    enabled: bool,
    slots: Vec<Slot>,
}

impl PeriodicScheduler {
    /// With `enabled = false` triggers still fire on schedule but only
    /// record a "paused" audit entry.
    pub fn new(processor: Arc<CommandProcessor>, enabled: bool) -> Self {
        Self {
            processor,
            enabled,
            slots: Vec::new(),
        }
    }

    /// Health, usage statistics and table row counts every
    /// `interval_minutes`, one cleanup per configured retention rule every
    /// `cleanup_interval_minutes`.
    pub fn from_config(processor: Arc<CommandProcessor>, config: &JobhostConfig) -> Self {
        let periodic = &config.periodic;
        let mut scheduler = Self::new(processor, periodic.enabled);
        let every = Duration::from_secs(periodic.interval_minutes * 60);
        let cleanup_every = Duration::from_secs(periodic.cleanup_interval_minutes * 60);

        let health = config.health.clone();
        scheduler.add(PeriodicTrigger::new("health", every, move || {
            HealthCheckJob::job(&health)
        }));
        let stats = config.stats.clone();
        scheduler.add(PeriodicTrigger::new("usage-stats", every, move || {
            UsageStatsJob::job(&stats)
        }));
        scheduler.add(PeriodicTrigger::new("db-stat", every, || {
            DbStatJob::job(SnapshotKind::Periodic)
        }));
        for target in &config.cleanup {
            let target = target.clone();
            scheduler.add(PeriodicTrigger::new(
                format!("cleanup {}", target.table),
                cleanup_every,
                move || CleanupJob::job(&target),
            ));
        }
        scheduler
    }

    /// Register `trigger`; its first run is one period from now. Triggers
    /// with a zero period are ignored.
    pub fn add(&mut self, trigger: PeriodicTrigger) {
        if trigger.every.is_zero() {
            warn!(trigger = %trigger.name, "periodic trigger has no interval; ignored");
            return;
        }
        let next_due = Instant::now() + trigger.every;
        self.slots.push(Slot { trigger, next_due });
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(triggers = self.slots.len(), enabled = self.enabled, "periodic scheduler started");
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.fire_due(Instant::now()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("periodic scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Fire every trigger due at `now`. Returns how many fired.
    ///
    /// Queueing touches SQLite, so each submission runs on the blocking
    /// pool instead of the runtime thread.
    async fn fire_due(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        for (name, job) in self.take_due(now) {
            let processor = self.processor.clone();
            let enabled = self.enabled;
            let outcome =
                tokio::task::spawn_blocking(move || processor.trigger_periodic(job, enabled)).await;
            match outcome {
                Ok(Ok(_)) => fired += 1,
                Ok(Err(e)) => error!(trigger = %name, "periodic trigger failed: {e}"),
                Err(e) => error!(trigger = %name, "periodic trigger task failed: {e}"),
            }
        }
        fired
    }

    /// Build a fresh job for every trigger due at `now` and schedule its next
    /// run. Missed periods are not replayed.
    fn take_due(&mut self, now: Instant) -> Vec<(String, Arc<Job>)> {
        let mut due = Vec::new();
        for slot in self.slots.iter_mut().filter(|s| s.next_due <= now) {
            while slot.next_due <= now {
                slot.next_due += slot.trigger.every;
            }
            due.push((slot.trigger.name.clone(), Arc::new((slot.trigger.build)())));
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::AUDIT_CATEGORY;
    use crate::kinds::EmptyJob;
    use crate::registry::JobRegistry;
    use crate::store::JobStore;
    use crate::types::AuditStatus;
    use jobhost_core::config::CleanupTarget;

    fn processor() -> (Arc<CommandProcessor>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        let registry = Arc::new(JobRegistry::new(store, dir.path()));
        (Arc::new(CommandProcessor::new(registry)), dir)
    }

    #[tokio::test]
    async fn submissions_do_not_stall_the_runtime_thread() {
        let (processor, _dir) = processor();
        let mut scheduler = PeriodicScheduler::new(processor.clone(), true);
        scheduler.add(PeriodicTrigger::new("empty", Duration::from_secs(60), || {
            EmptyJob::job("tick")
        }));

        // Hold the store while the trigger fires; a timer on the same
        // single-threaded runtime must still make progress.
        let store = processor.registry().store().clone();
        let release = tokio::task::spawn_blocking(move || {
            store.with_conn(|_| {
                std::thread::sleep(Duration::from_millis(500));
                Ok(())
            })
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let due = Instant::now() + Duration::from_secs(61);
        let fire = scheduler.fire_due(due);
        let ticked = tokio::time::timeout(Duration::from_millis(250), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
        });
        let (fired, ticked) = tokio::join!(fire, ticked);
        assert_eq!(fired, 1);
        assert!(ticked.is_ok());
        release.await.unwrap().unwrap();
    }

    #[test]
    fn config_yields_one_trigger_per_rule() {
        let (processor, _dir) = processor();
        let mut config = JobhostConfig::default();
        config.cleanup = vec![
            CleanupTarget {
                table: "access".into(),
                retention_days: 7,
            },
            CleanupTarget {
                table: "audit".into(),
                retention_days: 90,
            },
        ];
        let scheduler = PeriodicScheduler::from_config(processor, &config);
        assert_eq!(scheduler.len(), 5);
        assert_eq!(scheduler.slots[2].trigger.name(), "db-stat");
        assert_eq!(scheduler.slots[3].trigger.name(), "cleanup access");
        assert_eq!(scheduler.slots[4].trigger.every(), Duration::from_secs(360 * 60));
    }

    #[tokio::test]
    async fn due_triggers_submit_fresh_jobs() {
        let (processor, _dir) = processor();
        let mut scheduler = PeriodicScheduler::new(processor.clone(), true);
        scheduler.add(PeriodicTrigger::new("empty", Duration::from_secs(60), || {
            EmptyJob::job("tick")
        }));
        scheduler.add(PeriodicTrigger::new("never", Duration::ZERO, || EmptyJob::job("x")));
        assert_eq!(scheduler.len(), 1);

        let start = Instant::now();
        assert_eq!(scheduler.fire_due(start).await, 0);
        assert_eq!(scheduler.fire_due(start + Duration::from_secs(61)).await, 1);
        assert_eq!(scheduler.fire_due(start + Duration::from_secs(90)).await, 0);
        assert_eq!(scheduler.fire_due(start + Duration::from_secs(121)).await, 1);

        assert_eq!(processor.queue_len(), 2);
        let queued = processor.registry().queued_ids();
        assert_eq!(queued.len(), 2);
        assert_ne!(queued[0], queued[1]);
    }

    #[tokio::test]
    async fn paused_scheduler_only_audits() {
        let (processor, _dir) = processor();
        let mut scheduler = PeriodicScheduler::new(processor.clone(), false);
        scheduler.add(PeriodicTrigger::new("empty", Duration::from_secs(60), || {
            EmptyJob::job("tick")
        }));

        assert_eq!(
            scheduler.fire_due(Instant::now() + Duration::from_secs(61)).await,
            1
        );
        assert_eq!(processor.queue_len(), 0);
        let entries = processor
            .registry()
            .store()
            .audit_entries(Some(AUDIT_CATEGORY))
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, AuditStatus::Nok);
    }
}

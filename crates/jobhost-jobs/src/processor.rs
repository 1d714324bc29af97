//! Fixed-size FIFO worker pool.
//!
//! Submissions go through the registry (so they are persisted as queued)
//! and then onto a single unbounded channel. Each worker is a named OS
//! thread that blocks on the channel and runs one job at a time to
//! completion. Work functions are synchronous and may sleep or block, so
//! they never run on the async runtime.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{JobError, Result};
use crate::job::Job;
use crate::registry::JobRegistry;
use crate::store::lock_unpoisoned;
use crate::types::AuditStatus;

enum Command {
    Run(Arc<Job>),
    /// Tells exactly one worker to exit.
    Kill,
}

#[derive(Default)]
struct Counters {
    depth: AtomicUsize,
    in_flight: AtomicUsize,
    processed: AtomicU64,
}

/// Shared between the processor handle and its worker threads.
struct Shared {
    registry: Arc<JobRegistry>,
    rx: Mutex<mpsc::UnboundedReceiver<Command>>,
    counters: Counters,
}

impl Shared {
    /// Per-item routine used by workers and by [`CommandProcessor::drain`].
    fn run(&self, job: Arc<Job>) {
        self.counters.depth.fetch_sub(1, Ordering::SeqCst);
        let task_id = job.task_id().to_string();

        // A job stopped while waiting has already left the queued set.
        if !self.registry.is_queued(&task_id) {
            debug!(%task_id, "skipping job that is no longer queued");
            return;
        }

        self.counters.processed.fetch_add(1, Ordering::SeqCst);
        self.counters.in_flight.fetch_add(1, Ordering::SeqCst);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.registry.start_job(&job)));
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(JobError::Cancelled { .. })) => {
                info!(%task_id, "job cancelled");
            }
            Ok(Err(e)) => {
                error!(%task_id, kind = job.kind(), "job failed: {e}");
            }
            Err(_) => {
                self.registry.finish_job(&task_id);
                error!(%task_id, kind = job.kind(), "job panicked outside its work function");
            }
        }
    }

    fn worker_loop(&self, name: &str) {
        debug!(worker = name, "worker started");
        loop {
            let command = lock_unpoisoned(&self.rx).blocking_recv();
            match command {
                Some(Command::Run(job)) => self.run(job),
                Some(Command::Kill) | None => break,
            }
        }
        info!(worker = name, "worker exited");
    }
}

/// A fixed-size worker pool executing jobs in submission order.
///
/// Completion order is not guaranteed once more than one worker runs.
pub struct CommandProcessor {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Command>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl CommandProcessor {
    /// Build the queue. No worker runs until [`start`](Self::start).
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                registry,
                rx: Mutex::new(rx),
                counters: Counters::default(),
            }),
            tx,
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.shared.registry
    }

    /// Spawn `worker_count` worker threads. Only the first call has any
    /// effect; a pool of 0 workers leaves submissions queued until
    /// [`drain`](Self::drain) is called.
    pub fn start(&self, worker_count: usize) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("command processor already started");
            return Ok(());
        }
        if worker_count == 0 {
            info!("command processor has no workers; jobs stay queued until drained");
            return Ok(());
        }

        let mut workers = lock_unpoisoned(&self.workers);
        for n in 0..worker_count {
            let name = format!("job-worker-{n}");
            let shared = self.shared.clone();
            let thread_name = name.clone();
            let handle = std::thread::Builder::new()
                .name(name)
                .spawn(move || shared.worker_loop(&thread_name))?;
            workers.push(handle);
        }
        info!(workers = worker_count, "command processor started");
        Ok(())
    }

    /// Register `job` as queued and enqueue it. Returns the queue depth
    /// after the push.
    pub fn submit(&self, job: Arc<Job>) -> Result<usize> {
        let job = self.shared.registry.queue_job(job)?;
        let task_id = job.task_id().to_string();

        let depth = self.shared.counters.depth.fetch_add(1, Ordering::SeqCst) + 1;
        if self.tx.send(Command::Run(job)).is_err() {
            self.shared.counters.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(JobError::Work("job queue is closed".to_string()));
        }
        debug!(%task_id, depth, "job submitted");
        Ok(depth)
    }

    /// Entry point for a periodic trigger.
    ///
    /// When paused, an audit entry records the skipped run and nothing is
    /// submitted. Returns the queue depth if the job was submitted.
    pub fn trigger_periodic(&self, job: Arc<Job>, enabled: bool) -> Result<Option<usize>> {
        let store = self.shared.registry.store();
        if !enabled {
            job.write_to_audit(store, AuditStatus::Nok, "scheduler paused")?;
            debug!(name = job.name(), "periodic trigger paused");
            return Ok(None);
        }
        job.write_to_audit(store, AuditStatus::Ok, "scheduler triggers")?;
        self.submit(job).map(Some)
    }

    /// Ask every spawned worker to exit once it is idle. Does not wait.
    pub fn stop(&self) {
        let workers = lock_unpoisoned(&self.workers).len();
        for _ in 0..workers {
            let _ = self.tx.send(Command::Kill);
        }
        info!(workers, "command processor stopping");
    }

    /// Wait for every worker thread to exit. Call after [`stop`](Self::stop).
    pub fn join(&self) {
        let handles: Vec<_> = lock_unpoisoned(&self.workers).drain(..).collect();
        for handle in handles {
            let name = handle.thread().name().unwrap_or("job-worker").to_string();
            if handle.join().is_err() {
                error!(worker = %name, "worker thread panicked");
            }
        }
    }

    /// Run every job currently waiting in the queue on the calling thread.
    ///
    /// Returns the number of items taken off the queue. This is how a pool
    /// with no workers makes progress. If a worker is already waiting on the
    /// queue, nothing is drained.
    pub fn drain(&self) -> usize {
        let mut consumed = 0;
        loop {
            let command = match self.shared.rx.try_lock() {
                Ok(mut rx) => rx.try_recv().ok(),
                Err(_) => {
                    debug!("queue is being consumed by workers; drain skipped");
                    break;
                }
            };
            match command {
                Some(Command::Run(job)) => {
                    consumed += 1;
                    self.shared.run(job);
                }
                Some(Command::Kill) => {
                    // Meant for a worker; put it back.
                    let _ = self.tx.send(Command::Kill);
                    break;
                }
                None => break,
            }
        }
        if consumed > 0 {
            info!(consumed, "queue drained");
        }
        consumed
    }

    /// Jobs waiting for a worker.
    pub fn queue_len(&self) -> usize {
        self.shared.counters.depth.load(Ordering::SeqCst)
    }

    /// Jobs currently executing.
    pub fn in_flight(&self) -> usize {
        self.shared.counters.in_flight.load(Ordering::SeqCst)
    }

    /// Jobs handed to `start_job` since the processor was created.
    pub fn processed(&self) -> u64 {
        self.shared.counters.processed.load(Ordering::SeqCst)
    }

    pub fn worker_count(&self) -> usize {
        lock_unpoisoned(&self.workers).len()
    }
}

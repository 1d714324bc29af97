use std::thread;
use std::time::Duration;

use crate::error::Result;
use crate::job::{Job, JobContext, Work};

const DEFAULT_STEPS: u32 = 60;
const DEFAULT_STEP: Duration = Duration::from_secs(1);

/// Sleeps through a fixed number of steps, reporting progress after each.
///
/// Does nothing useful; it exists to exercise queueing, progress polling and
/// cancellation end to end.
pub struct EmptyJob {
    steps: u32,
    step: Duration,
}

impl Default for EmptyJob {
    fn default() -> Self {
        Self {
            steps: DEFAULT_STEPS,
            step: DEFAULT_STEP,
        }
    }
}

impl EmptyJob {
    pub fn with_timing(steps: u32, step: Duration) -> Self {
        Self {
            steps: steps.max(1),
            step,
        }
    }

    /// A job named `"empty"` running the default 60 one-second steps.
    pub fn job(label: &str) -> Job {
        Job::new(vec!["empty".to_string(), label.to_string()], Self::default())
    }
}

impl Work for EmptyJob {
    fn kind(&self) -> &'static str {
        "empty"
    }

    fn work(&self, ctx: &JobContext<'_>) -> Result<()> {
        for step in 1..=self.steps {
            thread::sleep(self.step);
            let pct = (f64::from(step) / f64::from(self.steps) * 100.0).round() as u8;
            ctx.set_progress(pct)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JobStore;
    use crate::types::JobStatus;

    #[test]
    fn runs_all_steps_to_done() {
        let store = JobStore::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let job = Job::new(
            vec!["empty".into()],
            EmptyJob::with_timing(3, Duration::from_millis(1)),
        );
        job.queue(&store, dir.path()).unwrap();
        job.start(&store).unwrap();

        assert_eq!(job.status(), JobStatus::Done);
        assert_eq!(store.get_job(job.task_id()).unwrap().unwrap().progress, 100);
    }

    #[test]
    fn default_job_is_named_empty() {
        let job = EmptyJob::job("smoke");
        assert_eq!(job.name(), "empty");
        assert_eq!(job.args(), ["empty", "smoke"]);
        assert_eq!(job.kind(), "empty");
    }
}

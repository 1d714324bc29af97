use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use jobhost_core::JobhostConfig;
use jobhost_jobs::{kinds, CommandProcessor, JobRegistry, JobStore, PeriodicScheduler};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

mod commands;

use commands::{DeleteTarget, OutputFormat, RunKind, StopTarget};

#[derive(Parser, Debug)]
#[command(name = "jobhost")]
#[command(version)]
#[command(about = "Background job host with a persisted job registry")]
struct Cli {
    /// Config file (default: $JOBHOST_CONFIG, then ~/.jobhost/jobhost.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the worker pool and periodic triggers until Ctrl-C. With no
    /// workers, SIGUSR1 drains the queue.
    Serve,

    /// Run one job to completion in this process and print its task id
    Run {
        /// Attribute the job to this user instead of the system
        #[arg(long)]
        user: Option<String>,

        #[command(subcommand)]
        kind: RunKind,
    },

    /// List jobs, most recent first
    List {
        /// Only jobs owned by this user
        #[arg(long)]
        user: Option<String>,

        #[arg(short, long, value_enum, default_value = "table")]
        output: OutputFormat,
    },

    /// Stop a job by id, or `all-active` / `all-queued`
    Stop { target: StopTarget },

    /// Delete a finished job by id, or `all-stopped` / `all-done`
    Delete { target: DeleteTarget },

    /// Print a job's progress (0-100)
    Progress { task_id: String },

    /// Show the most recent health snapshot
    Health {
        #[arg(short, long, value_enum, default_value = "table")]
        output: OutputFormat,
    },

    /// Show aggregated usage statistics
    Stats {
        #[arg(short, long, value_enum, default_value = "table")]
        output: OutputFormat,
    },

    /// Show the row counts of the most recent table snapshot
    DbStats {
        #[arg(short, long, value_enum, default_value = "table")]
        output: OutputFormat,
    },

    /// Print the tail of a job's log
    Log {
        task_id: String,

        #[arg(short = 'n', long, default_value_t = 100)]
        lines: usize,
    },

    /// Print recent audit entries, oldest first
    Audit {
        /// Only entries that did not succeed
        #[arg(long)]
        nok: bool,

        #[arg(long, default_value_t = 1000)]
        limit: usize,

        #[arg(short, long, value_enum, default_value = "table")]
        output: OutputFormat,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jobhost_daemon=info,jobhost_jobs=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // config: --config > JOBHOST_CONFIG env > ~/.jobhost/jobhost.toml
    let config_path = cli.config.clone().or_else(|| std::env::var("JOBHOST_CONFIG").ok());
    let config = JobhostConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        JobhostConfig::default()
    });
    config.validate()?;

    let store = open_store(&config.database.path)?;
    let log_dir = prepare_log_dir(&config.jobs.log_dir);

    match cli.command {
        Command::Serve => serve(config, store, log_dir).await,
        Command::Run { user, kind } => {
            let registry = Arc::new(JobRegistry::new(store, log_dir));
            let job = commands::build_job(&kind, &config).with_user(user);
            let outcome = tokio::task::spawn_blocking(move || {
                commands::run(registry, job, |job| {
                    println!("OK: started job {} {}", job.args_str(), job.task_id());
                })
            })
            .await??;
            report(outcome)
        }
        Command::List { user, output } => {
            let registry = JobRegistry::recover(store, log_dir)?;
            let records = match user.as_deref() {
                Some(user) => registry.get_all_jobs_by_user(Some(user))?,
                None => registry.store().all_jobs()?,
            };
            println!("{}", commands::render_jobs(&records, output)?);
            Ok(())
        }
        Command::Stop { target } => {
            let registry = JobRegistry::recover(store, log_dir)?;
            report(commands::stop(&registry, &target))
        }
        Command::Delete { target } => {
            let registry = JobRegistry::recover(store, log_dir)?;
            report(commands::delete(&registry, &target))
        }
        Command::Progress { task_id } => {
            let registry = JobRegistry::recover(store, log_dir)?;
            println!("{}", registry.get_progress(&task_id));
            Ok(())
        }
        Command::Health { output } => {
            let snapshot = kinds::latest_snapshot(&store)?;
            println!("{}", commands::render_health(snapshot.as_ref(), output)?);
            Ok(())
        }
        Command::Stats { output } => {
            let stats = kinds::daily_stats(&store)?;
            println!("{}", commands::render_stats(&stats, output)?);
            Ok(())
        }
        Command::DbStats { output } => {
            let counts = kinds::latest_table_counts(&store)?;
            println!("{}", commands::render_table_counts(&counts, output)?);
            Ok(())
        }
        Command::Log { task_id, lines } => {
            let registry = JobRegistry::new(store, log_dir);
            println!("{}", commands::tail_log(&registry, &task_id, lines)?);
            Ok(())
        }
        Command::Audit { nok, limit, output } => {
            let entries = commands::recent_audit(store.audit_entries(None)?, nok, limit);
            println!("{}", commands::render_audit(&entries, output)?);
            Ok(())
        }
    }
}

async fn serve(config: JobhostConfig, store: Arc<JobStore>, log_dir: PathBuf) -> anyhow::Result<()> {
    let registry = Arc::new(JobRegistry::recover(store, &log_dir)?);
    if registry.total_active() > 0 {
        warn!(
            count = registry.total_active(),
            "jobs were in progress when the host last stopped; `jobhost stop all-active` clears them"
        );
    }

    let processor = Arc::new(CommandProcessor::new(registry));
    processor.start(config.jobs.worker_slots())?;

    let scheduler = PeriodicScheduler::from_config(processor.clone(), &config);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let periodic = tokio::spawn(scheduler.run(shutdown_rx));

    info!(
        workers = processor.worker_count(),
        log_dir = %log_dir.display(),
        "jobhost serving; press Ctrl-C to stop"
    );
    if processor.worker_count() == 0 {
        info!(pid = std::process::id(), "no workers; send SIGUSR1 to drain queued jobs");
    }
    let mut drain_requests =
        signal(SignalKind::user_defined1()).context("installing SIGUSR1 handler")?;
    let mut ctrl_c = std::pin::pin!(tokio::signal::ctrl_c());
    loop {
        tokio::select! {
            res = &mut ctrl_c => {
                res.context("waiting for Ctrl-C")?;
                break;
            }
            _ = drain_requests.recv() => {
                let pool = processor.clone();
                match tokio::task::spawn_blocking(move || pool.drain()).await {
                    Ok(drained) => info!(drained, "operator drain finished"),
                    Err(e) => warn!("operator drain failed: {e}"),
                }
            }
        }
    }

    info!(
        queued = processor.queue_len(),
        in_flight = processor.in_flight(),
        processed = processor.processed(),
        "shutting down"
    );
    let _ = shutdown_tx.send(true);
    let _ = periodic.await;
    processor.stop();
    Ok(())
}

/// Print a command outcome; failures become a non-zero exit.
fn report(outcome: jobhost_jobs::CommandOutcome) -> anyhow::Result<()> {
    if outcome.success {
        println!("{}", outcome.message);
        Ok(())
    } else {
        anyhow::bail!(outcome.message)
    }
}

fn open_store(db_path: &str) -> anyhow::Result<Arc<JobStore>> {
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");
    let store = JobStore::open(db_path).with_context(|| format!("opening database {db_path}"))?;
    Ok(Arc::new(store))
}

/// Create the job log directory. Failure is not fatal: jobs then run
/// without a log file.
fn prepare_log_dir(dir: &str) -> PathBuf {
    let dir = PathBuf::from(dir);
    if let Err(e) = std::fs::create_dir_all(&dir) {
        warn!(dir = %dir.display(), "cannot create job log directory: {e}");
    }
    dir
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}

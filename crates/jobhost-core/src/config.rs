use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_WORKERS: i32 = 2;
pub const DEFAULT_STATS_WINDOW_DAYS: i64 = 7;
pub const DEFAULT_EXCLUDED_USER: &str = "admin";
pub const DEFAULT_INTERVAL_MINUTES: u64 = 60;
pub const DEFAULT_CLEANUP_INTERVAL_MINUTES: u64 = 360; // every 6 hours

/// Tables owned by the job engine itself; retention rules may not target them.
pub const PROTECTED_TABLES: &[&str] = &["jobs"];

/// Top-level config (jobhost.toml + JOBHOST_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobhostConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub periodic: PeriodicConfig,
    /// Tables purged by the retention cleanup job.
    #[serde(default)]
    pub cleanup: Vec<CleanupTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Worker pool and per-job log settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Number of worker threads. Zero or negative leaves the pool stopped:
    /// submissions are still accepted but wait for an operator drain.
    #[serde(default = "default_workers")]
    pub workers: i32,
    /// Directory receiving one append-only log file per job.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

impl JobsConfig {
    /// Effective pool size; negative configured values collapse to 0.
    pub fn worker_slots(&self) -> usize {
        usize::try_from(self.workers).unwrap_or(0)
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            log_dir: default_log_dir(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthConfig {
    /// URL probed by the health snapshot job. Empty disables the probe.
    #[serde(default)]
    pub probe_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Only access records newer than this many days are aggregated.
    #[serde(default = "default_window_days")]
    pub window_days: i64,
    /// Requests made by this user are left out of usage statistics.
    #[serde(default = "default_excluded_user")]
    pub excluded_user: String,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            window_days: DEFAULT_STATS_WINDOW_DAYS,
            excluded_user: default_excluded_user(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodicConfig {
    /// When false, periodic triggers record a "paused" audit entry instead of
    /// submitting their job.
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
    #[serde(default = "default_cleanup_interval_minutes")]
    pub cleanup_interval_minutes: u64,
}

impl Default for PeriodicConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: DEFAULT_INTERVAL_MINUTES,
            cleanup_interval_minutes: DEFAULT_CLEANUP_INTERVAL_MINUTES,
        }
    }
}

/// One retention rule: rows of `table` older than `retention_days` are purged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupTarget {
    /// Plain or schema-qualified table name, e.g. `access` or `main.access`.
    pub table: String,
    pub retention_days: i64,
}

/// True if `table` (plain or schema-qualified, any case) names a table the
/// engine owns.
pub fn is_protected_table(table: &str) -> bool {
    let name = table.rsplit('.').next().unwrap_or(table).trim();
    PROTECTED_TABLES.iter().any(|t| t.eq_ignore_ascii_case(name))
}

fn bool_true() -> bool {
    true
}
fn default_workers() -> i32 {
    DEFAULT_WORKERS
}
fn default_window_days() -> i64 {
    DEFAULT_STATS_WINDOW_DAYS
}
fn default_excluded_user() -> String {
    DEFAULT_EXCLUDED_USER.to_string()
}
fn default_interval_minutes() -> u64 {
    DEFAULT_INTERVAL_MINUTES
}
fn default_cleanup_interval_minutes() -> u64 {
    DEFAULT_CLEANUP_INTERVAL_MINUTES
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.jobhost/jobhost.db", home)
}
fn default_log_dir() -> String {
    std::env::temp_dir().to_string_lossy().into_owned()
}

impl JobhostConfig {
    /// Load config from a TOML file with JOBHOST_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g. `JOBHOST_JOBS__WORKERS=0`
    /// or `JOBHOST_JOBS__LOG_DIR=/var/log/jobhost`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: JobhostConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("JOBHOST_").split("__"))
            .extract()
            .map_err(|e| crate::error::JobhostError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Reject settings the job kinds cannot work with.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::JobhostError::Invalid;

        if self.stats.window_days <= 0 {
            return Err(Invalid(format!(
                "stats.window_days must be positive, got {}",
                self.stats.window_days
            )));
        }
        for target in &self.cleanup {
            if target.table.trim().is_empty() {
                return Err(Invalid("cleanup entry without a table".to_string()));
            }
            if is_protected_table(&target.table) {
                return Err(Invalid(format!(
                    "cleanup may not target the engine table {}",
                    target.table
                )));
            }
            if target.retention_days < 0 {
                return Err(Invalid(format!(
                    "cleanup of {} has negative retention_days {}",
                    target.table, target.retention_days
                )));
            }
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.jobhost/jobhost.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_file() {
        figment::Jail::expect_with(|_jail| {
            let config = JobhostConfig::load(Some("missing.toml")).expect("load failed");
            assert_eq!(config.jobs.workers, DEFAULT_WORKERS);
            assert_eq!(config.stats.window_days, 7);
            assert_eq!(config.stats.excluded_user, "admin");
            assert!(config.periodic.enabled);
            assert!(config.cleanup.is_empty());
            Ok(())
        });
    }

    #[test]
    fn toml_and_env_are_merged() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "jobhost.toml",
                r#"
                [jobs]
                workers = 4
                log_dir = "/tmp/jobs"

                [[cleanup]]
                table = "access"
                retention_days = 7
                "#,
            )?;
            jail.set_env("JOBHOST_JOBS__WORKERS", "0");

            let config = JobhostConfig::load(Some("jobhost.toml")).expect("load failed");
            assert_eq!(config.jobs.workers, 0);
            assert_eq!(config.jobs.log_dir, "/tmp/jobs");
            assert_eq!(
                config.cleanup,
                vec![CleanupTarget {
                    table: "access".to_string(),
                    retention_days: 7
                }]
            );
            Ok(())
        });
    }

    #[test]
    fn validation_rejects_unusable_rules() {
        let mut config = JobhostConfig::default();
        assert!(config.validate().is_ok());

        config.cleanup.push(CleanupTarget {
            table: "access".to_string(),
            retention_days: -1,
        });
        assert!(config.validate().is_err());

        config.cleanup[0].retention_days = 0;
        assert!(config.validate().is_ok());

        config.stats.window_days = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_the_jobs_table() {
        for table in ["jobs", "main.jobs", "JOBS"] {
            let mut config = JobhostConfig::default();
            config.cleanup.push(CleanupTarget {
                table: table.to_string(),
                retention_days: 30,
            });
            assert!(config.validate().is_err(), "{table} accepted");
        }
        assert!(!is_protected_table("jobs_archive"));
        assert!(!is_protected_table("main.access"));
    }

    #[test]
    fn negative_workers_mean_no_pool() {
        let jobs = JobsConfig {
            workers: -3,
            log_dir: "/tmp".to_string(),
        };
        assert_eq!(jobs.worker_slots(), 0);
    }
}

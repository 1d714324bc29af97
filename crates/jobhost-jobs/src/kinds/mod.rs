//! Built-in job kinds.

pub mod cleanup;
pub mod db_stat;
pub mod empty;
pub mod health;
pub mod usage;

pub use cleanup::CleanupJob;
pub use db_stat::{latest_table_counts, DbStatJob, SnapshotKind, TableCount};
pub use empty::EmptyJob;
pub use health::{latest_snapshot, HealthCheckJob, HealthSnapshot};
pub use usage::{daily_stats, record_access, AccessRecord, DailyStat, UsageStatsJob};

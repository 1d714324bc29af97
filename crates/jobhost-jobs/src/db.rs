use rusqlite::Connection;

use crate::error::Result;

/// Initialise the job engine schema in `conn`.
///
/// Creates the `jobs` and `audit` tables used by the engine itself, plus the
/// `access`, `stats`, `health_snapshots` and `db_stats` tables the built-in job kinds
/// read and write. Safe to call on every startup.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            task_id     TEXT    NOT NULL PRIMARY KEY,
            name        TEXT    NOT NULL,
            action      TEXT    NOT NULL,   -- JSON-encoded argument list
            status      TEXT    NOT NULL DEFAULT 'queued',
            logfile     TEXT,
            progress    INTEGER NOT NULL DEFAULT 0,
            user_id     TEXT,               -- NULL means system
            created     TEXT    NOT NULL,
            started     TEXT,
            done        TEXT
        ) STRICT;

        -- Recovery and per-user listings filter on these.
        CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs (status, created DESC);
        CREATE INDEX IF NOT EXISTS idx_jobs_user ON jobs (user_id, created DESC);

        CREATE TABLE IF NOT EXISTS audit (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            by_user     TEXT,
            category    TEXT,
            description TEXT    NOT NULL,
            status      TEXT,
            created     TEXT    NOT NULL
        );

        CREATE TABLE IF NOT EXISTS access (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            remote_addr   TEXT,
            method        TEXT,
            protocol      TEXT,
            path          TEXT    NOT NULL,
            response      TEXT    NOT NULL,
            response_time INTEGER NOT NULL DEFAULT 0,   -- milliseconds
            user          TEXT,
            created       TEXT    NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_access_created ON access (created);

        CREATE TABLE IF NOT EXISTS stats (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            day                TEXT    NOT NULL,
            path               TEXT    NOT NULL,
            hits               INTEGER NOT NULL DEFAULT 0,
            mean_response_time REAL    NOT NULL DEFAULT 0,
            max_response_time  INTEGER NOT NULL DEFAULT 0,
            last_processed     INTEGER NOT NULL DEFAULT 0,
            created            TEXT    NOT NULL,
            UNIQUE (day, path)
        );

        CREATE TABLE IF NOT EXISTS health_snapshots (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            mem_mb        REAL    NOT NULL,
            queued_jobs   INTEGER NOT NULL,
            active_jobs   INTEGER NOT NULL,
            active_users  INTEGER NOT NULL,
            audit_count   INTEGER NOT NULL,
            response_time REAL    NOT NULL,   -- seconds; 0 = disabled, -1 = failed
            created       TEXT    NOT NULL
        );

        CREATE TABLE IF NOT EXISTS db_stats (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id     TEXT    NOT NULL,   -- snapshot the row belongs to
            kind        TEXT    NOT NULL,   -- 'adhoc' or 'periodic'
            table_name  TEXT    NOT NULL,
            counter     INTEGER NOT NULL,
            created     TEXT    NOT NULL
        );
        ",
    )?;
    Ok(())
}

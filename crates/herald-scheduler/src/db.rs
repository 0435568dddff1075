use std::time::Duration;

use rusqlite::Connection;

use crate::error::Result;

/// Open a file-backed connection tuned for several concurrent writers.
///
/// WAL lets readers proceed during a claim; `busy_timeout` makes competing
/// writers wait for the lock instead of failing with `SQLITE_BUSY`.
pub fn open(path: &str, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path)?;
    configure(&conn, busy_timeout)?;
    Ok(conn)
}

pub fn configure(conn: &Connection, busy_timeout: Duration) -> Result<()> {
    conn.busy_timeout(busy_timeout)?;
    // In-memory databases answer "memory"; that is fine.
    conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
    conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
    Ok(())
}

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `jobs` table (idempotent) and the `(state, next_fire_at)`
/// index the claim query walks.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id             TEXT    NOT NULL PRIMARY KEY,
            name           TEXT    NOT NULL,
            trigger_spec   TEXT    NOT NULL,   -- JSON-encoded Trigger
            payload        TEXT    NOT NULL,   -- JSON-encoded Payload
            state          TEXT    NOT NULL DEFAULT 'scheduled',
            next_fire_at   TEXT,               -- RFC 3339 millis, UTC, or NULL
            group_id       TEXT,
            attempt_count  INTEGER NOT NULL DEFAULT 0,
            run_count      INTEGER NOT NULL DEFAULT 0,
            last_fired_at  TEXT,
            last_error     TEXT,
            claimed_at     TEXT,
            created_at     TEXT    NOT NULL,
            updated_at     TEXT    NOT NULL
        ) STRICT;

        -- Claim query: WHERE state = 'scheduled' AND next_fire_at <= ? ORDER BY next_fire_at
        CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs (state, next_fire_at);
        CREATE INDEX IF NOT EXISTS idx_jobs_group ON jobs (group_id);

        CREATE TABLE IF NOT EXISTS job_deliveries (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id      TEXT    NOT NULL,
            attempt     INTEGER NOT NULL,
            fired_at    TEXT    NOT NULL,
            succeeded   INTEGER NOT NULL,
            failed      TEXT    NOT NULL    -- JSON array of [target, reason]
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_job_deliveries_job ON job_deliveries (job_id);
        ",
    )?;
    Ok(())
}

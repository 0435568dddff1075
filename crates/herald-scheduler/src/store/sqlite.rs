use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{stale_cutoff, JobStore, RecoveryReport, STALE_EXHAUSTED, STALE_RECOVERED};
use crate::db::init_db;
use crate::error::{Result, SchedulerError};
use crate::retry::RetryPolicy;
use crate::types::{Claim, DeliveryRecord, Job, JobFilter, JobState, NewJob};

const JOB_COLUMNS: &str = "id, name, trigger_spec, payload, state, next_fire_at, group_id,
     attempt_count, run_count, last_fired_at, last_error, claimed_at, created_at, updated_at";

/// SQLite-backed [`JobStore`].
///
/// Several stores (in one process or many) may point at the same database
/// file; `claim_due` runs as a single `UPDATE … RETURNING` inside an
/// immediate transaction, so a due job is handed to exactly one of them.
pub struct SqliteJobStore {
    db: Arc<Mutex<Connection>>,
    retry: RetryPolicy,
}

impl SqliteJobStore {
    pub fn new(conn: Connection, retry: RetryPolicy) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            retry,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| SchedulerError::StoreConsistency("job store lock poisoned".to_string()))
    }
}

/// Fixed-width UTC timestamps so `ORDER BY` / `<=` on the text column are chronological.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SchedulerError::StoreConsistency(format!("bad timestamp '{s}': {e}")))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

/// Raw column values; decoded outside the rusqlite row callback so JSON and
/// timestamp errors surface as scheduler errors.
struct JobRow {
    id: String,
    name: String,
    trigger: String,
    payload: String,
    state: String,
    next_fire_at: Option<String>,
    group_id: Option<String>,
    attempt_count: u32,
    run_count: u32,
    last_fired_at: Option<String>,
    last_error: Option<String>,
    claimed_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            trigger: row.get(2)?,
            payload: row.get(3)?,
            state: row.get(4)?,
            next_fire_at: row.get(5)?,
            group_id: row.get(6)?,
            attempt_count: row.get(7)?,
            run_count: row.get(8)?,
            last_fired_at: row.get(9)?,
            last_error: row.get(10)?,
            claimed_at: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        let state = self
            .state
            .parse::<JobState>()
            .map_err(SchedulerError::StoreConsistency)?;
        Ok(Job {
            trigger: serde_json::from_str(&self.trigger)?,
            payload: serde_json::from_str(&self.payload)?,
            state,
            next_fire_at: parse_opt_ts(self.next_fire_at)?,
            last_fired_at: parse_opt_ts(self.last_fired_at)?,
            claimed_at: parse_opt_ts(self.claimed_at)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            id: self.id,
            name: self.name,
            group_id: self.group_id,
            attempt_count: self.attempt_count,
            run_count: self.run_count,
            last_error: self.last_error,
        })
    }
}

fn fetch(conn: &Connection, id: &str) -> Result<Job> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
    conn.query_row(&sql, [id], JobRow::from_row)
        .optional()?
        .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })?
        .into_job()
}

const IN_FLIGHT: &[JobState] = &[JobState::Claimed, JobState::Executing];

/// Turn "no row updated" into the right error: unknown id, wrong state, or a
/// claim that was recovered as stale and taken again since.
fn ensure_transitioned(
    conn: &Connection,
    claim: &Claim,
    changed: usize,
    expected: &[JobState],
) -> Result<()> {
    if changed > 0 {
        return Ok(());
    }
    let id = &claim.job_id;
    let row: Option<(String, u32, Option<String>)> = conn
        .query_row(
            "SELECT state, attempt_count, claimed_at FROM jobs WHERE id = ?1",
            [id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let Some((state, attempt, claimed_at)) = row else {
        return Err(SchedulerError::JobNotFound { id: id.clone() });
    };
    if !expected.iter().any(|s| s.as_str() == state) {
        error!(job_id = %id, %state, ?expected, "job state transition rejected");
        return Err(SchedulerError::StoreConsistency(format!(
            "job {id} is {state}, expected one of {expected:?}"
        )));
    }
    warn!(
        job_id = %id,
        attempt = claim.attempt,
        current = attempt,
        claimed_at = claimed_at.as_deref().unwrap_or("-"),
        "claim superseded"
    );
    Err(SchedulerError::StoreConsistency(format!(
        "job {id}: claim for attempt {} was superseded",
        claim.attempt
    )))
}

fn insert_job(conn: &Connection, job: &NewJob, now: DateTime<Utc>) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    let trigger = serde_json::to_string(&job.trigger)?;
    let payload = serde_json::to_string(&job.payload)?;
    conn.execute(
        "INSERT INTO jobs
         (id, name, trigger_spec, payload, state, next_fire_at, group_id,
          attempt_count, run_count, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 'scheduled', ?5, ?6, 0, 0, ?7, ?7)",
        params![
            id,
            job.name,
            trigger,
            payload,
            ts(job.next_fire_at),
            job.group_id,
            ts(now)
        ],
    )?;
    info!(job_id = %id, name = %job.name, next_fire_at = %job.next_fire_at, "job created");
    Ok(id)
}

impl JobStore for SqliteJobStore {
    fn create(&self, job: NewJob, now: DateTime<Utc>) -> Result<String> {
        let conn = self.conn()?;
        insert_job(&conn, &job, now)
    }

    fn create_many(&self, jobs: Vec<NewJob>, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let ids = jobs
            .iter()
            .map(|job| insert_job(&tx, job, now))
            .collect::<Result<Vec<_>>>()?;
        tx.commit()?;
        Ok(ids)
    }

    fn get(&self, id: &str) -> Result<Job> {
        let conn = self.conn()?;
        fetch(&conn, id)
    }

    fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now_s = ts(now);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let mut conn = self.conn()?;
        // IMMEDIATE takes the write lock up front (waiting on busy_timeout), so
        // the inner SELECT and the UPDATE see the same committed state.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let rows = {
            let sql = format!(
                "UPDATE jobs
                 SET state = 'claimed', attempt_count = attempt_count + 1,
                     claimed_at = ?1, updated_at = ?1
                 WHERE id IN (
                     SELECT id FROM jobs
                     WHERE state = 'scheduled' AND next_fire_at IS NOT NULL AND next_fire_at <= ?1
                     ORDER BY next_fire_at
                     LIMIT ?2
                 )
                 RETURNING {JOB_COLUMNS}"
            );
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt
                .query_map(params![now_s, limit], JobRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        tx.commit()?;

        let mut jobs = rows
            .into_iter()
            .map(JobRow::into_job)
            .collect::<Result<Vec<_>>>()?;
        // RETURNING order is unspecified.
        jobs.sort_by(|a, b| a.next_fire_at.cmp(&b.next_fire_at));
        if !jobs.is_empty() {
            debug!(count = jobs.len(), "due jobs claimed");
        }
        Ok(jobs)
    }

    fn mark_executing(&self, claim: &Claim, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE jobs SET state = 'executing', updated_at = ?2
             WHERE id = ?1 AND state = 'claimed' AND attempt_count = ?3 AND claimed_at = ?4",
            params![claim.job_id, ts(now), claim.attempt, ts(claim.claimed_at)],
        )?;
        ensure_transitioned(&conn, claim, n, &[JobState::Claimed])
    }

    fn mark_completed(&self, claim: &Claim, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE jobs
             SET state = 'completed', next_fire_at = NULL, run_count = run_count + 1,
                 last_fired_at = ?2, last_error = NULL, claimed_at = NULL, updated_at = ?2
             WHERE id = ?1 AND state IN ('claimed', 'executing')
               AND attempt_count = ?3 AND claimed_at = ?4",
            params![claim.job_id, ts(now), claim.attempt, ts(claim.claimed_at)],
        )?;
        ensure_transitioned(&conn, claim, n, IN_FLIGHT)?;
        info!(job_id = %claim.job_id, "job completed");
        Ok(())
    }

    fn mark_failed(
        &self,
        claim: &Claim,
        retry: bool,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<JobState> {
        let conn = self.conn()?;
        let id = &claim.job_id;
        let attempt = claim.attempt;
        let now_s = ts(now);
        if retry && !self.retry.exhausted(attempt) {
            let next = self.retry.next_attempt_at(now, attempt);
            let n = conn.execute(
                "UPDATE jobs
                 SET state = 'scheduled', next_fire_at = ?2, last_error = ?3,
                     claimed_at = NULL, updated_at = ?4
                 WHERE id = ?1 AND state IN ('claimed', 'executing')
                   AND attempt_count = ?5 AND claimed_at = ?6",
                params![id, ts(next), reason, now_s, attempt, ts(claim.claimed_at)],
            )?;
            ensure_transitioned(&conn, claim, n, IN_FLIGHT)?;
            warn!(job_id = %id, attempt, retry_at = %next, %reason, "delivery failed, retry scheduled");
            Ok(JobState::Scheduled)
        } else {
            let n = conn.execute(
                "UPDATE jobs
                 SET state = 'failed', next_fire_at = NULL, last_error = ?2,
                     claimed_at = NULL, updated_at = ?3
                 WHERE id = ?1 AND state IN ('claimed', 'executing')
                   AND attempt_count = ?4 AND claimed_at = ?5",
                params![id, reason, now_s, attempt, ts(claim.claimed_at)],
            )?;
            ensure_transitioned(&conn, claim, n, IN_FLIGHT)?;
            error!(job_id = %id, attempt, %reason, "job failed");
            Ok(JobState::Failed)
        }
    }

    fn reschedule(&self, claim: &Claim, next_fire_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE jobs
             SET state = 'scheduled', next_fire_at = ?2, run_count = run_count + 1,
                 attempt_count = 0, last_fired_at = ?3, last_error = NULL,
                 claimed_at = NULL, updated_at = ?3
             WHERE id = ?1 AND state IN ('claimed', 'executing')
               AND attempt_count = ?4 AND claimed_at = ?5",
            params![
                claim.job_id,
                ts(next_fire_at),
                ts(now),
                claim.attempt,
                ts(claim.claimed_at)
            ],
        )?;
        ensure_transitioned(&conn, claim, n, IN_FLIGHT)?;
        debug!(job_id = %claim.job_id, %next_fire_at, "job rescheduled");
        Ok(())
    }

    fn skip_occurrence(
        &self,
        claim: &Claim,
        next_fire_at: DateTime<Utc>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE jobs
             SET state = 'scheduled', next_fire_at = ?2, attempt_count = 0,
                 last_error = ?3, claimed_at = NULL, updated_at = ?4
             WHERE id = ?1 AND state IN ('claimed', 'executing')
               AND attempt_count = ?5 AND claimed_at = ?6",
            params![
                claim.job_id,
                ts(next_fire_at),
                reason,
                ts(now),
                claim.attempt,
                ts(claim.claimed_at)
            ],
        )?;
        ensure_transitioned(&conn, claim, n, IN_FLIGHT)?;
        warn!(job_id = %claim.job_id, %next_fire_at, %reason, "occurrence abandoned, waiting for next");
        Ok(())
    }

    fn cancel(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE jobs SET state = 'cancelled', next_fire_at = NULL, updated_at = ?2
             WHERE id = ?1 AND state = 'scheduled'",
            params![id, ts(now)],
        )?;
        if n > 0 {
            info!(job_id = %id, "job cancelled");
        }
        Ok(n > 0)
    }

    fn cancel_group(&self, group_id: &str, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE jobs SET state = 'cancelled', next_fire_at = NULL, updated_at = ?2
             WHERE group_id = ?1 AND state = 'scheduled'",
            params![group_id, ts(now)],
        )?;
        info!(%group_id, count = n, "job group cancelled");
        Ok(n)
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE (?1 IS NULL OR state = ?1)
               AND (?2 IS NULL OR group_id = ?2)
               AND (?3 IS NULL OR name = ?3)
             ORDER BY next_fire_at IS NULL, next_fire_at, created_at, id
             LIMIT ?4"
        );
        let limit = filter
            .limit
            .and_then(|l| i64::try_from(l).ok())
            .unwrap_or(-1);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![
                    filter.state.map(|s| s.as_str()),
                    filter.group_id,
                    filter.name,
                    limit
                ],
                JobRow::from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    fn recover_stale(&self, now: DateTime<Utc>, timeout: Duration) -> Result<RecoveryReport> {
        let now_s = ts(now);
        let cutoff = ts(stale_cutoff(now, timeout));

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let failed = tx.execute(
            "UPDATE jobs
             SET state = 'failed', next_fire_at = NULL, last_error = ?3,
                 claimed_at = NULL, updated_at = ?1
             WHERE state IN ('claimed', 'executing') AND claimed_at <= ?2
               AND attempt_count >= ?4",
            params![now_s, cutoff, STALE_EXHAUSTED, self.retry.max_attempts],
        )?;
        let requeued = tx.execute(
            "UPDATE jobs
             SET state = 'scheduled', next_fire_at = ?1, last_error = ?3,
                 claimed_at = NULL, updated_at = ?1
             WHERE state IN ('claimed', 'executing') AND claimed_at <= ?2",
            params![now_s, cutoff, STALE_RECOVERED],
        )?;
        tx.commit()?;

        let report = RecoveryReport { requeued, failed };
        if report != RecoveryReport::default() {
            warn!(requeued, failed, "stale claims recovered");
        }
        Ok(report)
    }

    fn record_delivery(&self, record: &DeliveryRecord) -> Result<()> {
        let failed = serde_json::to_string(&record.failed)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO job_deliveries (job_id, attempt, fired_at, succeeded, failed)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.job_id,
                record.attempt,
                ts(record.fired_at),
                i64::try_from(record.succeeded).unwrap_or(i64::MAX),
                failed
            ],
        )?;
        Ok(())
    }

    fn deliveries(&self, job_id: &str) -> Result<Vec<DeliveryRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT job_id, attempt, fired_at, succeeded, failed
             FROM job_deliveries WHERE job_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map([job_id], |row| {
                Ok((
                    row.get::<_, String>(0)?, // job_id
                    row.get::<_, u32>(1)?,    // attempt
                    row.get::<_, String>(2)?, // fired_at
                    row.get::<_, i64>(3)?,    // succeeded
                    row.get::<_, String>(4)?, // failed JSON
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(job_id, attempt, fired_at, succeeded, failed)| {
                Ok(DeliveryRecord {
                    job_id,
                    attempt,
                    fired_at: parse_ts(&fired_at)?,
                    succeeded: usize::try_from(succeeded).unwrap_or_default(),
                    failed: serde_json::from_str(&failed)?,
                })
            })
            .collect()
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::thread;

    use super::*;
    use crate::db;
    use crate::store::conformance::{self, one_shot, t0};

    fn store() -> SqliteJobStore {
        SqliteJobStore::new(Connection::open_in_memory().unwrap(), RetryPolicy::default()).unwrap()
    }

    #[test]
    fn conformance_suite() {
        conformance::run_all(|| Box::new(store()));
    }

    #[test]
    fn timestamps_sort_lexically() {
        let a = ts(DateTime::parse_from_rfc3339("2026-10-16T09:59:59.999Z").unwrap().with_timezone(&Utc));
        let b = ts(DateTime::parse_from_rfc3339("2026-10-16T10:00:00Z").unwrap().with_timezone(&Utc));
        assert_eq!(b, "2026-10-16T10:00:00.000Z");
        assert!(a < b);
    }

    #[test]
    fn concurrent_claimers_never_share_a_job() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let path = path.to_str().unwrap().to_string();
        let busy = Duration::from_secs(10);

        let seed = SqliteJobStore::new(db::open(&path, busy).unwrap(), RetryPolicy::default()).unwrap();
        for i in 0..200 {
            seed.create(one_shot(t0() - chrono::Duration::seconds(i)), t0())
                .unwrap();
        }

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let path = path.clone();
                thread::spawn(move || {
                    let store = SqliteJobStore::new(db::open(&path, busy).unwrap(), RetryPolicy::default())
                        .unwrap();
                    let mut mine = Vec::new();
                    loop {
                        let batch = store.claim_due(t0(), 7).unwrap();
                        if batch.is_empty() {
                            break;
                        }
                        mine.extend(batch.into_iter().map(|j| j.id));
                    }
                    mine
                })
            })
            .collect();

        let mut seen = HashSet::new();
        let mut total = 0;
        for worker in workers {
            for id in worker.join().unwrap() {
                assert!(seen.insert(id), "job claimed twice");
                total += 1;
            }
        }
        assert_eq!(total, 200);
        assert!(seed
            .list(&JobFilter::state(JobState::Scheduled))
            .unwrap()
            .is_empty());
        for job in seed.list(&JobFilter::default()).unwrap() {
            assert_eq!(job.attempt_count, 1);
        }
    }

    #[test]
    fn claims_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let path = path.to_str().unwrap();
        let busy = Duration::from_secs(1);

        let id = {
            let store = SqliteJobStore::new(db::open(path, busy).unwrap(), RetryPolicy::default()).unwrap();
            let id = store.create(one_shot(t0()), t0()).unwrap();
            store.claim_due(t0(), 1).unwrap();
            id
        };
        // Process "restarts" between claim and completion.
        let store = SqliteJobStore::new(db::open(path, busy).unwrap(), RetryPolicy::default()).unwrap();
        let job = store.get(&id).unwrap();
        assert_eq!(job.state, JobState::Claimed);
        assert!(store.claim_due(t0(), 10).unwrap().is_empty());

        let report = store
            .recover_stale(t0() + chrono::Duration::minutes(10), Duration::from_secs(300))
            .unwrap();
        assert_eq!(report.requeued, 1);
        assert_eq!(
            store.claim_due(t0() + chrono::Duration::minutes(10), 10).unwrap().len(),
            1
        );
    }

    #[test]
    fn corrupt_row_surfaces_as_error() {
        let store = store();
        let id = store.create(one_shot(t0()), t0()).unwrap();
        store
            .conn()
            .unwrap()
            .execute("UPDATE jobs SET state = 'bogus' WHERE id = ?1", [&id])
            .unwrap();
        assert!(matches!(
            store.get(&id),
            Err(SchedulerError::StoreConsistency(_))
        ));
    }
}

//! Job Store: durable job records plus the atomic claim primitive.
//!
//! Two implementations share the [`JobStore`] contract:
//!
//! | Store              | Use                                                    |
//! |--------------------|--------------------------------------------------------|
//! | [`SqliteJobStore`] | Production; safe across processes sharing one DB file  |
//! | [`MemoryJobStore`] | Tests and embedded use; safe across threads             |
//!
//! Every transition after a claim is guarded on the current state and on the
//! [`Claim`] handed out by `claim_due`. A call that finds the job in the wrong
//! state, or claimed again by someone else, fails with `StoreConsistency`; an
//! unknown id fails with `JobNotFound`.

mod memory;
mod sqlite;

use std::time::Duration;

use chrono::{DateTime, Utc};

pub use memory::MemoryJobStore;
pub use sqlite::SqliteJobStore;

use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::types::{Claim, DeliveryRecord, Job, JobFilter, JobState, NewJob};

/// Outcome of one stale-claim recovery sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Returned to `Scheduled` with `next_fire_at = now`.
    pub requeued: usize,
    /// Already at the attempt ceiling; moved to `Failed`.
    pub failed: usize,
}

pub trait JobStore: Send + Sync {
    /// Persist a new job in `Scheduled` and return its id.
    fn create(&self, job: NewJob, now: DateTime<Utc>) -> Result<String>;

    /// Persist several jobs at once, all or none; ids come back in input order.
    fn create_many(&self, jobs: Vec<NewJob>, now: DateTime<Utc>) -> Result<Vec<String>>;

    fn get(&self, id: &str) -> Result<Job>;

    /// Atomically move up to `limit` due jobs from `Scheduled` to `Claimed`,
    /// bumping `attempt_count` once per claim. Concurrent callers never receive
    /// the same job.
    fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>>;

    /// `Claimed → Executing`.
    fn mark_executing(&self, claim: &Claim, now: DateTime<Utc>) -> Result<()>;

    /// `Claimed | Executing → Completed` after a successful one-shot delivery.
    fn mark_completed(&self, claim: &Claim, now: DateTime<Utc>) -> Result<()>;

    /// Record a failed delivery. With `retry` and attempts left the job goes back
    /// to `Scheduled` after a backoff delay; otherwise it ends in `Failed`.
    /// Returns the resulting state.
    fn mark_failed(
        &self,
        claim: &Claim,
        retry: bool,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<JobState>;

    /// Recurring success: back to `Scheduled` at `next_fire_at`, `run_count`
    /// bumped, `attempt_count` reset.
    fn reschedule(&self, claim: &Claim, next_fire_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<()>;

    /// Recurring give-up: abandon this occurrence and wait for the next one.
    fn skip_occurrence(
        &self,
        claim: &Claim,
        next_fire_at: DateTime<Utc>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Cancel a `Scheduled` job. `false` if unknown, claimed, or already terminal.
    fn cancel(&self, id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Cancel every `Scheduled` member of a group; returns how many were cancelled.
    fn cancel_group(&self, group_id: &str, now: DateTime<Utc>) -> Result<usize>;

    /// Jobs matching `filter`, soonest `next_fire_at` first.
    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    /// Return jobs stuck in `Claimed`/`Executing` for longer than `timeout` to
    /// `Scheduled`, or to `Failed` when they have no attempts left.
    fn recover_stale(&self, now: DateTime<Utc>, timeout: Duration) -> Result<RecoveryReport>;

    fn record_delivery(&self, record: &DeliveryRecord) -> Result<()>;

    /// Delivery history of one job, oldest first.
    fn deliveries(&self, job_id: &str) -> Result<Vec<DeliveryRecord>>;

    fn retry_policy(&self) -> RetryPolicy;
}

pub(crate) const STALE_RECOVERED: &str = "stale claim recovered";
pub(crate) const STALE_EXHAUSTED: &str = "stale claim with no attempts left";

fn stale_cutoff(now: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|t| now.checked_sub_signed(t))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
pub(crate) mod conformance {
    //! Behaviour every `JobStore` must share; run against each implementation.

    use chrono::{DateTime, Duration, Utc};
    use herald_core::{NotificationKind, Payload, PushMessage, TargetSelector};

    use super::*;
    use crate::error::SchedulerError;
    use crate::types::Trigger;

    pub fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-10-16T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    pub fn payload() -> Payload {
        Payload::new(
            TargetSelector::Topic {
                topic: "daily_challenge".into(),
            },
            PushMessage::new(NotificationKind::DailyReminder, "Daily", "New challenge"),
        )
    }

    pub fn one_shot(at: DateTime<Utc>) -> NewJob {
        NewJob {
            name: "reminder".into(),
            trigger: Trigger::OneShot { at },
            payload: payload(),
            next_fire_at: at,
            group_id: None,
        }
    }

    /// Claim the one job due at `now` and hand back its token.
    pub fn claim_one(store: &dyn JobStore, now: DateTime<Utc>) -> Claim {
        let claimed = store.claim_due(now, 1).unwrap();
        assert_eq!(claimed.len(), 1, "nothing due at {now}");
        claimed[0].claim().unwrap()
    }

    pub fn claim_lifecycle(store: &dyn JobStore) {
        let id = store.create(one_shot(t0()), t0() - Duration::hours(1)).unwrap();
        assert!(store.claim_due(t0() - Duration::seconds(1), 10).unwrap().is_empty());

        let claimed = store.claim_due(t0(), 10).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);
        assert_eq!(claimed[0].state, JobState::Claimed);
        assert_eq!(claimed[0].attempt_count, 1);
        // Already claimed: invisible to the next pass.
        assert!(store.claim_due(t0(), 10).unwrap().is_empty());

        let claim = claimed[0].claim().unwrap();
        assert_eq!(claim.job_id, id);
        assert_eq!(claim.attempt, 1);
        assert_eq!(claim.claimed_at, t0());
        store.mark_executing(&claim, t0()).unwrap();
        store.mark_completed(&claim, t0()).unwrap();
        let job = store.get(&id).unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.next_fire_at, None);
        assert_eq!(job.run_count, 1);
        assert_eq!(job.last_fired_at, Some(t0()));
    }

    pub fn claim_respects_limit_and_order(store: &dyn JobStore) {
        let late = store.create(one_shot(t0()), t0()).unwrap();
        let early = store
            .create(one_shot(t0() - Duration::minutes(5)), t0())
            .unwrap();
        store
            .create(one_shot(t0() - Duration::minutes(2)), t0())
            .unwrap();

        let first = store.claim_due(t0(), 1).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, early);
        let rest = store.claim_due(t0(), 10).unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[1].id, late);
        assert!(store.claim_due(t0(), 0).unwrap().is_empty());
    }

    pub fn wrong_state_transitions_are_rejected(store: &dyn JobStore) {
        let id = store.create(one_shot(t0()), t0()).unwrap();
        assert!(store.get(&id).unwrap().claim().is_none());
        let forged = Claim {
            job_id: id.clone(),
            attempt: 0,
            claimed_at: t0(),
        };
        assert!(matches!(
            store.mark_executing(&forged, t0()),
            Err(SchedulerError::StoreConsistency(_))
        ));
        assert!(matches!(
            store.mark_completed(&forged, t0()),
            Err(SchedulerError::StoreConsistency(_))
        ));
        let missing = Claim {
            job_id: "missing".into(),
            ..forged
        };
        assert!(matches!(
            store.mark_executing(&missing, t0()),
            Err(SchedulerError::JobNotFound { .. })
        ));
        assert!(matches!(
            store.get("missing"),
            Err(SchedulerError::JobNotFound { .. })
        ));
    }

    pub fn transient_failure_retries_until_ceiling(store: &dyn JobStore) {
        let policy = store.retry_policy();
        let id = store.create(one_shot(t0()), t0()).unwrap();
        let mut now = t0();

        for attempt in 1..=policy.max_attempts {
            let claimed = store.claim_due(now, 10).unwrap();
            assert_eq!(claimed.len(), 1, "attempt {attempt} not claimable");
            assert_eq!(claimed[0].attempt_count, attempt);
            let claim = claimed[0].claim().unwrap();
            store.mark_executing(&claim, now).unwrap();
            let state = store.mark_failed(&claim, true, "gateway timeout", now).unwrap();

            if attempt < policy.max_attempts {
                assert_eq!(state, JobState::Scheduled);
                let job = store.get(&id).unwrap();
                let expected = policy.next_attempt_at(now, attempt);
                assert_eq!(job.next_fire_at, Some(expected));
                assert_eq!(job.last_error.as_deref(), Some("gateway timeout"));
                // Not due again before the backoff elapses.
                assert!(store.claim_due(expected - Duration::seconds(1), 10).unwrap().is_empty());
                now = expected;
            } else {
                assert_eq!(state, JobState::Failed);
            }
        }
        let job = store.get(&id).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempt_count, policy.max_attempts);
        assert_eq!(job.next_fire_at, None);
    }

    pub fn permanent_failure_is_terminal(store: &dyn JobStore) {
        store.create(one_shot(t0()), t0()).unwrap();
        let claim = claim_one(store, t0());
        store.mark_executing(&claim, t0()).unwrap();
        let state = store.mark_failed(&claim, false, "unregistered", t0()).unwrap();
        assert_eq!(state, JobState::Failed);
        assert!(store.claim_due(t0() + Duration::days(1), 10).unwrap().is_empty());
    }

    pub fn reschedule_resets_attempts(store: &dyn JobStore) {
        let mut job = one_shot(t0());
        job.trigger = Trigger::Interval {
            every_secs: 60,
            start: t0(),
        };
        let id = store.create(job, t0()).unwrap();
        let claim = claim_one(store, t0());
        store.mark_executing(&claim, t0()).unwrap();
        let next = t0() + Duration::minutes(1);
        store.reschedule(&claim, next, t0()).unwrap();

        let job = store.get(&id).unwrap();
        assert_eq!(job.state, JobState::Scheduled);
        assert_eq!(job.next_fire_at, Some(next));
        assert_eq!(job.attempt_count, 0);
        assert_eq!(job.run_count, 1);

        let claim = claim_one(store, next);
        store.mark_executing(&claim, next).unwrap();
        let after = next + Duration::minutes(1);
        store.skip_occurrence(&claim, after, "gave up", next).unwrap();
        let job = store.get(&id).unwrap();
        assert_eq!(job.state, JobState::Scheduled);
        assert_eq!(job.next_fire_at, Some(after));
        assert_eq!(job.run_count, 1);
        assert_eq!(job.last_error.as_deref(), Some("gave up"));
    }

    pub fn cancel_only_affects_scheduled(store: &dyn JobStore) {
        let scheduled = store.create(one_shot(t0()), t0()).unwrap();
        assert!(store.cancel(&scheduled, t0()).unwrap());
        assert!(!store.cancel(&scheduled, t0()).unwrap());
        assert!(!store.cancel("missing", t0()).unwrap());
        assert!(store.claim_due(t0(), 10).unwrap().is_empty());

        let in_flight = store.create(one_shot(t0()), t0()).unwrap();
        store.claim_due(t0(), 10).unwrap();
        assert!(!store.cancel(&in_flight, t0()).unwrap());
        assert_eq!(store.get(&in_flight).unwrap().state, JobState::Claimed);
    }

    pub fn create_many_keeps_input_order(store: &dyn JobStore) {
        let offsets = [60, 15, 5];
        let jobs = offsets
            .iter()
            .map(|m| {
                let mut job = one_shot(t0() + Duration::minutes(*m));
                job.group_id = Some("g-1".into());
                job
            })
            .collect();
        let ids = store.create_many(jobs, t0()).unwrap();
        assert_eq!(ids.len(), 3);
        for (id, m) in ids.iter().zip(offsets) {
            let job = store.get(id).unwrap();
            assert_eq!(job.state, JobState::Scheduled);
            assert_eq!(job.next_fire_at, Some(t0() + Duration::minutes(m)));
            assert_eq!(job.group_id.as_deref(), Some("g-1"));
        }
        assert!(store.create_many(Vec::new(), t0()).unwrap().is_empty());
    }

    pub fn cancel_group_leaves_no_scheduled_members(store: &dyn JobStore) {
        let mut ids = Vec::new();
        for minutes in [60, 15, 5] {
            let mut job = one_shot(t0() + Duration::minutes(minutes));
            job.group_id = Some("g-1".into());
            ids.push(store.create(job, t0()).unwrap());
        }
        let mut other = one_shot(t0());
        other.group_id = Some("g-2".into());
        store.create(other, t0()).unwrap();

        assert_eq!(store.cancel_group("g-1", t0()).unwrap(), 3);
        let remaining = store
            .list(&JobFilter {
                state: Some(JobState::Scheduled),
                group_id: Some("g-1".into()),
                ..JobFilter::default()
            })
            .unwrap();
        assert!(remaining.is_empty());
        assert_eq!(store.list(&JobFilter::group("g-2")).unwrap().len(), 1);
        assert_eq!(store.cancel_group("g-1", t0()).unwrap(), 0);
    }

    pub fn list_filters_and_orders(store: &dyn JobStore) {
        let b = store.create(one_shot(t0() + Duration::minutes(2)), t0()).unwrap();
        let a = store.create(one_shot(t0() + Duration::minutes(1)), t0()).unwrap();
        let mut named = one_shot(t0() + Duration::minutes(3));
        named.name = "weekly_leaderboard".into();
        let c = store.create(named, t0()).unwrap();
        store.cancel(&b, t0()).unwrap();

        let all: Vec<String> = store
            .list(&JobFilter::default())
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(all, vec![a.clone(), c.clone(), b.clone()]);

        let scheduled = store.list(&JobFilter::state(JobState::Scheduled)).unwrap();
        assert_eq!(scheduled.len(), 2);

        let by_name = store
            .list(&JobFilter {
                name: Some("weekly_leaderboard".into()),
                ..JobFilter::default()
            })
            .unwrap();
        assert_eq!(by_name.len(), 1);
        assert_eq!(by_name[0].id, c);

        let limited = store
            .list(&JobFilter {
                limit: Some(1),
                ..JobFilter::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, a);
    }

    pub fn stale_claims_are_recovered(store: &dyn JobStore) {
        let policy = store.retry_policy();
        let timeout = std::time::Duration::from_secs(300);
        let id = store.create(one_shot(t0()), t0()).unwrap();
        let claim = claim_one(store, t0());
        store.mark_executing(&claim, t0()).unwrap();

        // Not stale yet.
        let report = store
            .recover_stale(t0() + Duration::seconds(299), timeout)
            .unwrap();
        assert_eq!(report, RecoveryReport::default());

        let later = t0() + Duration::minutes(10);
        let report = store.recover_stale(later, timeout).unwrap();
        assert_eq!(report.requeued, 1);
        let job = store.get(&id).unwrap();
        assert_eq!(job.state, JobState::Scheduled);
        assert_eq!(job.next_fire_at, Some(later));
        assert_eq!(job.claimed_at, None);

        let reclaimed = store.claim_due(later, 10).unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].attempt_count, 2);

        // Poison job: crashes on every attempt until the ceiling.
        let mut now = later;
        for _ in 2..policy.max_attempts {
            now += Duration::minutes(10);
            store.recover_stale(now, timeout).unwrap();
            store.claim_due(now, 10).unwrap();
        }
        now += Duration::minutes(10);
        let report = store.recover_stale(now, timeout).unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(store.get(&id).unwrap().state, JobState::Failed);
    }

    pub fn superseded_claim_is_rejected(store: &dyn JobStore) {
        let timeout = std::time::Duration::from_secs(300);
        let mut job = one_shot(t0());
        job.trigger = Trigger::Interval {
            every_secs: 3600,
            start: t0(),
        };
        let id = store.create(job, t0()).unwrap();

        // First worker stalls past the claim timeout.
        let first = claim_one(store, t0());
        store.mark_executing(&first, t0()).unwrap();
        let later = t0() + Duration::minutes(10);
        assert_eq!(store.recover_stale(later, timeout).unwrap().requeued, 1);

        // Second worker takes the job over and starts sending.
        let second = claim_one(store, later);
        assert_ne!(first, second);
        assert_eq!(second.attempt, 2);
        store.mark_executing(&second, later).unwrap();

        // The first worker wakes up; none of its updates may land.
        let resume = later + Duration::seconds(5);
        let next = t0() + Duration::hours(1);
        let rejected = [
            store.mark_executing(&first, resume).map(|_| ()),
            store.reschedule(&first, next, resume),
            store.skip_occurrence(&first, next, "gave up", resume),
            store.mark_completed(&first, resume),
            store.mark_failed(&first, true, "gateway timeout", resume).map(|_| ()),
            store.mark_failed(&first, false, "unregistered", resume).map(|_| ()),
        ];
        for result in rejected {
            assert!(matches!(result, Err(SchedulerError::StoreConsistency(_))));
        }
        let job = store.get(&id).unwrap();
        assert_eq!(job.state, JobState::Executing);
        assert_eq!(job.attempt_count, 2);
        assert_eq!(job.claim(), Some(second.clone()));
        // Still owned by the second worker: no third pass may claim it.
        assert!(store.claim_due(resume, 10).unwrap().is_empty());

        store.reschedule(&second, next, resume).unwrap();
        let job = store.get(&id).unwrap();
        assert_eq!(job.state, JobState::Scheduled);
        assert_eq!(job.next_fire_at, Some(next));
        assert_eq!(job.run_count, 1);

        // A token from an earlier fire stays dead after the job is claimed again.
        let third = claim_one(store, next);
        assert!(matches!(
            store.mark_completed(&second, next),
            Err(SchedulerError::StoreConsistency(_))
        ));
        store.mark_executing(&third, next).unwrap();
    }

    pub fn delivery_history_roundtrip(store: &dyn JobStore) {
        let id = store.create(one_shot(t0()), t0()).unwrap();
        for attempt in 1..=2 {
            store
                .record_delivery(&DeliveryRecord {
                    job_id: id.clone(),
                    attempt,
                    fired_at: t0() + Duration::minutes(attempt as i64),
                    succeeded: 3,
                    failed: vec![("token:abc".into(), "unregistered".into())],
                })
                .unwrap();
        }
        let history = store.deliveries(&id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].attempt, 1);
        assert_eq!(history[1].failed[0].1, "unregistered");
        assert!(store.deliveries("other").unwrap().is_empty());
    }

    /// Run every shared check against fresh stores from `make`.
    pub fn run_all(make: impl Fn() -> Box<dyn JobStore>) {
        claim_lifecycle(make().as_ref());
        claim_respects_limit_and_order(make().as_ref());
        wrong_state_transitions_are_rejected(make().as_ref());
        transient_failure_retries_until_ceiling(make().as_ref());
        permanent_failure_is_terminal(make().as_ref());
        reschedule_resets_attempts(make().as_ref());
        cancel_only_affects_scheduled(make().as_ref());
        create_many_keeps_input_order(make().as_ref());
        cancel_group_leaves_no_scheduled_members(make().as_ref());
        list_filters_and_orders(make().as_ref());
        stale_claims_are_recovered(make().as_ref());
        superseded_claim_is_rejected(make().as_ref());
        delivery_history_roundtrip(make().as_ref());
    }
}

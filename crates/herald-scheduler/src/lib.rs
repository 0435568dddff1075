//! `herald-scheduler`: durable push-notification scheduling.
//!
//! # Overview
//!
//! Jobs (trigger + payload) are persisted through a [`JobStore`]. The
//! [`SchedulerLoop`] polls the store on a fixed tick, atomically claims due
//! jobs, hands each to the [`DeliveryExecutor`], and moves it to its next
//! state: completed, rescheduled, retried with backoff, or failed.
//! [`NotificationScheduler`] is the creation/query surface used by the server.
//!
//! # Trigger variants
//!
//! | Variant    | Behaviour                                                  |
//! |------------|------------------------------------------------------------|
//! | `OneShot`  | Single fire at an absolute UTC instant                     |
//! | `Interval` | `start + k·every`; catches up without replaying missed ticks |
//! | `Cron`     | 5/6-field cron expression in an IANA timezone, DST-aware   |
//!
//! Delivery is at-least-once: a job recovered from a stale claim may be sent
//! again.

pub mod db;
pub mod engine;
pub mod error;
pub mod executor;
pub mod retry;
pub mod sequence;
pub mod service;
pub mod store;
pub mod trigger;
pub mod types;

pub use engine::{JobOutcome, SchedulerLoop, TickReport};
pub use error::{Result, SchedulerError};
pub use executor::{DeliveryExecutor, DeliveryResult, TargetFailure};
pub use retry::RetryPolicy;
pub use sequence::{SequenceSpec, SequenceStep};
pub use service::{EnsureOutcome, NotificationScheduler, SequenceHandle};
pub use store::{JobStore, MemoryJobStore, RecoveryReport, SqliteJobStore};
pub use trigger::compute_next_fire;
pub use types::{Claim, DeliveryRecord, Job, JobFilter, JobState, JobSummary, NewJob, Trigger};

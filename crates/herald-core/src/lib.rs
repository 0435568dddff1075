//! `herald-core`: types and configuration shared by every Herald crate.

pub mod config;
pub mod error;
pub mod types;

pub use error::{HeraldError, Result};
pub use types::{NotificationKind, Payload, Priority, PushMessage, TargetSelector};

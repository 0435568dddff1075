//! `herald-push`: the outbound side of Herald.
//!
//! Two narrow collaborator contracts live here:
//!
//! - [`PushGateway`]: deliver one message to one concrete target. The FCM
//!   HTTP v1 client ([`FcmGateway`]) is the production implementation;
//!   [`DryRunGateway`] logs instead of sending when no credentials exist.
//! - [`TargetResolver`]: turn a [`herald_core::TargetSelector`] into the set
//!   of concrete [`DeliveryTarget`]s. [`SqliteTokenRegistry`] backs it with
//!   the `device_tokens` / `topic_subscriptions` tables.

pub mod db;
pub mod dry_run;
pub mod error;
pub mod fcm;
pub mod gateway;
pub mod registry;

pub use dry_run::DryRunGateway;
pub use error::{GatewayError, RegistryError};
pub use fcm::FcmGateway;
pub use gateway::{DeliveryTarget, PushGateway, SendReceipt};
pub use registry::{DeviceToken, SqliteTokenRegistry, TargetResolver};

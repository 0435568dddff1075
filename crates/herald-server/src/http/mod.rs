pub mod error;
pub mod health;
pub mod notifications;
pub mod tokens;

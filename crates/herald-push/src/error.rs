use thiserror::Error;

/// Errors returned by a [`PushGateway`](crate::gateway::PushGateway).
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The gateway is down or answered with a server error.
    #[error("Gateway unavailable: {0}")]
    Unavailable(String),

    /// The gateway throttled us.
    #[error("Rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    /// The call exceeded its time budget.
    #[error("Gateway call timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// Credentials were refused; an operator can rotate them before the next retry.
    #[error("Gateway authentication failed: {0}")]
    AuthFailed(String),

    /// Transport-level failure (DNS, connect, TLS, body read).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The gateway refused the message itself (malformed, too large, bad topic).
    #[error("Message rejected: {0}")]
    Rejected(String),

    /// The device token is no longer registered with the gateway.
    #[error("Target unregistered: {0}")]
    Unregistered(String),
}

impl GatewayError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Unavailable(_)
            | GatewayError::RateLimited { .. }
            | GatewayError::Timeout { .. }
            | GatewayError::AuthFailed(_)
            | GatewayError::Http(_) => true,
            GatewayError::Rejected(_) | GatewayError::Unregistered(_) => false,
        }
    }
}

/// Errors from the token/topic registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Invalid registry input: {0}")]
    Invalid(String),

    #[error("Registry lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transient_and_permanent() {
        assert!(GatewayError::Unavailable("503".into()).is_transient());
        assert!(GatewayError::RateLimited { retry_after_secs: Some(5) }.is_transient());
        assert!(GatewayError::Timeout { ms: 10 }.is_transient());
        assert!(!GatewayError::Rejected("bad".into()).is_transient());
        assert!(!GatewayError::Unregistered("tok".into()).is_transient());
    }
}

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use herald_core::types::{validate_topic, TargetSelector};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{RegistryError, Result};
use crate::gateway::DeliveryTarget;

/// Resolves a selector into the concrete targets the gateway understands.
///
/// Topics and conditions stay gateway-side (the gateway fans out); tokens and
/// users expand to individual device tokens. An empty result means nobody to
/// deliver to.
pub trait TargetResolver: Send + Sync {
    fn resolve(&self, selector: &TargetSelector) -> Result<Vec<DeliveryTarget>>;
}

/// A device token registered for a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceToken {
    pub token: String,
    pub user_id: String,
    pub platform: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// SQLite-backed user→token and token→topic mappings.
pub struct SqliteTokenRegistry {
    db: Arc<Mutex<Connection>>,
}

impl SqliteTokenRegistry {
    pub fn new(conn: Connection) -> Result<Self> {
        crate::db::init_db(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|_| RegistryError::LockPoisoned)
    }

    /// Register (or move) a token to `user_id`. Re-registering refreshes `updated_at`.
    pub fn register_token(&self, user_id: &str, token: &str, platform: Option<&str>) -> Result<()> {
        if token.trim().is_empty() || user_id.trim().is_empty() {
            return Err(RegistryError::Invalid(
                "user_id and token are required".to_string(),
            ));
        }
        let now = Utc::now().to_rfc3339();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO device_tokens (token, user_id, platform, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(token) DO UPDATE SET
                user_id = excluded.user_id,
                platform = excluded.platform,
                updated_at = excluded.updated_at",
            params![token, user_id, platform, now],
        )?;
        info!(user_id, platform = ?platform, "device token registered");
        Ok(())
    }

    /// Forget a token and its topic memberships, together or not at all.
    /// Returns false if unknown.
    pub fn remove_token(&self, token: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let topics = tx.execute("DELETE FROM topic_subscriptions WHERE token = ?1", [token])?;
        let n = tx.execute("DELETE FROM device_tokens WHERE token = ?1", [token])?;
        tx.commit()?;
        if n > 0 {
            info!(topics, "device token removed");
        }
        Ok(n > 0)
    }

    pub fn tokens_for_user(&self, user_id: &str) -> Result<Vec<DeviceToken>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT token, user_id, platform, created_at, updated_at
             FROM device_tokens WHERE user_id = ?1 ORDER BY created_at, token",
        )?;
        let tokens = stmt
            .query_map([user_id], |row| {
                Ok(DeviceToken {
                    token: row.get(0)?,
                    user_id: row.get(1)?,
                    platform: row.get(2)?,
                    created_at: row.get(3)?,
                    updated_at: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tokens)
    }

    pub fn user_for_token(&self, token: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let user = conn
            .query_row(
                "SELECT user_id FROM device_tokens WHERE token = ?1",
                [token],
                |row| row.get(0),
            )
            .optional()?;
        Ok(user)
    }

    /// Record that `token` is subscribed to `topic`. Idempotent.
    pub fn subscribe(&self, token: &str, topic: &str) -> Result<()> {
        validate_topic(topic).map_err(|e| RegistryError::Invalid(e.to_string()))?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO topic_subscriptions (token, topic, created_at)
             VALUES (?1, ?2, ?3)",
            params![token, topic, Utc::now().to_rfc3339()],
        )?;
        debug!(topic, "topic subscription recorded");
        Ok(())
    }

    /// Returns false if the token was not subscribed.
    pub fn unsubscribe(&self, token: &str, topic: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM topic_subscriptions WHERE token = ?1 AND topic = ?2",
            params![token, topic],
        )?;
        Ok(n > 0)
    }

    pub fn topics_for_token(&self, token: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT topic FROM topic_subscriptions WHERE token = ?1 ORDER BY topic")?;
        let topics = stmt
            .query_map([token], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(topics)
    }

    pub fn subscriber_count(&self, topic: &str) -> Result<usize> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM topic_subscriptions WHERE topic = ?1",
            [topic],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }
}

impl TargetResolver for SqliteTokenRegistry {
    fn resolve(&self, selector: &TargetSelector) -> Result<Vec<DeliveryTarget>> {
        let targets = match selector {
            TargetSelector::Token { token } => vec![DeliveryTarget::Token(token.clone())],
            TargetSelector::Tokens { tokens } => {
                let mut seen = std::collections::HashSet::new();
                tokens
                    .iter()
                    .filter(|t| seen.insert(t.as_str()))
                    .map(|t| DeliveryTarget::Token(t.clone()))
                    .collect()
            }
            TargetSelector::User { user_id } => self
                .tokens_for_user(user_id)?
                .into_iter()
                .map(|t| DeliveryTarget::Token(t.token))
                .collect(),
            TargetSelector::Topic { topic } => vec![DeliveryTarget::Topic(topic.clone())],
            TargetSelector::Condition { condition } => {
                vec![DeliveryTarget::Condition(condition.clone())]
            }
        };
        debug!(%selector, count = targets.len(), "selector resolved");
        Ok(targets)
    }
}

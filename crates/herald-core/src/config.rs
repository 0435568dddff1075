use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::{PushMessage, TargetSelector};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_FCM_BASE_URL: &str = "https://fcm.googleapis.com";
pub const DEFAULT_IID_BASE_URL: &str = "https://iid.googleapis.com";

/// Top-level config (herald.toml + HERALD_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HeraldConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub push: PushConfig,
    /// Named recurring broadcasts ensured at startup.
    pub recurring: Vec<RecurringJobConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    /// How long a writer waits on a locked database before giving up.
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: 5_000,
        }
    }
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Scheduler loop cadence, concurrency and failure handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Poll cadence of the main loop.
    pub tick_interval_ms: u64,
    /// Maximum jobs claimed per tick.
    pub batch_limit: usize,
    /// Maximum jobs executing at once.
    pub worker_limit: usize,
    /// A claim older than this is considered abandoned by a crashed executor.
    pub stale_claim_timeout_secs: u64,
    /// Cadence of the stale-claim recovery sweep.
    pub recovery_interval_secs: u64,
    /// One-shot jobs scheduled at most this far in the past fire immediately.
    pub misfire_grace_secs: u64,
    pub retry: RetryConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 2_000,
            batch_limit: 100,
            worker_limit: 20,
            stale_claim_timeout_secs: 300,
            recovery_interval_secs: 60,
            misfire_grace_secs: 60,
            retry: RetryConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn stale_claim_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_claim_timeout_secs)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_secs.max(1))
    }

    pub fn misfire_grace(&self) -> Duration {
        Duration::from_secs(self.misfire_grace_secs)
    }
}

/// Exponential backoff for transient delivery failures (30s -> 60s -> 120s ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Claims allowed before a job gives up; counts the first attempt.
    pub max_attempts: u32,
    pub initial_backoff_secs: u64,
    pub multiplier: u32,
    pub max_backoff_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_secs: 30,
            multiplier: 2,
            max_backoff_secs: 30 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    /// Upper bound on a single gateway call.
    pub send_timeout_ms: u64,
    /// Concurrent gateway calls per job when fanning out to several targets.
    pub fanout_limit: usize,
    /// FCM credentials. When absent a dry-run gateway logs instead of sending.
    pub fcm: Option<FcmConfig>,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: 10_000,
            fanout_limit: 8,
            fcm: None,
        }
    }
}

impl PushConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FcmConfig {
    pub project_id: String,
    /// OAuth2 bearer token with the firebase.messaging scope.
    pub access_token: String,
    #[serde(default = "default_fcm_base_url")]
    pub base_url: String,
    #[serde(default = "default_iid_base_url")]
    pub iid_base_url: String,
}

/// A recurring broadcast, e.g. the daily challenge reminder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringJobConfig {
    /// Stable name; used to find the job again on restart.
    pub name: String,
    /// 5-field (minute) or 6/7-field (second) cron expression.
    pub cron: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub target: TargetSelector,
    pub message: PushMessage,
}

fn default_fcm_base_url() -> String {
    DEFAULT_FCM_BASE_URL.to_string()
}
fn default_iid_base_url() -> String {
    DEFAULT_IID_BASE_URL.to_string()
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.herald/herald.db", home)
}

impl HeraldConfig {
    /// Load config from a TOML file with HERALD_* env var overrides.
    ///
    /// Nested keys use a double underscore: `HERALD_SCHEDULER__BATCH_LIMIT=50`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::figment(&path)
            .extract()
            .map_err(|e| crate::error::HeraldError::Config(e.to_string()))
    }

    fn figment(path: &str) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("HERALD_").split("__"))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.herald/herald.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NotificationKind;

    #[test]
    fn empty_file_yields_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("herald.toml", "")?;
            let config = HeraldConfig::load(Some("herald.toml")).expect("load");
            assert_eq!(config.server.port, DEFAULT_PORT);
            assert_eq!(config.scheduler.retry.max_attempts, 5);
            assert!(config.push.fcm.is_none());
            assert!(config.recurring.is_empty());
            Ok(())
        });
    }

    #[test]
    fn env_overrides_nested_keys() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("herald.toml", "[scheduler]\nbatch_limit = 10\n")?;
            jail.set_env("HERALD_SCHEDULER__BATCH_LIMIT", "25");
            jail.set_env("HERALD_SERVER__PORT", "9090");
            let config = HeraldConfig::load(Some("herald.toml")).expect("load");
            assert_eq!(config.scheduler.batch_limit, 25);
            assert_eq!(config.server.port, 9090);
            Ok(())
        });
    }

    #[test]
    fn recurring_jobs_parse_from_toml() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "herald.toml",
                r#"
                [[recurring]]
                name = "daily_challenge_reminder"
                cron = "0 9 * * *"
                target = { kind = "topic", topic = "daily_challenge" }

                [recurring.message]
                title = "Daily Challenge Available!"
                body = "Complete today's challenge and climb the leaderboard!"
                kind = "daily_reminder"
                priority = "low"
                route = "home"
                "#,
            )?;
            let config = HeraldConfig::load(Some("herald.toml")).expect("load");
            assert_eq!(config.recurring.len(), 1);
            let job = &config.recurring[0];
            assert_eq!(job.timezone, "UTC");
            assert_eq!(job.message.kind, NotificationKind::DailyReminder);
            assert_eq!(
                job.target,
                TargetSelector::Topic { topic: "daily_challenge".to_string() }
            );
            Ok(())
        });
    }
}

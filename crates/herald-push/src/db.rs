use rusqlite::{Connection, Result};

/// Initialise the registry tables. Safe to call on every startup.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS device_tokens (
            token       TEXT PRIMARY KEY NOT NULL,
            user_id     TEXT NOT NULL,
            platform    TEXT,               -- 'android' | 'ios' | 'web' or NULL
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_device_tokens_user ON device_tokens (user_id);

        -- Local mirror of gateway-side topic membership.
        CREATE TABLE IF NOT EXISTS topic_subscriptions (
            token       TEXT NOT NULL,
            topic       TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            PRIMARY KEY (token, topic)
        );
        CREATE INDEX IF NOT EXISTS idx_topic_subscriptions_topic ON topic_subscriptions (topic);",
    )
}

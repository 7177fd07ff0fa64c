//! SQLite database for persistent storage.
//!
//! Holds the progression ledger (users), voice sessions, quest progress,
//! stat accumulators, and custom quest definitions. All writes that touch
//! the ledger go through [`with_write_retry`].

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::error::{QuestlineError, Result};

/// Maximum attempts for a write hitting transient lock contention.
pub const MAX_WRITE_ATTEMPTS: u32 = 3;
/// Linear backoff unit between retry attempts.
const RETRY_BACKOFF_MS: u64 = 100;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection.
    ///
    /// Creates the database file and initializes schema if needed.
    pub async fn new(path: &str) -> Result<Self> {
        let db_path = Path::new(path);

        // Create parent directories if needed
        if let Some(parent) = db_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    QuestlineError::Database(format!(
                        "Failed to create database directory: {}",
                        e
                    ))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(250));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| {
                QuestlineError::Database(format!("Failed to connect to database: {}", e))
            })?;

        let db = Self { pool };
        db.initialize_schema().await?;

        Ok(db)
    }

    /// Create an in-memory database for testing.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| {
                QuestlineError::Database(format!("Failed to create in-memory db: {}", e))
            })?;

        let db = Self { pool };
        db.initialize_schema().await?;

        Ok(db)
    }

    /// Initialize database schema.
    pub async fn initialize_schema(&self) -> Result<()> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| QuestlineError::Database(format!("Failed to initialize schema: {}", e)))?;

        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Check if the database is healthy.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| QuestlineError::Database(format!("Health check failed: {}", e)))?;

        Ok(())
    }
}

/// Check whether a database error message describes transient lock contention.
fn is_busy_message(msg: &str) -> bool {
    let msg = msg.to_ascii_lowercase();
    msg.contains("database is locked")
        || msg.contains("database table is locked")
        || msg.contains("database is busy")
}

/// Check whether an sqlx error is transient lock contention worth retrying.
fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => is_busy_message(db_err.message()),
        _ => false,
    }
}

/// Execute a database write, retrying on transient lock contention.
///
/// Retries up to [`MAX_WRITE_ATTEMPTS`] total attempts with linear backoff
/// (100 ms × attempt number). Any error other than lock contention
/// propagates immediately; contention that survives all attempts is
/// reported as a hard [`QuestlineError::Database`] failure.
pub async fn with_write_retry<T, F, Fut>(operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if is_busy(&e) && attempt < MAX_WRITE_ATTEMPTS => {
                tracing::warn!(
                    operation = operation,
                    attempt = attempt,
                    "database busy, retrying write"
                );
                tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS * attempt as u64))
                    .await;
            }
            Err(e) => {
                return Err(QuestlineError::Database(format!(
                    "{} failed: {}",
                    operation, e
                )));
            }
        }
    }
}

/// Database schema SQL.
const SCHEMA: &str = r#"
-- Per-member progression accounts
CREATE TABLE IF NOT EXISTS users (
    user_id INTEGER NOT NULL,
    guild_id INTEGER NOT NULL,
    unique_words INTEGER NOT NULL DEFAULT 0,
    lifetime_words INTEGER NOT NULL DEFAULT 0,
    voice_seconds INTEGER NOT NULL DEFAULT 0,
    messages_sent INTEGER NOT NULL DEFAULT 0,
    quests_completed INTEGER NOT NULL DEFAULT 0,
    level INTEGER NOT NULL DEFAULT 0,
    xp INTEGER NOT NULL DEFAULT 0,
    xp_multiplier REAL NOT NULL DEFAULT 1.0,
    autoclaim INTEGER NOT NULL DEFAULT 0,
    daily_quests_done INTEGER NOT NULL DEFAULT 0,
    weekly_quests_done INTEGER NOT NULL DEFAULT 0,
    daily_period TEXT NOT NULL DEFAULT '',
    weekly_period TEXT NOT NULL DEFAULT '',
    created_at TEXT DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (user_id, guild_id)
);

-- Voice sessions; left_at IS NULL marks an open session
CREATE TABLE IF NOT EXISTS voice_sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    guild_id INTEGER NOT NULL,
    channel_id INTEGER NOT NULL,
    joined_at TEXT NOT NULL,
    left_at TEXT
);

-- Quest lifecycle per member: absent -> completed -> claimed
CREATE TABLE IF NOT EXISTS quests_progress (
    user_id INTEGER NOT NULL,
    guild_id INTEGER NOT NULL,
    quest_id TEXT NOT NULL,
    completed INTEGER NOT NULL DEFAULT 0,
    completed_at TEXT,
    claimed INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (user_id, guild_id, quest_id)
);

-- Per-day stat accumulators (additive upsert only)
CREATE TABLE IF NOT EXISTS daily_stats (
    user_id INTEGER NOT NULL,
    guild_id INTEGER NOT NULL,
    day TEXT NOT NULL,
    messages INTEGER NOT NULL DEFAULT 0,
    words INTEGER NOT NULL DEFAULT 0,
    voice_minutes INTEGER NOT NULL DEFAULT 0,
    channels_used INTEGER NOT NULL DEFAULT 0,
    replies INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (user_id, guild_id, day)
);

-- Per-ISO-week stat accumulators, keyed by the week's Monday
CREATE TABLE IF NOT EXISTS weekly_stats (
    user_id INTEGER NOT NULL,
    guild_id INTEGER NOT NULL,
    week_start TEXT NOT NULL,
    messages INTEGER NOT NULL DEFAULT 0,
    words INTEGER NOT NULL DEFAULT 0,
    voice_minutes INTEGER NOT NULL DEFAULT 0,
    channels_used INTEGER NOT NULL DEFAULT 0,
    active_days INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (user_id, guild_id, week_start)
);

-- Distinct channels a member was active in per day
CREATE TABLE IF NOT EXISTS daily_channels (
    user_id INTEGER NOT NULL,
    guild_id INTEGER NOT NULL,
    day TEXT NOT NULL,
    channel_id INTEGER NOT NULL,
    PRIMARY KEY (user_id, guild_id, day, channel_id)
);

-- Guild-scoped custom quest definitions
CREATE TABLE IF NOT EXISTS custom_quests (
    id TEXT PRIMARY KEY,
    guild_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    emoji TEXT NOT NULL DEFAULT '⭐',
    requirements TEXT NOT NULL,
    xp_reward INTEGER NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP
);

-- Indexes
CREATE INDEX IF NOT EXISTS idx_voice_sessions_member ON voice_sessions(user_id, guild_id, left_at);
CREATE INDEX IF NOT EXISTS idx_voice_sessions_open ON voice_sessions(left_at, joined_at);
CREATE INDEX IF NOT EXISTS idx_progress_member ON quests_progress(user_id, guild_id, claimed);
CREATE INDEX IF NOT EXISTS idx_daily_stats_day ON daily_stats(day);
CREATE INDEX IF NOT EXISTS idx_weekly_stats_week ON weekly_stats(week_start);
CREATE INDEX IF NOT EXISTS idx_custom_quests_guild ON custom_quests(guild_id, enabled);
"#;

//! Per-member progression accounts.
//!
//! The account is the durable ledger every other component reads and
//! mutates: XP, level, leveling counters, and quest-period counters.
//! A missing row is "first contact", not an error — a default account is
//! synthesized in memory and persisted on first write.

use std::sync::Arc;

use sqlx::Row;

use crate::database::{with_write_retry, Database};
use crate::error::Result;

/// Durable per-member-per-guild progression record.
#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub user_id: u64,
    pub guild_id: u64,
    /// Word credit toward the next level; reduced on level-up.
    pub unique_words: i64,
    /// Monotonic lifetime word count.
    pub lifetime_words: i64,
    /// Voice credit toward the next level; reduced on level-up.
    pub voice_seconds: i64,
    /// Message credit toward the next level; reduced on level-up.
    pub messages_sent: i64,
    /// Quest credit toward the next level; reduced on level-up.
    pub quests_completed: i64,
    /// Current level, 0..=100, monotonic.
    pub level: i64,
    /// XP credit ledger.
    pub xp: i64,
    /// Base XP multiplier shown on the profile.
    pub xp_multiplier: f64,
    /// Whether completed quests are claimed automatically.
    pub autoclaim: bool,
    /// Daily quests completed in the current period.
    pub daily_quests_done: i64,
    /// Weekly quests completed in the current period.
    pub weekly_quests_done: i64,
    /// Day key the daily counter refers to.
    pub daily_period: String,
    /// Week key the weekly counter refers to.
    pub weekly_period: String,
}

impl Account {
    /// Create a fresh account with default progression state.
    pub fn new(user_id: u64, guild_id: u64) -> Self {
        Self {
            user_id,
            guild_id,
            unique_words: 0,
            lifetime_words: 0,
            voice_seconds: 0,
            messages_sent: 0,
            quests_completed: 0,
            level: 0,
            xp: 0,
            xp_multiplier: 1.0,
            autoclaim: false,
            daily_quests_done: 0,
            weekly_quests_done: 0,
            daily_period: String::new(),
            weekly_period: String::new(),
        }
    }

    /// Roll the period completion counters forward.
    ///
    /// The counters only have meaning within their period; when the day or
    /// ISO week changes they restart from zero.
    pub fn normalize_periods(&mut self, day: &str, week: &str) {
        if self.daily_period != day {
            self.daily_quests_done = 0;
            self.daily_period = day.to_string();
        }
        if self.weekly_period != week {
            self.weekly_quests_done = 0;
            self.weekly_period = week.to_string();
        }
    }
}

/// Durable read/insert/update of [`Account`] rows with retry-on-lock writes.
pub struct AccountLedger {
    db: Arc<Database>,
}

impl AccountLedger {
    /// Create a new account ledger.
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Get the account snapshot for a member.
    ///
    /// Returns a default account when no row exists yet.
    pub async fn get(&self, user_id: u64, guild_id: u64) -> Result<Account> {
        let row = sqlx::query(
            "SELECT user_id, guild_id, unique_words, lifetime_words, voice_seconds,
                    messages_sent, quests_completed, level, xp, xp_multiplier,
                    autoclaim, daily_quests_done, weekly_quests_done,
                    daily_period, weekly_period
             FROM users WHERE user_id = ? AND guild_id = ?",
        )
        .bind(user_id as i64)
        .bind(guild_id as i64)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| {
            crate::error::QuestlineError::Database(format!("Failed to get account: {}", e))
        })?;

        match row {
            Some(row) => Ok(Account {
                user_id: row.get::<i64, _>("user_id") as u64,
                guild_id: row.get::<i64, _>("guild_id") as u64,
                unique_words: row.get("unique_words"),
                lifetime_words: row.get("lifetime_words"),
                voice_seconds: row.get("voice_seconds"),
                messages_sent: row.get("messages_sent"),
                quests_completed: row.get("quests_completed"),
                level: row.get("level"),
                xp: row.get("xp"),
                xp_multiplier: row.get("xp_multiplier"),
                autoclaim: row.get::<i64, _>("autoclaim") != 0,
                daily_quests_done: row.get("daily_quests_done"),
                weekly_quests_done: row.get("weekly_quests_done"),
                daily_period: row.get("daily_period"),
                weekly_period: row.get("weekly_period"),
            }),
            None => Ok(Account::new(user_id, guild_id)),
        }
    }

    /// Insert or update an account row. Last writer wins.
    pub async fn upsert(&self, account: &Account) -> Result<()> {
        let pool = self.db.pool().clone();
        let account = account.clone();

        with_write_retry("upsert_account", move || {
            let pool = pool.clone();
            let a = account.clone();
            async move {
                sqlx::query(
                    "INSERT INTO users (user_id, guild_id, unique_words, lifetime_words,
                                        voice_seconds, messages_sent, quests_completed,
                                        level, xp, xp_multiplier, autoclaim,
                                        daily_quests_done, weekly_quests_done,
                                        daily_period, weekly_period, updated_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
                     ON CONFLICT(user_id, guild_id) DO UPDATE SET
                        unique_words = excluded.unique_words,
                        lifetime_words = excluded.lifetime_words,
                        voice_seconds = excluded.voice_seconds,
                        messages_sent = excluded.messages_sent,
                        quests_completed = excluded.quests_completed,
                        level = excluded.level,
                        xp = excluded.xp,
                        xp_multiplier = excluded.xp_multiplier,
                        autoclaim = excluded.autoclaim,
                        daily_quests_done = excluded.daily_quests_done,
                        weekly_quests_done = excluded.weekly_quests_done,
                        daily_period = excluded.daily_period,
                        weekly_period = excluded.weekly_period,
                        updated_at = CURRENT_TIMESTAMP",
                )
                .bind(a.user_id as i64)
                .bind(a.guild_id as i64)
                .bind(a.unique_words)
                .bind(a.lifetime_words)
                .bind(a.voice_seconds)
                .bind(a.messages_sent)
                .bind(a.quests_completed)
                .bind(a.level)
                .bind(a.xp)
                .bind(a.xp_multiplier)
                .bind(a.autoclaim as i64)
                .bind(a.daily_quests_done)
                .bind(a.weekly_quests_done)
                .bind(a.daily_period.clone())
                .bind(a.weekly_period.clone())
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }

    /// Fetch the top accounts of a guild by XP, for leaderboard display.
    pub async fn top_by_xp(&self, guild_id: u64, limit: u32) -> Result<Vec<Account>> {
        let rows = sqlx::query(
            "SELECT user_id, guild_id, unique_words, lifetime_words, voice_seconds,
                    messages_sent, quests_completed, level, xp, xp_multiplier,
                    autoclaim, daily_quests_done, weekly_quests_done,
                    daily_period, weekly_period
             FROM users WHERE guild_id = ?
             ORDER BY xp DESC, level DESC
             LIMIT ?",
        )
        .bind(guild_id as i64)
        .bind(limit as i64)
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| {
            crate::error::QuestlineError::Database(format!("Failed to get leaderboard: {}", e))
        })?;

        Ok(rows
            .into_iter()
            .map(|row| Account {
                user_id: row.get::<i64, _>("user_id") as u64,
                guild_id: row.get::<i64, _>("guild_id") as u64,
                unique_words: row.get("unique_words"),
                lifetime_words: row.get("lifetime_words"),
                voice_seconds: row.get("voice_seconds"),
                messages_sent: row.get("messages_sent"),
                quests_completed: row.get("quests_completed"),
                level: row.get("level"),
                xp: row.get("xp"),
                xp_multiplier: row.get("xp_multiplier"),
                autoclaim: row.get::<i64, _>("autoclaim") != 0,
                daily_quests_done: row.get("daily_quests_done"),
                weekly_quests_done: row.get("weekly_quests_done"),
                daily_period: row.get("daily_period"),
                weekly_period: row.get("weekly_period"),
            })
            .collect())
    }
}

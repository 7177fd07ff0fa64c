//! Quest progress lifecycle.
//!
//! Per (member, quest) the lifecycle is absent → completed → claimed, with
//! an expired-claim branch handled by the reward economy. Completion is
//! recorded at most once until the period rollover deletes the row.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::Row;

use crate::account::Account;
use crate::database::{with_write_retry, Database};
use crate::error::{QuestlineError, Result};
use crate::quests::{Quest, QuestKind};
use crate::stats::{day_key, week_start_key, DailyStat, WeeklyStat};

/// Persisted quest lifecycle state for one member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestProgress {
    pub user_id: u64,
    pub guild_id: u64,
    pub quest_id: String,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub claimed: bool,
}

/// Merge period accumulators and lifetime account fields into the flat
/// stat snapshot quest requirements are evaluated against.
pub fn build_snapshot(
    daily: &DailyStat,
    weekly: &WeeklyStat,
    account: &Account,
) -> HashMap<String, i64> {
    HashMap::from([
        ("daily_messages".to_string(), daily.messages),
        ("daily_words".to_string(), daily.words),
        ("daily_voice_minutes".to_string(), daily.voice_minutes),
        ("daily_channels".to_string(), daily.channels_used),
        ("daily_replies".to_string(), daily.replies),
        ("weekly_messages".to_string(), weekly.messages),
        ("weekly_words".to_string(), weekly.words),
        ("weekly_voice_minutes".to_string(), weekly.voice_minutes),
        ("weekly_channels".to_string(), weekly.channels_used),
        ("weekly_active_days".to_string(), weekly.active_days),
        ("total_words".to_string(), account.lifetime_words),
        ("level".to_string(), account.level),
        ("xp".to_string(), account.xp),
    ])
}

/// AND semantics: every listed stat must meet its threshold. A stat key
/// absent from the snapshot counts as zero.
pub fn requirements_met(quest: &Quest, snapshot: &HashMap<String, i64>) -> bool {
    quest
        .requirements
        .iter()
        .all(|(key, threshold)| snapshot.get(key).copied().unwrap_or(0) >= *threshold)
}

/// Evaluates the catalog against stat snapshots and manages the
/// completed/claimed lifecycle rows.
pub struct ProgressStore {
    db: Arc<Database>,
}

impl ProgressStore {
    /// Create a new progress store.
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Evaluate every not-yet-completed quest in the catalog against the
    /// snapshot. Returns the quests that completed on this event.
    pub async fn evaluate(
        &self,
        user_id: u64,
        guild_id: u64,
        catalog: &[Quest],
        snapshot: &HashMap<String, i64>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Quest>> {
        let already = self.completed_ids(user_id, guild_id).await?;

        let mut newly_completed = Vec::new();
        for quest in catalog {
            if already.contains(&quest.id) {
                continue;
            }
            if !requirements_met(quest, snapshot) {
                continue;
            }
            if self
                .mark_completed(user_id, guild_id, &quest.id, now)
                .await?
            {
                tracing::info!(
                    user_id = user_id,
                    guild_id = guild_id,
                    quest_id = %quest.id,
                    "quest completed"
                );
                newly_completed.push(quest.clone());
            }
        }

        Ok(newly_completed)
    }

    /// Record a quest completion. Returns false when the quest was already
    /// completed (no intervening reset), leaving the row untouched.
    pub async fn mark_completed(
        &self,
        user_id: u64,
        guild_id: u64,
        quest_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let pool = self.db.pool().clone();
        let quest_id = quest_id.to_string();
        let completed_at = now.to_rfc3339();

        let rows_affected = with_write_retry("mark_quest_completed", move || {
            let pool = pool.clone();
            let quest_id = quest_id.clone();
            let completed_at = completed_at.clone();
            async move {
                sqlx::query(
                    "INSERT OR IGNORE INTO quests_progress
                        (user_id, guild_id, quest_id, completed, completed_at, claimed)
                     VALUES (?, ?, ?, 1, ?, 0)",
                )
                .bind(user_id as i64)
                .bind(guild_id as i64)
                .bind(&quest_id)
                .bind(&completed_at)
                .execute(&pool)
                .await
                .map(|r| r.rows_affected())
            }
        })
        .await?;

        Ok(rows_affected == 1)
    }

    /// Transition completed → claimed. Returns false when the row is
    /// missing, not completed, or already claimed; the caller decides
    /// which rejection to report.
    pub async fn mark_claimed(&self, user_id: u64, guild_id: u64, quest_id: &str) -> Result<bool> {
        let pool = self.db.pool().clone();
        let quest_id = quest_id.to_string();

        let rows_affected = with_write_retry("mark_quest_claimed", move || {
            let pool = pool.clone();
            let quest_id = quest_id.clone();
            async move {
                sqlx::query(
                    "UPDATE quests_progress SET claimed = 1
                     WHERE user_id = ? AND guild_id = ? AND quest_id = ?
                       AND completed = 1 AND claimed = 0",
                )
                .bind(user_id as i64)
                .bind(guild_id as i64)
                .bind(&quest_id)
                .execute(&pool)
                .await
                .map(|r| r.rows_affected())
            }
        })
        .await?;

        Ok(rows_affected == 1)
    }

    /// Get the lifecycle row for one quest, if any.
    pub async fn get(
        &self,
        user_id: u64,
        guild_id: u64,
        quest_id: &str,
    ) -> Result<Option<QuestProgress>> {
        let row = sqlx::query(
            "SELECT user_id, guild_id, quest_id, completed, completed_at, claimed
             FROM quests_progress
             WHERE user_id = ? AND guild_id = ? AND quest_id = ?",
        )
        .bind(user_id as i64)
        .bind(guild_id as i64)
        .bind(quest_id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| QuestlineError::Database(format!("Failed to get progress: {}", e)))?;

        row.map(progress_from_row).transpose()
    }

    /// All completed-but-unclaimed rows for a member.
    pub async fn unclaimed_completed(
        &self,
        user_id: u64,
        guild_id: u64,
    ) -> Result<Vec<QuestProgress>> {
        let rows = sqlx::query(
            "SELECT user_id, guild_id, quest_id, completed, completed_at, claimed
             FROM quests_progress
             WHERE user_id = ? AND guild_id = ? AND completed = 1 AND claimed = 0
             ORDER BY completed_at",
        )
        .bind(user_id as i64)
        .bind(guild_id as i64)
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| QuestlineError::Database(format!("Failed to list unclaimed: {}", e)))?;

        rows.into_iter().map(progress_from_row).collect()
    }

    /// Unclaimed completed quests whose kind-specific expiry deadline has
    /// passed, paired with their catalog definition.
    pub async fn expired_candidates(
        &self,
        user_id: u64,
        guild_id: u64,
        catalog: &[Quest],
        now: DateTime<Utc>,
    ) -> Result<Vec<Quest>> {
        let unclaimed = self.unclaimed_completed(user_id, guild_id).await?;
        let by_id: HashMap<&str, &Quest> =
            catalog.iter().map(|q| (q.id.as_str(), q)).collect();

        let mut expired = Vec::new();
        for progress in unclaimed {
            let Some(quest) = by_id.get(progress.quest_id.as_str()) else {
                continue;
            };
            let Some(expiry_secs) = quest.kind.expiry_secs() else {
                continue;
            };
            let Some(completed_at) = progress.completed_at else {
                continue;
            };
            if (now - completed_at).num_seconds() > expiry_secs {
                expired.push((*quest).clone());
            }
        }

        Ok(expired)
    }

    /// Delete claimed daily/weekly rows from previous periods so those
    /// quests can complete again. Unclaimed rows are left for the expiry
    /// sweep to collect first.
    pub async fn rollover(
        &self,
        user_id: u64,
        guild_id: u64,
        catalog: &[Quest],
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let day_start = format!("{}T00:00:00+00:00", day_key(now));
        let week_start = format!("{}T00:00:00+00:00", week_start_key(now));

        let mut deleted = 0u64;
        for quest in catalog.iter() {
            let cutoff = match quest.kind {
                QuestKind::Daily => &day_start,
                QuestKind::Weekly => &week_start,
                _ => continue,
            };

            let pool = self.db.pool().clone();
            let quest_id = quest.id.clone();
            let cutoff = cutoff.clone();

            deleted += with_write_retry("rollover_quest_progress", move || {
                let pool = pool.clone();
                let quest_id = quest_id.clone();
                let cutoff = cutoff.clone();
                async move {
                    sqlx::query(
                        "DELETE FROM quests_progress
                         WHERE user_id = ? AND guild_id = ? AND quest_id = ?
                           AND claimed = 1 AND completed_at < ?",
                    )
                    .bind(user_id as i64)
                    .bind(guild_id as i64)
                    .bind(&quest_id)
                    .bind(&cutoff)
                    .execute(&pool)
                    .await
                    .map(|r| r.rows_affected())
                }
            })
            .await?;
        }

        Ok(deleted)
    }

    /// Quest ids the member has already completed (claimed or not).
    async fn completed_ids(&self, user_id: u64, guild_id: u64) -> Result<HashSet<String>> {
        let rows = sqlx::query(
            "SELECT quest_id FROM quests_progress
             WHERE user_id = ? AND guild_id = ? AND completed = 1",
        )
        .bind(user_id as i64)
        .bind(guild_id as i64)
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| QuestlineError::Database(format!("Failed to list completed: {}", e)))?;

        Ok(rows.into_iter().map(|row| row.get("quest_id")).collect())
    }
}

fn progress_from_row(row: sqlx::sqlite::SqliteRow) -> Result<QuestProgress> {
    let completed_at: Option<String> = row.get("completed_at");

    Ok(QuestProgress {
        user_id: row.get::<i64, _>("user_id") as u64,
        guild_id: row.get::<i64, _>("guild_id") as u64,
        quest_id: row.get("quest_id"),
        completed: row.get::<i64, _>("completed") != 0,
        completed_at: completed_at
            .as_deref()
            .map(|s| {
                DateTime::parse_from_rfc3339(s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| {
                        QuestlineError::Database(format!("Invalid completed_at: {}", e))
                    })
            })
            .transpose()?,
        claimed: row.get::<i64, _>("claimed") != 0,
    })
}

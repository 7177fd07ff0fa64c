//! Quest catalog: built-in definitions and guild-scoped custom quests.
//!
//! A quest's requirement map uses AND semantics: every listed stat key
//! must meet its threshold. Expiry policy and period-counter effects are
//! functions of the quest kind, not of individual quests.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::Row;
use uuid::Uuid;

use crate::database::{with_write_retry, Database};
use crate::error::{QuestlineError, Result};

/// Seconds before an unclaimed completed daily quest expires.
pub const DAILY_EXPIRY_SECS: i64 = 86_400;
/// Seconds before an unclaimed completed weekly quest expires.
pub const WEEKLY_EXPIRY_SECS: i64 = 604_800;

/// Stat keys a requirement map may reference.
pub const KNOWN_STAT_KEYS: &[&str] = &[
    "daily_messages",
    "daily_words",
    "daily_voice_minutes",
    "daily_channels",
    "daily_replies",
    "weekly_messages",
    "weekly_words",
    "weekly_voice_minutes",
    "weekly_channels",
    "weekly_active_days",
    "total_words",
    "level",
    "xp",
];

/// Quest kind; drives expiry and period-counter effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuestKind {
    Daily,
    Weekly,
    Achievement,
    Special,
    Custom,
}

impl QuestKind {
    /// Convert to string for storage and display.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Achievement => "achievement",
            Self::Special => "special",
            Self::Custom => "custom",
        }
    }

    /// Seconds after completion at which an unclaimed quest expires.
    ///
    /// Achievement, special, and custom quests never expire.
    pub fn expiry_secs(&self) -> Option<i64> {
        match self {
            Self::Daily => Some(DAILY_EXPIRY_SECS),
            Self::Weekly => Some(WEEKLY_EXPIRY_SECS),
            Self::Achievement | Self::Special | Self::Custom => None,
        }
    }

}

/// A quest definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Quest {
    pub id: String,
    pub name: String,
    pub kind: QuestKind,
    /// Stat key → threshold; AND semantics across all entries.
    pub requirements: HashMap<String, i64>,
    pub xp_reward: i64,
    pub emoji: String,
}

impl Quest {
    fn builtin(
        id: &str,
        name: &str,
        kind: QuestKind,
        requirements: &[(&str, i64)],
        xp_reward: i64,
        emoji: &str,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            kind,
            requirements: requirements
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            xp_reward,
            emoji: emoji.to_string(),
        }
    }
}

/// The static built-in catalog shared by every guild.
pub fn builtin_catalog() -> Vec<Quest> {
    vec![
        Quest::builtin(
            "daily_chatter",
            "Daily Chatter",
            QuestKind::Daily,
            &[("daily_messages", 20)],
            150,
            "💬",
        ),
        Quest::builtin(
            "daily_wordsmith",
            "Daily Wordsmith",
            QuestKind::Daily,
            &[("daily_words", 200)],
            200,
            "✍️",
        ),
        Quest::builtin(
            "daily_voice",
            "Voice Regular",
            QuestKind::Daily,
            &[("daily_voice_minutes", 30)],
            250,
            "🎙️",
        ),
        Quest::builtin(
            "daily_explorer",
            "Channel Explorer",
            QuestKind::Daily,
            &[("daily_channels", 3)],
            150,
            "🧭",
        ),
        Quest::builtin(
            "daily_helper",
            "Helping Hand",
            QuestKind::Daily,
            &[("daily_replies", 5)],
            150,
            "🤝",
        ),
        Quest::builtin(
            "weekly_regular",
            "Weekly Regular",
            QuestKind::Weekly,
            &[("weekly_messages", 150)],
            600,
            "📅",
        ),
        Quest::builtin(
            "weekly_voice_marathon",
            "Voice Marathon",
            QuestKind::Weekly,
            &[("weekly_voice_minutes", 180)],
            800,
            "🎧",
        ),
        Quest::builtin(
            "weekly_dedicated",
            "Dedicated",
            QuestKind::Weekly,
            &[("weekly_active_days", 5)],
            1000,
            "🔥",
        ),
        Quest::builtin(
            "wordsmith_veteran",
            "Wordsmith Veteran",
            QuestKind::Achievement,
            &[("total_words", 10_000)],
            2000,
            "📚",
        ),
        Quest::builtin(
            "level_ten",
            "Double Digits",
            QuestKind::Achievement,
            &[("level", 10)],
            1500,
            "🌟",
        ),
        Quest::builtin(
            "level_twenty_five",
            "Quarter Century",
            QuestKind::Achievement,
            &[("level", 25)],
            3000,
            "💎",
        ),
        Quest::builtin(
            "first_words",
            "First Words",
            QuestKind::Special,
            &[("total_words", 1)],
            50,
            "🐣",
        ),
    ]
}

/// Validate a custom quest's requirement map and reward.
///
/// Malformed definitions are rejected here so they never reach the
/// evaluation engine.
pub fn validate_requirements(requirements: &HashMap<String, i64>, xp_reward: i64) -> Result<()> {
    if requirements.is_empty() {
        return Err(QuestlineError::InvalidQuest(
            "requirement map must not be empty".to_string(),
        ));
    }
    for (key, threshold) in requirements {
        if !KNOWN_STAT_KEYS.contains(&key.as_str()) {
            return Err(QuestlineError::InvalidQuest(format!(
                "unknown stat key: {}",
                key
            )));
        }
        if *threshold < 1 {
            return Err(QuestlineError::InvalidQuest(format!(
                "threshold for {} must be at least 1",
                key
            )));
        }
    }
    if xp_reward < 1 {
        return Err(QuestlineError::InvalidQuest(
            "xp reward must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// Built-in catalog plus persisted guild-scoped custom quests.
pub struct QuestCatalog {
    db: Arc<Database>,
}

impl QuestCatalog {
    /// Create a new quest catalog.
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Create a custom quest for a guild. The definition is validated
    /// before anything is persisted.
    pub async fn create_custom(
        &self,
        guild_id: u64,
        name: &str,
        emoji: &str,
        requirements: HashMap<String, i64>,
        xp_reward: i64,
    ) -> Result<Quest> {
        validate_requirements(&requirements, xp_reward)?;
        if name.trim().is_empty() {
            return Err(QuestlineError::InvalidQuest(
                "quest name must not be empty".to_string(),
            ));
        }

        let quest = Quest {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            kind: QuestKind::Custom,
            requirements,
            xp_reward,
            emoji: emoji.to_string(),
        };

        let pool = self.db.pool().clone();
        let requirements_json = serde_json::to_string(&quest.requirements)?;
        let q = quest.clone();

        with_write_retry("create_custom_quest", move || {
            let pool = pool.clone();
            let q = q.clone();
            let requirements_json = requirements_json.clone();
            async move {
                sqlx::query(
                    "INSERT INTO custom_quests (id, guild_id, name, emoji, requirements, xp_reward, enabled)
                     VALUES (?, ?, ?, ?, ?, ?, 1)",
                )
                .bind(&q.id)
                .bind(guild_id as i64)
                .bind(&q.name)
                .bind(&q.emoji)
                .bind(&requirements_json)
                .bind(q.xp_reward)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await?;

        Ok(quest)
    }

    /// Replace a custom quest's requirements and reward, re-validating.
    pub async fn update_custom(
        &self,
        guild_id: u64,
        quest_id: &str,
        requirements: HashMap<String, i64>,
        xp_reward: i64,
    ) -> Result<bool> {
        validate_requirements(&requirements, xp_reward)?;

        let pool = self.db.pool().clone();
        let requirements_json = serde_json::to_string(&requirements)?;
        let quest_id = quest_id.to_string();

        let rows_affected = with_write_retry("update_custom_quest", move || {
            let pool = pool.clone();
            let requirements_json = requirements_json.clone();
            let quest_id = quest_id.clone();
            async move {
                sqlx::query(
                    "UPDATE custom_quests SET requirements = ?, xp_reward = ?
                     WHERE id = ? AND guild_id = ?",
                )
                .bind(&requirements_json)
                .bind(xp_reward)
                .bind(&quest_id)
                .bind(guild_id as i64)
                .execute(&pool)
                .await
                .map(|r| r.rows_affected())
            }
        })
        .await?;

        Ok(rows_affected == 1)
    }

    /// Enable or disable a custom quest without deleting it.
    pub async fn set_enabled(&self, guild_id: u64, quest_id: &str, enabled: bool) -> Result<bool> {
        let pool = self.db.pool().clone();
        let quest_id = quest_id.to_string();

        let rows_affected = with_write_retry("toggle_custom_quest", move || {
            let pool = pool.clone();
            let quest_id = quest_id.clone();
            async move {
                sqlx::query("UPDATE custom_quests SET enabled = ? WHERE id = ? AND guild_id = ?")
                    .bind(enabled as i64)
                    .bind(&quest_id)
                    .bind(guild_id as i64)
                    .execute(&pool)
                    .await
                    .map(|r| r.rows_affected())
            }
        })
        .await?;

        Ok(rows_affected == 1)
    }

    /// The evaluable catalog for a guild: built-ins plus enabled customs.
    pub async fn catalog_for_guild(&self, guild_id: u64) -> Result<Vec<Quest>> {
        let mut catalog = builtin_catalog();
        catalog.extend(self.custom_for_guild(guild_id, true).await?);
        Ok(catalog)
    }

    /// Find a quest by id within a guild's catalog (built-in or custom,
    /// including disabled customs so stale progress stays resolvable).
    pub async fn find(&self, guild_id: u64, quest_id: &str) -> Result<Option<Quest>> {
        if let Some(quest) = builtin_catalog().into_iter().find(|q| q.id == quest_id) {
            return Ok(Some(quest));
        }
        let customs = self.custom_for_guild(guild_id, false).await?;
        Ok(customs.into_iter().find(|q| q.id == quest_id))
    }

    /// Custom quests for a guild; `enabled_only` filters disabled ones.
    pub async fn custom_for_guild(&self, guild_id: u64, enabled_only: bool) -> Result<Vec<Quest>> {
        let sql = if enabled_only {
            "SELECT id, name, emoji, requirements, xp_reward FROM custom_quests
             WHERE guild_id = ? AND enabled = 1 ORDER BY created_at"
        } else {
            "SELECT id, name, emoji, requirements, xp_reward FROM custom_quests
             WHERE guild_id = ? ORDER BY created_at"
        };

        let rows = sqlx::query(sql)
            .bind(guild_id as i64)
            .fetch_all(self.db.pool())
            .await
            .map_err(|e| {
                QuestlineError::Database(format!("Failed to list custom quests: {}", e))
            })?;

        let mut quests = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            let requirements_json: String = row.get("requirements");
            match serde_json::from_str::<HashMap<String, i64>>(&requirements_json) {
                Ok(requirements) => quests.push(Quest {
                    id,
                    name: row.get("name"),
                    kind: QuestKind::Custom,
                    requirements,
                    xp_reward: row.get("xp_reward"),
                    emoji: row.get("emoji"),
                }),
                Err(e) => {
                    // Creation-time validation should make this unreachable;
                    // skip the row rather than poison the whole catalog.
                    tracing::warn!(quest_id = %id, error = %e, "skipping custom quest with malformed requirements");
                }
            }
        }

        Ok(quests)
    }
}

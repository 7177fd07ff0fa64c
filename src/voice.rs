//! Voice session duration accounting.
//!
//! A session opens on join and closes exactly once, through one of three
//! paths: explicit leave, the periodic orphan sweep, or startup/reconnect
//! catch-up. All three act only on `left_at IS NULL` rows and set
//! `left_at`, so a session is never credited twice.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::Row;

use crate::database::{with_write_retry, Database};
use crate::error::{QuestlineError, Result};

/// Hard cap on credited seconds for any single session.
pub const SESSION_CAP_SECS: i64 = 18_000;

/// Open sessions older than this are considered orphaned.
pub const ORPHAN_AGE_SECS: i64 = 3_600;

/// A voice session row.
#[derive(Debug, Clone)]
pub struct VoiceSession {
    pub id: i64,
    pub user_id: u64,
    pub guild_id: u64,
    pub channel_id: u64,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
}

/// A session that was just closed, with the seconds to credit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedSession {
    pub user_id: u64,
    pub guild_id: u64,
    pub channel_id: u64,
    pub credited_seconds: i64,
}

/// Seconds to credit for a session spanning `joined_at..now`, capped at
/// [`SESSION_CAP_SECS`] and floored at zero.
pub fn capped_credit(joined_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - joined_at).num_seconds().clamp(0, SESSION_CAP_SECS)
}

/// Persistence and recovery for voice sessions.
pub struct VoiceTracker {
    db: Arc<Database>,
}

impl VoiceTracker {
    /// Create a new voice tracker.
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Open a session for a member joining a voice channel.
    ///
    /// Any stale open session for the same (member, guild) is force-deleted
    /// first, keeping at most one open session per pair.
    pub async fn open_session(
        &self,
        user_id: u64,
        guild_id: u64,
        channel_id: u64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let pool = self.db.pool().clone();
        let joined_at = now.to_rfc3339();

        with_write_retry("open_voice_session", move || {
            let pool = pool.clone();
            let joined_at = joined_at.clone();
            async move {
                sqlx::query(
                    "DELETE FROM voice_sessions
                     WHERE user_id = ? AND guild_id = ? AND left_at IS NULL",
                )
                .bind(user_id as i64)
                .bind(guild_id as i64)
                .execute(&pool)
                .await?;

                sqlx::query(
                    "INSERT INTO voice_sessions (user_id, guild_id, channel_id, joined_at, left_at)
                     VALUES (?, ?, ?, ?, NULL)",
                )
                .bind(user_id as i64)
                .bind(guild_id as i64)
                .bind(channel_id as i64)
                .bind(&joined_at)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }

    /// Close the member's open session on explicit leave.
    ///
    /// Returns None when no open session exists — expected for members who
    /// joined voice before tracking started; no credit, no error.
    pub async fn close_open_session(
        &self,
        user_id: u64,
        guild_id: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<ClosedSession>> {
        let open = self.open_session_for(user_id, guild_id).await?;
        let Some(session) = open else {
            return Ok(None);
        };

        match self.finalize(&session, now).await? {
            true => Ok(Some(ClosedSession {
                user_id: session.user_id,
                guild_id: session.guild_id,
                channel_id: session.channel_id,
                credited_seconds: capped_credit(session.joined_at, now),
            })),
            // Another path closed it between the read and the update.
            false => Ok(None),
        }
    }

    /// Close every open session older than [`ORPHAN_AGE_SECS`].
    ///
    /// Recovers sessions whose leave event was missed. Returns the closed
    /// sessions with their capped credit.
    pub async fn close_orphans(&self, now: DateTime<Utc>) -> Result<Vec<ClosedSession>> {
        let cutoff = now - chrono::Duration::seconds(ORPHAN_AGE_SECS);
        let orphans = self.open_sessions_before(cutoff).await?;
        self.close_batch(orphans, now).await
    }

    /// Close every open session regardless of age.
    ///
    /// Startup/reconnect catch-up: credits time accrued while the process
    /// was disconnected before normal tracking resumes.
    pub async fn close_all_open(&self, now: DateTime<Utc>) -> Result<Vec<ClosedSession>> {
        let open = self.open_sessions_before(now).await?;
        self.close_batch(open, now).await
    }

    /// Get the open session for a member, if any.
    pub async fn open_session_for(
        &self,
        user_id: u64,
        guild_id: u64,
    ) -> Result<Option<VoiceSession>> {
        let row = sqlx::query(
            "SELECT id, user_id, guild_id, channel_id, joined_at, left_at
             FROM voice_sessions
             WHERE user_id = ? AND guild_id = ? AND left_at IS NULL
             ORDER BY joined_at DESC LIMIT 1",
        )
        .bind(user_id as i64)
        .bind(guild_id as i64)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| QuestlineError::Database(format!("Failed to get open session: {}", e)))?;

        row.map(session_from_row).transpose()
    }

    /// All open sessions whose join time is strictly before `cutoff`.
    async fn open_sessions_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<VoiceSession>> {
        let rows = sqlx::query(
            "SELECT id, user_id, guild_id, channel_id, joined_at, left_at
             FROM voice_sessions
             WHERE left_at IS NULL AND joined_at < ?",
        )
        .bind(cutoff.to_rfc3339())
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| QuestlineError::Database(format!("Failed to list open sessions: {}", e)))?;

        rows.into_iter().map(session_from_row).collect()
    }

    async fn close_batch(
        &self,
        sessions: Vec<VoiceSession>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClosedSession>> {
        let mut closed = Vec::with_capacity(sessions.len());
        for session in sessions {
            if self.finalize(&session, now).await? {
                closed.push(ClosedSession {
                    user_id: session.user_id,
                    guild_id: session.guild_id,
                    channel_id: session.channel_id,
                    credited_seconds: capped_credit(session.joined_at, now),
                });
            }
        }
        Ok(closed)
    }

    /// Set `left_at` on a session, guarded on it still being open.
    ///
    /// Returns false when another closing path won the race; the caller
    /// must not credit in that case.
    async fn finalize(&self, session: &VoiceSession, now: DateTime<Utc>) -> Result<bool> {
        let pool = self.db.pool().clone();
        let session_id = session.id;
        let left_at = now.to_rfc3339();

        let rows_affected = with_write_retry("close_voice_session", move || {
            let pool = pool.clone();
            let left_at = left_at.clone();
            async move {
                sqlx::query(
                    "UPDATE voice_sessions SET left_at = ? WHERE id = ? AND left_at IS NULL",
                )
                .bind(&left_at)
                .bind(session_id)
                .execute(&pool)
                .await
                .map(|r| r.rows_affected())
            }
        })
        .await?;

        Ok(rows_affected == 1)
    }
}

fn session_from_row(row: sqlx::sqlite::SqliteRow) -> Result<VoiceSession> {
    let joined_at: String = row.get("joined_at");
    let left_at: Option<String> = row.get("left_at");

    Ok(VoiceSession {
        id: row.get("id"),
        user_id: row.get::<i64, _>("user_id") as u64,
        guild_id: row.get::<i64, _>("guild_id") as u64,
        channel_id: row.get::<i64, _>("channel_id") as u64,
        joined_at: parse_timestamp(&joined_at)?,
        left_at: left_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| QuestlineError::Database(format!("Invalid session timestamp: {}", e)))
}


#[cfg(test)]
mod property_tests {
    use chrono::{Duration, Utc};
    use proptest::prelude::*;

    use super::capped_credit;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// For all session durations d, credited seconds = min(d, 18000),
        /// and never negative.
        #[test]
        fn prop_credit_bounds(duration_secs in -100_000i64..1_000_000) {
            let join = Utc::now();
            let leave = join + Duration::seconds(duration_secs);
            let credit = capped_credit(join, leave);

            prop_assert!(credit >= 0);
            prop_assert!(credit <= 18_000);
            if (0..=18_000).contains(&duration_secs) {
                prop_assert_eq!(credit, duration_secs);
            }
        }
    }
}

//! Activity engine: turns platform events into progression state.
//!
//! One entry point per tracked event (message, voice state change,
//! reconnect). Each event flows raw counters into the account ledger and
//! stat accumulators, then runs the quest evaluation and the single-step
//! level check. The engine returns outcomes as data; it never formats
//! user-facing text.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::future::Cache;
use sha2::{Digest, Sha256};

use crate::account::AccountLedger;
use crate::error::Result;
use crate::levels::{check_level_up, LevelUp};
use crate::progress::{build_snapshot, ProgressStore};
use crate::quests::{Quest, QuestCatalog};
use crate::rewards::RewardEconomy;
use crate::stats::{day_key, week_start_key, StatsRecorder};
use crate::voice::{ClosedSession, VoiceTracker};

/// Per-message cap on credited words.
pub const WORD_XP_CAP: i64 = 50;

/// Word credit for a message: (unique words, raw words), each capped at
/// [`WORD_XP_CAP`]. Uniqueness is case-insensitive within the message.
pub fn word_credits(content: &str) -> (i64, i64) {
    let raw = content.split_whitespace().count() as i64;
    let unique = content
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<HashSet<_>>()
        .len() as i64;
    (unique.min(WORD_XP_CAP), raw.min(WORD_XP_CAP))
}

fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.trim().to_lowercase().as_bytes());
    hex::encode(digest)
}

/// Bounded last-message-per-channel cache for duplicate-spam detection.
///
/// Owned by the engine and cleared on disconnect; entries also age out on
/// their own so the cache never grows with the number of channels.
pub struct MessageDedup {
    recent: Cache<u64, (u64, String)>,
}

impl MessageDedup {
    /// Create a dedup cache with default capacity and TTL.
    pub fn new() -> Self {
        Self {
            recent: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(Duration::from_secs(600))
                .build(),
        }
    }

    /// Record the message and report whether it duplicates the channel's
    /// previous message from the same author.
    pub async fn is_duplicate(&self, channel_id: u64, author_id: u64, content: &str) -> bool {
        let hash = content_hash(content);
        let previous = self.recent.get(&channel_id).await;
        let duplicate =
            matches!(previous, Some((author, prev_hash)) if author == author_id && prev_hash == hash);
        self.recent.insert(channel_id, (author_id, hash)).await;
        duplicate
    }

    /// Drop all remembered messages.
    pub fn clear(&self) {
        self.recent.invalidate_all();
    }
}

impl Default for MessageDedup {
    fn default() -> Self {
        Self::new()
    }
}

/// A tracked message event.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub user_id: u64,
    pub guild_id: u64,
    pub channel_id: u64,
    pub content: String,
    pub is_reply: bool,
}

/// What an event produced, for the presentation layer to announce.
///
/// Expired-quest collection and orphan cleanup never appear here; they
/// are intentionally silent.
#[derive(Debug, Clone, Default)]
pub struct ActivityOutcome {
    pub level_up: Option<LevelUp>,
    pub completed_quests: Vec<Quest>,
    pub auto_claimed: Vec<(Quest, i64)>,
}

/// Orchestrates ledger, stats, quests, rewards, and voice accounting.
pub struct ActivityEngine {
    ledger: Arc<AccountLedger>,
    stats: Arc<StatsRecorder>,
    catalog: Arc<QuestCatalog>,
    progress: Arc<ProgressStore>,
    rewards: Arc<RewardEconomy>,
    voice: Arc<VoiceTracker>,
    dedup: MessageDedup,
}

impl ActivityEngine {
    /// Create a new activity engine.
    pub fn new(
        ledger: Arc<AccountLedger>,
        stats: Arc<StatsRecorder>,
        catalog: Arc<QuestCatalog>,
        progress: Arc<ProgressStore>,
        rewards: Arc<RewardEconomy>,
        voice: Arc<VoiceTracker>,
    ) -> Self {
        Self {
            ledger,
            stats,
            catalog,
            progress,
            rewards,
            voice,
            dedup: MessageDedup::new(),
        }
    }

    /// Process a message event.
    pub async fn on_message(
        &self,
        event: &MessageEvent,
        now: DateTime<Utc>,
    ) -> Result<ActivityOutcome> {
        if self
            .dedup
            .is_duplicate(event.channel_id, event.user_id, &event.content)
            .await
        {
            tracing::debug!(
                user_id = event.user_id,
                channel_id = event.channel_id,
                "duplicate message, no credit"
            );
            return Ok(ActivityOutcome::default());
        }

        let (unique_words, raw_words) = word_credits(&event.content);

        let mut account = self.ledger.get(event.user_id, event.guild_id).await?;
        account.normalize_periods(&day_key(now), &week_start_key(now));
        account.unique_words += unique_words;
        account.lifetime_words += raw_words;
        account.messages_sent += 1;
        self.ledger.upsert(&account).await?;

        self.stats
            .record_message(
                event.user_id,
                event.guild_id,
                event.channel_id,
                raw_words,
                event.is_reply,
                now,
            )
            .await?;

        let catalog = self.catalog.catalog_for_guild(event.guild_id).await?;

        // Opportunistic maintenance: roll stale claimed rows, then collect
        // expired unclaimed rewards (silently).
        self.progress
            .rollover(event.user_id, event.guild_id, &catalog, now)
            .await?;
        self.rewards
            .collect_expired(event.user_id, event.guild_id, &catalog, now)
            .await?;

        self.evaluate_and_level(event.user_id, event.guild_id, &catalog, now)
            .await
    }

    /// Process a voice state change.
    ///
    /// `before`/`after` are the channel the member occupied before and
    /// after the change; `None` means not in voice.
    pub async fn on_voice_state(
        &self,
        user_id: u64,
        guild_id: u64,
        before: Option<u64>,
        after: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<ActivityOutcome> {
        match (before, after) {
            // Mute/deafen toggles arrive as state changes within the same
            // channel; nothing to track.
            (b, a) if b == a => Ok(ActivityOutcome::default()),
            (_, Some(channel_id)) => {
                // Join or move: the open-session invariant clears any
                // stale open row for this member.
                self.voice
                    .open_session(user_id, guild_id, channel_id, now)
                    .await?;
                Ok(ActivityOutcome::default())
            }
            (Some(_), None) => {
                let Some(closed) = self.voice.close_open_session(user_id, guild_id, now).await?
                else {
                    // Leave without a tracked session: joined before the
                    // bot was watching. Tolerated, no credit.
                    return Ok(ActivityOutcome::default());
                };

                self.apply_voice_credit(&closed, now).await?;

                let catalog = self.catalog.catalog_for_guild(guild_id).await?;
                self.evaluate_and_level(user_id, guild_id, &catalog, now)
                    .await
            }
            (None, None) => Ok(ActivityOutcome::default()),
        }
    }

    /// Credit and close every open session older than the orphan age.
    ///
    /// Runs on a timer; recovery is silent.
    pub async fn sweep_orphan_sessions(&self, now: DateTime<Utc>) -> Result<usize> {
        let closed = self.voice.close_orphans(now).await?;
        let count = closed.len();
        for session in closed {
            self.apply_voice_credit(&session, now).await?;
            tracing::info!(
                user_id = session.user_id,
                guild_id = session.guild_id,
                credited_seconds = session.credited_seconds,
                "orphaned voice session recovered"
            );
        }
        Ok(count)
    }

    /// Credit and close all open sessions on startup or reconnect, so
    /// time accrued while disconnected is not lost.
    pub async fn catch_up_voice_sessions(&self, now: DateTime<Utc>) -> Result<usize> {
        let closed = self.voice.close_all_open(now).await?;
        let count = closed.len();
        for session in closed {
            self.apply_voice_credit(&session, now).await?;
        }
        if count > 0 {
            tracing::info!(count = count, "voice sessions reconciled at startup");
        }
        Ok(count)
    }

    /// Forget transient per-channel state when the gateway drops.
    pub fn on_disconnect(&self) {
        self.dedup.clear();
    }

    async fn apply_voice_credit(&self, session: &ClosedSession, now: DateTime<Utc>) -> Result<()> {
        let mut account = self.ledger.get(session.user_id, session.guild_id).await?;
        account.voice_seconds += session.credited_seconds;
        self.ledger.upsert(&account).await?;

        self.stats
            .record_voice(
                session.user_id,
                session.guild_id,
                session.credited_seconds,
                now,
            )
            .await
    }

    /// Shared tail of every tracked event: evaluate the quest catalog,
    /// auto-claim for opted-in accounts, then run one level check.
    async fn evaluate_and_level(
        &self,
        user_id: u64,
        guild_id: u64,
        catalog: &[Quest],
        now: DateTime<Utc>,
    ) -> Result<ActivityOutcome> {
        // Re-read: maintenance paths may have credited the account since
        // the event started.
        let account = self.ledger.get(user_id, guild_id).await?;

        let daily = self.stats.daily(user_id, guild_id, &day_key(now)).await?;
        let weekly = self
            .stats
            .weekly(user_id, guild_id, &week_start_key(now))
            .await?;
        let snapshot = build_snapshot(&daily, &weekly, &account);

        let completed_quests = self
            .progress
            .evaluate(user_id, guild_id, catalog, &snapshot, now)
            .await?;

        let mut auto_claimed = Vec::new();
        if account.autoclaim {
            for quest in &completed_quests {
                if let Some(credited) =
                    self.rewards.auto_claim(user_id, guild_id, quest, now).await?
                {
                    auto_claimed.push((quest.clone(), credited));
                }
            }
        }

        let mut account = self.ledger.get(user_id, guild_id).await?;
        let level_up = check_level_up(&mut account);
        if let Some(up) = level_up {
            self.ledger.upsert(&account).await?;
            tracing::info!(
                user_id = user_id,
                guild_id = guild_id,
                level = up.new_level,
                xp_awarded = up.xp_awarded,
                "level up"
            );
        }

        Ok(ActivityOutcome {
            level_up,
            completed_quests,
            auto_claimed,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use chrono::{DateTime, Duration, Utc};

    use super::*;
    use crate::account::AccountLedger;
    use crate::database::Database;
    use crate::levels::requirement_for;
    use crate::progress::ProgressStore;
    use crate::quests::QuestCatalog;
    use crate::rewards::RewardEconomy;
    use crate::stats::StatsRecorder;
    use crate::voice::VoiceTracker;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .expect("valid timestamp")
            .with_timezone(&Utc)
    }

    struct Fixture {
        ledger: Arc<AccountLedger>,
        catalog: Arc<QuestCatalog>,
        voice: Arc<VoiceTracker>,
        engine: ActivityEngine,
    }

    async fn fixture() -> Fixture {
        let db = Arc::new(Database::in_memory().await.expect("should create db"));
        let ledger = Arc::new(AccountLedger::new(db.clone()));
        let stats = Arc::new(StatsRecorder::new(db.clone()));
        let catalog = Arc::new(QuestCatalog::new(db.clone()));
        let progress = Arc::new(ProgressStore::new(db.clone()));
        let rewards = Arc::new(RewardEconomy::new(
            ledger.clone(),
            progress.clone(),
            catalog.clone(),
        ));
        let voice = Arc::new(VoiceTracker::new(db));
        let engine = ActivityEngine::new(
            ledger.clone(),
            stats,
            catalog.clone(),
            progress,
            rewards,
            voice.clone(),
        );
        Fixture {
            ledger,
            catalog,
            voice,
            engine,
        }
    }

    fn message(content: &str) -> MessageEvent {
        MessageEvent {
            user_id: 1,
            guild_id: 2,
            channel_id: 10,
            content: content.to_string(),
            is_reply: false,
        }
    }

    #[test]
    fn word_credits_count_and_cap() {
        assert_eq!(word_credits("hello world"), (2, 2));
        assert_eq!(word_credits("hello hello"), (1, 2));
        assert_eq!(word_credits("Hello HELLO world"), (2, 3));
        assert_eq!(word_credits(""), (0, 0));

        let long: String = (0..60).map(|i| format!("word{} ", i)).collect();
        assert_eq!(word_credits(&long), (WORD_XP_CAP, WORD_XP_CAP));
    }

    #[tokio::test]
    async fn two_word_message_credits_counters_and_daily_quest() {
        let f = fixture().await;
        let now = ts("2026-08-06T12:00:00Z");

        // A custom daily-style quest satisfied by a single message.
        let quest = f
            .catalog
            .create_custom(
                2,
                "Say Anything",
                "🗣️",
                HashMap::from([("daily_messages".to_string(), 1i64)]),
                100,
            )
            .await
            .expect("should create quest");

        let outcome = f
            .engine
            .on_message(&message("hello world"), now)
            .await
            .expect("should process");

        let account = f.ledger.get(1, 2).await.expect("should get");
        assert_eq!(account.unique_words, 2);
        assert_eq!(account.lifetime_words, 2);
        assert_eq!(account.messages_sent, 1);

        assert!(outcome
            .completed_quests
            .iter()
            .any(|q| q.id == quest.id));
    }

    #[tokio::test]
    async fn duplicate_messages_earn_nothing() {
        let f = fixture().await;
        let now = ts("2026-08-06T12:00:00Z");

        f.engine
            .on_message(&message("hello world"), now)
            .await
            .expect("first message");
        f.engine
            .on_message(&message("hello world"), now + Duration::seconds(5))
            .await
            .expect("duplicate message");

        let account = f.ledger.get(1, 2).await.expect("should get");
        assert_eq!(account.messages_sent, 1);
        assert_eq!(account.lifetime_words, 2);

        // A different message from the same member is credited again
        f.engine
            .on_message(&message("something new"), now + Duration::seconds(10))
            .await
            .expect("fresh message");
        let account = f.ledger.get(1, 2).await.expect("should get");
        assert_eq!(account.messages_sent, 2);
    }

    #[tokio::test]
    async fn same_content_from_another_member_is_credited() {
        let f = fixture().await;
        let now = ts("2026-08-06T12:00:00Z");

        f.engine
            .on_message(&message("hello world"), now)
            .await
            .expect("first author");

        let mut other = message("hello world");
        other.user_id = 7;
        f.engine
            .on_message(&other, now + Duration::seconds(1))
            .await
            .expect("second author");

        let account = f.ledger.get(7, 2).await.expect("should get");
        assert_eq!(account.messages_sent, 1);
    }

    #[tokio::test]
    async fn message_event_can_trigger_level_up() {
        let f = fixture().await;
        let now = ts("2026-08-06T12:00:00Z");
        let req = requirement_for(1).expect("level 1");

        // One message short of the requirement, everything else satisfied.
        let mut account = crate::account::Account::new(1, 2);
        account.unique_words = req.words;
        account.voice_seconds = req.voice_seconds();
        account.messages_sent = req.messages - 1;
        account.quests_completed = req.quests;
        f.ledger.upsert(&account).await.expect("seed account");

        let outcome = f
            .engine
            .on_message(&message("one more"), now)
            .await
            .expect("should process");

        let up = outcome.level_up.expect("should level up");
        assert_eq!(up.new_level, 1);

        let account = f.ledger.get(1, 2).await.expect("should get");
        assert_eq!(account.level, 1);
        // Surplus from the triggering message carries over
        assert_eq!(account.unique_words, 2);
        assert_eq!(account.messages_sent, 0);
    }

    #[tokio::test]
    async fn voice_leave_credits_and_checks_level() {
        let f = fixture().await;
        let join = ts("2026-08-06T12:00:00Z");
        let leave = join + Duration::minutes(45);

        f.engine
            .on_voice_state(1, 2, None, Some(30), join)
            .await
            .expect("join");
        f.engine
            .on_voice_state(1, 2, Some(30), None, leave)
            .await
            .expect("leave");

        let account = f.ledger.get(1, 2).await.expect("should get");
        assert_eq!(account.voice_seconds, 2700);
    }

    #[tokio::test]
    async fn mute_toggle_does_not_touch_the_session() {
        let f = fixture().await;
        let join = ts("2026-08-06T12:00:00Z");

        f.engine
            .on_voice_state(1, 2, None, Some(30), join)
            .await
            .expect("join");
        // Same channel before and after: a mute/deafen update
        f.engine
            .on_voice_state(1, 2, Some(30), Some(30), join + Duration::minutes(5))
            .await
            .expect("mute toggle");

        let open = f
            .voice
            .open_session_for(1, 2)
            .await
            .expect("should query")
            .expect("still open");
        assert_eq!(open.joined_at, join);
    }

    #[tokio::test]
    async fn leave_without_session_is_silent() {
        let f = fixture().await;

        let outcome = f
            .engine
            .on_voice_state(1, 2, Some(30), None, ts("2026-08-06T12:00:00Z"))
            .await
            .expect("should tolerate");

        assert!(outcome.level_up.is_none());
        let account = f.ledger.get(1, 2).await.expect("should get");
        assert_eq!(account.voice_seconds, 0);
    }

    #[tokio::test]
    async fn orphan_sweep_credits_the_account() {
        let f = fixture().await;
        let now = Utc::now();

        f.engine
            .on_voice_state(1, 2, None, Some(30), now - Duration::hours(2))
            .await
            .expect("join");

        let swept = f
            .engine
            .sweep_orphan_sessions(now)
            .await
            .expect("should sweep");
        assert_eq!(swept, 1);

        let account = f.ledger.get(1, 2).await.expect("should get");
        assert_eq!(account.voice_seconds, 7200);

        // The swept session is closed; a later sweep finds nothing
        assert_eq!(
            f.engine
                .sweep_orphan_sessions(now + Duration::minutes(5))
                .await
                .expect("should sweep"),
            0
        );
    }

    #[tokio::test]
    async fn startup_catch_up_credits_with_cap() {
        let f = fixture().await;
        let now = Utc::now();

        f.engine
            .on_voice_state(1, 2, None, Some(30), now - Duration::hours(7))
            .await
            .expect("join before restart");

        let reconciled = f
            .engine
            .catch_up_voice_sessions(now)
            .await
            .expect("should catch up");
        assert_eq!(reconciled, 1);

        let account = f.ledger.get(1, 2).await.expect("should get");
        assert_eq!(account.voice_seconds, 18_000);
    }

    #[tokio::test]
    async fn autoclaim_collects_rewards_on_completion() {
        let f = fixture().await;
        let now = ts("2026-08-06T12:00:00Z");

        let quest = f
            .catalog
            .create_custom(
                2,
                "Say Anything",
                "🗣️",
                HashMap::from([("daily_messages".to_string(), 1i64)]),
                200,
            )
            .await
            .expect("should create quest");

        let mut account = crate::account::Account::new(1, 2);
        account.autoclaim = true;
        f.ledger.upsert(&account).await.expect("seed account");

        let outcome = f
            .engine
            .on_message(&message("hello there"), now)
            .await
            .expect("should process");

        // The first message also completes the built-in "first_words"
        // special quest; both auto-claim at the 70% rate.
        let custom_claim = outcome
            .auto_claimed
            .iter()
            .find(|(q, _)| q.id == quest.id)
            .expect("custom quest auto-claimed");
        assert_eq!(custom_claim.1, 140);

        let expected_xp: i64 = outcome
            .auto_claimed
            .iter()
            .map(|(q, _)| q.xp_reward * 70 / 100)
            .sum();
        let account = f.ledger.get(1, 2).await.expect("should get");
        assert_eq!(account.xp, expected_xp);
        assert_eq!(account.quests_completed, outcome.auto_claimed.len() as i64);
    }
}

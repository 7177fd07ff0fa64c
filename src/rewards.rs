//! Reward economy: the four claim paths for a completed quest.
//!
//! Manual claims pay full value; bulk, auto, and expiry collection each
//! take a fee. Every successful claim credits XP, bumps the lifetime
//! quest counter, and the period counter matching the quest kind.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::account::AccountLedger;
use crate::error::Result;
use crate::progress::ProgressStore;
use crate::quests::{Quest, QuestCatalog, QuestKind};
use crate::stats::{day_key, week_start_key};

/// How a completed quest's reward is realized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimPath {
    /// Explicit claim command; full value.
    Manual,
    /// "Claim all" command; one action, small fee.
    Bulk,
    /// Automatic on completion when the account opts in.
    Auto,
    /// Collected after the unclaimed reward expired.
    Expired,
}

impl ClaimPath {
    /// Percentage of the declared reward this path credits.
    pub fn percent(&self) -> i64 {
        match self {
            Self::Manual => 100,
            Self::Bulk => 85,
            Self::Auto => 70,
            Self::Expired => 10,
        }
    }

    /// XP credited for a reward through this path: floor(reward × fraction).
    pub fn credit(&self, xp_reward: i64) -> i64 {
        xp_reward * self.percent() / 100
    }
}

/// Result of a claim attempt. The rejections are distinct so the command
/// surface can report them separately; none of them mutate state.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// Reward credited.
    Claimed { quest: Quest, credited: i64 },
    /// No such quest in this guild's catalog.
    UnknownQuest,
    /// The quest exists but has not been completed yet.
    NotReady,
    /// The quest was already claimed.
    AlreadyClaimed,
}

/// Credits completed quests to the account ledger.
pub struct RewardEconomy {
    ledger: Arc<AccountLedger>,
    progress: Arc<ProgressStore>,
    catalog: Arc<QuestCatalog>,
}

impl RewardEconomy {
    /// Create a new reward economy.
    pub fn new(
        ledger: Arc<AccountLedger>,
        progress: Arc<ProgressStore>,
        catalog: Arc<QuestCatalog>,
    ) -> Self {
        Self {
            ledger,
            progress,
            catalog,
        }
    }

    /// Manual claim of a single quest at full value.
    pub async fn claim(
        &self,
        user_id: u64,
        guild_id: u64,
        quest_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        let Some(quest) = self.catalog.find(guild_id, quest_id).await? else {
            return Ok(ClaimOutcome::UnknownQuest);
        };

        match self.progress.get(user_id, guild_id, quest_id).await? {
            None => return Ok(ClaimOutcome::NotReady),
            Some(p) if !p.completed => return Ok(ClaimOutcome::NotReady),
            Some(p) if p.claimed => return Ok(ClaimOutcome::AlreadyClaimed),
            Some(_) => {}
        }

        // The guarded update loses gracefully if another path claimed in
        // the meantime.
        if !self.progress.mark_claimed(user_id, guild_id, quest_id).await? {
            return Ok(ClaimOutcome::AlreadyClaimed);
        }

        let credited = self.settle(user_id, guild_id, &quest, ClaimPath::Manual, now).await?;
        Ok(ClaimOutcome::Claimed { quest, credited })
    }

    /// Bulk claim: every unclaimed completed quest in one action.
    ///
    /// Returns the claimed quests with their credited XP.
    pub async fn claim_all(
        &self,
        user_id: u64,
        guild_id: u64,
        now: DateTime<Utc>,
    ) -> Result<Vec<(Quest, i64)>> {
        let unclaimed = self.progress.unclaimed_completed(user_id, guild_id).await?;

        let mut claimed = Vec::new();
        for row in unclaimed {
            let Some(quest) = self.catalog.find(guild_id, &row.quest_id).await? else {
                tracing::warn!(
                    quest_id = %row.quest_id,
                    "unclaimed progress references a quest missing from the catalog"
                );
                continue;
            };
            if !self
                .progress
                .mark_claimed(user_id, guild_id, &row.quest_id)
                .await?
            {
                continue;
            }
            let credited = self.settle(user_id, guild_id, &quest, ClaimPath::Bulk, now).await?;
            claimed.push((quest, credited));
        }

        Ok(claimed)
    }

    /// Automatic claim of a just-completed quest for opted-in accounts.
    ///
    /// Returns the credited XP, or None when the quest was already claimed.
    pub async fn auto_claim(
        &self,
        user_id: u64,
        guild_id: u64,
        quest: &Quest,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        if !self.progress.mark_claimed(user_id, guild_id, &quest.id).await? {
            return Ok(None);
        }
        let credited = self.settle(user_id, guild_id, quest, ClaimPath::Auto, now).await?;
        Ok(Some(credited))
    }

    /// Collect every expired unclaimed quest at the penalty rate.
    ///
    /// Intentionally silent toward the member; only logged.
    pub async fn collect_expired(
        &self,
        user_id: u64,
        guild_id: u64,
        catalog: &[Quest],
        now: DateTime<Utc>,
    ) -> Result<Vec<(Quest, i64)>> {
        let expired = self
            .progress
            .expired_candidates(user_id, guild_id, catalog, now)
            .await?;

        let mut collected = Vec::new();
        for quest in expired {
            if !self.progress.mark_claimed(user_id, guild_id, &quest.id).await? {
                continue;
            }
            let credited = self
                .settle(user_id, guild_id, &quest, ClaimPath::Expired, now)
                .await?;
            tracing::info!(
                user_id = user_id,
                guild_id = guild_id,
                quest_id = %quest.id,
                credited = credited,
                "expired quest auto-collected"
            );
            collected.push((quest, credited));
        }

        Ok(collected)
    }

    /// Toggle automatic claiming for an account.
    pub async fn set_autoclaim(&self, user_id: u64, guild_id: u64, enabled: bool) -> Result<()> {
        let mut account = self.ledger.get(user_id, guild_id).await?;
        account.autoclaim = enabled;
        self.ledger.upsert(&account).await
    }

    /// Apply a successful claim to the account ledger.
    async fn settle(
        &self,
        user_id: u64,
        guild_id: u64,
        quest: &Quest,
        path: ClaimPath,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let credited = path.credit(quest.xp_reward);

        let mut account = self.ledger.get(user_id, guild_id).await?;
        account.normalize_periods(&day_key(now), &week_start_key(now));
        account.xp += credited;
        account.quests_completed += 1;
        match quest.kind {
            QuestKind::Daily => account.daily_quests_done += 1,
            QuestKind::Weekly => account.weekly_quests_done += 1,
            QuestKind::Achievement | QuestKind::Special | QuestKind::Custom => {}
        }
        self.ledger.upsert(&account).await?;

        Ok(credited)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{DateTime, Duration, Utc};

    use super::*;
    use crate::account::AccountLedger;
    use crate::database::Database;
    use crate::progress::ProgressStore;
    use crate::quests::{builtin_catalog, QuestCatalog};

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .expect("valid timestamp")
            .with_timezone(&Utc)
    }

    struct Fixture {
        ledger: Arc<AccountLedger>,
        progress: Arc<ProgressStore>,
        economy: RewardEconomy,
    }

    async fn fixture() -> Fixture {
        let db = Arc::new(Database::in_memory().await.expect("should create db"));
        let ledger = Arc::new(AccountLedger::new(db.clone()));
        let progress = Arc::new(ProgressStore::new(db.clone()));
        let catalog = Arc::new(QuestCatalog::new(db));
        let economy = RewardEconomy::new(ledger.clone(), progress.clone(), catalog);
        Fixture {
            ledger,
            progress,
            economy,
        }
    }

    #[test]
    fn claim_fractions() {
        assert_eq!(ClaimPath::Manual.credit(1000), 1000);
        assert_eq!(ClaimPath::Bulk.credit(1000), 850);
        assert_eq!(ClaimPath::Auto.credit(1000), 700);
        assert_eq!(ClaimPath::Expired.credit(1000), 100);
    }

    #[test]
    fn claim_fractions_floor_at_odd_rewards() {
        assert_eq!(ClaimPath::Bulk.credit(999), 849);
        assert_eq!(ClaimPath::Auto.credit(999), 699);
        assert_eq!(ClaimPath::Expired.credit(999), 99);
        assert_eq!(ClaimPath::Expired.credit(9), 0);
    }

    #[tokio::test]
    async fn manual_claim_credits_full_reward() {
        let f = fixture().await;
        let now = ts("2026-08-06T12:00:00Z");

        f.progress
            .mark_completed(1, 2, "daily_chatter", now)
            .await
            .expect("should complete");

        let outcome = f
            .economy
            .claim(1, 2, "daily_chatter", now)
            .await
            .expect("should claim");

        let reward = builtin_catalog()
            .into_iter()
            .find(|q| q.id == "daily_chatter")
            .expect("builtin exists")
            .xp_reward;
        match outcome {
            ClaimOutcome::Claimed { credited, .. } => assert_eq!(credited, reward),
            other => panic!("expected Claimed, got {:?}", other),
        }

        let account = f.ledger.get(1, 2).await.expect("should get");
        assert_eq!(account.xp, reward);
        assert_eq!(account.quests_completed, 1);
        assert_eq!(account.daily_quests_done, 1);
        assert_eq!(account.weekly_quests_done, 0);
    }

    #[tokio::test]
    async fn claim_rejections_are_distinct_and_pure() {
        let f = fixture().await;
        let now = ts("2026-08-06T12:00:00Z");

        assert_eq!(
            f.economy
                .claim(1, 2, "no_such_quest", now)
                .await
                .expect("should answer"),
            ClaimOutcome::UnknownQuest
        );

        // Known quest, never completed
        assert_eq!(
            f.economy
                .claim(1, 2, "daily_chatter", now)
                .await
                .expect("should answer"),
            ClaimOutcome::NotReady
        );

        // Completed, claimed, claimed again
        f.progress
            .mark_completed(1, 2, "daily_chatter", now)
            .await
            .expect("should complete");
        f.economy
            .claim(1, 2, "daily_chatter", now)
            .await
            .expect("first claim");
        assert_eq!(
            f.economy
                .claim(1, 2, "daily_chatter", now)
                .await
                .expect("should answer"),
            ClaimOutcome::AlreadyClaimed
        );

        // The rejection did not double-credit
        let account = f.ledger.get(1, 2).await.expect("should get");
        assert_eq!(account.quests_completed, 1);
    }

    #[tokio::test]
    async fn bulk_claim_takes_the_fee_on_everything() {
        let f = fixture().await;
        let now = ts("2026-08-06T12:00:00Z");

        f.progress
            .mark_completed(1, 2, "daily_chatter", now)
            .await
            .expect("complete one");
        f.progress
            .mark_completed(1, 2, "weekly_regular", now)
            .await
            .expect("complete two");

        let claimed = f
            .economy
            .claim_all(1, 2, now)
            .await
            .expect("should claim all");
        assert_eq!(claimed.len(), 2);

        let expected: i64 = claimed.iter().map(|(q, _)| q.xp_reward * 85 / 100).sum();
        let account = f.ledger.get(1, 2).await.expect("should get");
        assert_eq!(account.xp, expected);
        assert_eq!(account.quests_completed, 2);
        assert_eq!(account.daily_quests_done, 1);
        assert_eq!(account.weekly_quests_done, 1);

        // Nothing left to bulk claim
        assert!(f
            .economy
            .claim_all(1, 2, now + Duration::minutes(1))
            .await
            .expect("should claim all")
            .is_empty());
    }

    #[tokio::test]
    async fn auto_claim_takes_the_automation_fee() {
        let f = fixture().await;
        let now = ts("2026-08-06T12:00:00Z");
        let quest = builtin_catalog()
            .into_iter()
            .find(|q| q.id == "daily_voice")
            .expect("builtin exists");

        f.progress
            .mark_completed(1, 2, &quest.id, now)
            .await
            .expect("should complete");

        let credited = f
            .economy
            .auto_claim(1, 2, &quest, now)
            .await
            .expect("should auto claim")
            .expect("was unclaimed");
        assert_eq!(credited, quest.xp_reward * 70 / 100);

        // Second auto-claim finds nothing to do
        assert!(f
            .economy
            .auto_claim(1, 2, &quest, now)
            .await
            .expect("should answer")
            .is_none());
    }

    #[tokio::test]
    async fn expired_collection_pays_the_floor_rate() {
        let f = fixture().await;
        let catalog = builtin_catalog();
        let completed_at = ts("2026-08-04T12:00:00Z");
        let two_days_later = completed_at + Duration::days(2);

        f.progress
            .mark_completed(1, 2, "daily_chatter", completed_at)
            .await
            .expect("should complete");

        let collected = f
            .economy
            .collect_expired(1, 2, &catalog, two_days_later)
            .await
            .expect("should collect");
        assert_eq!(collected.len(), 1);

        let (quest, credited) = &collected[0];
        assert_eq!(*credited, quest.xp_reward * 10 / 100);

        // Collected means claimed; the manual path now rejects it
        assert_eq!(
            f.economy
                .claim(1, 2, "daily_chatter", two_days_later)
                .await
                .expect("should answer"),
            ClaimOutcome::AlreadyClaimed
        );
    }

    #[tokio::test]
    async fn set_autoclaim_persists_the_flag() {
        let f = fixture().await;

        f.economy
            .set_autoclaim(1, 2, true)
            .await
            .expect("should enable");
        assert!(f.ledger.get(1, 2).await.expect("should get").autoclaim);

        f.economy
            .set_autoclaim(1, 2, false)
            .await
            .expect("should disable");
        assert!(!f.ledger.get(1, 2).await.expect("should get").autoclaim);
    }

    #[tokio::test]
    async fn period_counters_roll_with_the_calendar() {
        let f = fixture().await;

        let thursday = ts("2026-08-06T12:00:00Z");
        f.progress
            .mark_completed(1, 2, "daily_chatter", thursday)
            .await
            .expect("complete thursday");
        f.economy
            .claim(1, 2, "daily_chatter", thursday)
            .await
            .expect("claim thursday");

        // The next day's claim starts a fresh daily counter
        let friday = ts("2026-08-07T12:00:00Z");
        f.progress
            .mark_completed(1, 2, "daily_wordsmith", friday)
            .await
            .expect("complete friday");
        f.economy
            .claim(1, 2, "daily_wordsmith", friday)
            .await
            .expect("claim friday");

        let account = f.ledger.get(1, 2).await.expect("should get");
        assert_eq!(account.daily_quests_done, 1);
        assert_eq!(account.daily_period, "2026-08-07");
        // Same ISO week: weekly counter keeps accumulating
        assert_eq!(account.weekly_quests_done, 0);
        assert_eq!(account.quests_completed, 2);
    }
}

#[cfg(test)]
mod property_tests {
    use proptest::prelude::*;

    use super::ClaimPath;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Credited XP is bounded by the declared reward and ordered by
        /// path generosity.
        #[test]
        fn prop_credit_bounds_and_ordering(reward in 0i64..10_000_000) {
            let manual = ClaimPath::Manual.credit(reward);
            let bulk = ClaimPath::Bulk.credit(reward);
            let auto = ClaimPath::Auto.credit(reward);
            let expired = ClaimPath::Expired.credit(reward);

            prop_assert_eq!(manual, reward);
            prop_assert!(bulk <= manual);
            prop_assert!(auto <= bulk);
            prop_assert!(expired <= auto);
            prop_assert!(expired >= 0);

            // floor(reward × percent / 100) exactly
            prop_assert_eq!(bulk, reward * 85 / 100);
            prop_assert_eq!(auto, reward * 70 / 100);
            prop_assert_eq!(expired, reward / 10);
        }
    }
}

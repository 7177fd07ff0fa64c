//! Daily and weekly stat accumulators.
//!
//! Raw counters bucketed per calendar day and per ISO week (Monday start),
//! consumed only as quest-requirement inputs. The write path is additive
//! upsert; rows are never read-modified-written outside the upsert.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Utc};
use sqlx::Row;

use crate::database::{with_write_retry, Database};
use crate::error::{QuestlineError, Result};

/// Calendar-date period key, e.g. "2026-08-06".
pub fn day_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

/// ISO-week period key: the date of the week's Monday.
pub fn week_start_key(now: DateTime<Utc>) -> String {
    let days_from_monday = now.weekday().num_days_from_monday() as i64;
    let monday = now.date_naive() - Duration::days(days_from_monday);
    monday.format("%Y-%m-%d").to_string()
}

/// Per-day accumulator snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DailyStat {
    pub messages: i64,
    pub words: i64,
    pub voice_minutes: i64,
    pub channels_used: i64,
    pub replies: i64,
}

/// Per-week accumulator snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WeeklyStat {
    pub messages: i64,
    pub words: i64,
    pub voice_minutes: i64,
    pub channels_used: i64,
    pub active_days: i64,
}

/// Accumulates raw activity counters into period buckets.
pub struct StatsRecorder {
    db: Arc<Database>,
}

impl StatsRecorder {
    /// Create a new stats recorder.
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Record one message's worth of activity.
    pub async fn record_message(
        &self,
        user_id: u64,
        guild_id: u64,
        channel_id: u64,
        words: i64,
        is_reply: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let day = day_key(now);
        let week = week_start_key(now);

        let first_of_day = !self.daily_row_exists(user_id, guild_id, &day).await?;
        let new_channel = self
            .record_channel(user_id, guild_id, channel_id, &day)
            .await?;

        self.upsert_daily(
            user_id,
            guild_id,
            &day,
            DailyStat {
                messages: 1,
                words,
                voice_minutes: 0,
                channels_used: new_channel as i64,
                replies: is_reply as i64,
            },
        )
        .await?;

        self.upsert_weekly(
            user_id,
            guild_id,
            &week,
            WeeklyStat {
                messages: 1,
                words,
                voice_minutes: 0,
                channels_used: new_channel as i64,
                active_days: first_of_day as i64,
            },
        )
        .await
    }

    /// Record credited voice time.
    pub async fn record_voice(
        &self,
        user_id: u64,
        guild_id: u64,
        credited_seconds: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let day = day_key(now);
        let week = week_start_key(now);
        let minutes = credited_seconds / 60;

        let first_of_day = !self.daily_row_exists(user_id, guild_id, &day).await?;

        self.upsert_daily(
            user_id,
            guild_id,
            &day,
            DailyStat {
                voice_minutes: minutes,
                ..Default::default()
            },
        )
        .await?;

        self.upsert_weekly(
            user_id,
            guild_id,
            &week,
            WeeklyStat {
                voice_minutes: minutes,
                active_days: first_of_day as i64,
                ..Default::default()
            },
        )
        .await
    }

    /// Get the daily accumulator for a period key; zero when absent.
    pub async fn daily(&self, user_id: u64, guild_id: u64, day: &str) -> Result<DailyStat> {
        let row = sqlx::query(
            "SELECT messages, words, voice_minutes, channels_used, replies
             FROM daily_stats WHERE user_id = ? AND guild_id = ? AND day = ?",
        )
        .bind(user_id as i64)
        .bind(guild_id as i64)
        .bind(day)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| QuestlineError::Database(format!("Failed to get daily stats: {}", e)))?;

        Ok(row
            .map(|row| DailyStat {
                messages: row.get("messages"),
                words: row.get("words"),
                voice_minutes: row.get("voice_minutes"),
                channels_used: row.get("channels_used"),
                replies: row.get("replies"),
            })
            .unwrap_or_default())
    }

    /// Get the weekly accumulator for a period key; zero when absent.
    pub async fn weekly(&self, user_id: u64, guild_id: u64, week: &str) -> Result<WeeklyStat> {
        let row = sqlx::query(
            "SELECT messages, words, voice_minutes, channels_used, active_days
             FROM weekly_stats WHERE user_id = ? AND guild_id = ? AND week_start = ?",
        )
        .bind(user_id as i64)
        .bind(guild_id as i64)
        .bind(week)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| QuestlineError::Database(format!("Failed to get weekly stats: {}", e)))?;

        Ok(row
            .map(|row| WeeklyStat {
                messages: row.get("messages"),
                words: row.get("words"),
                voice_minutes: row.get("voice_minutes"),
                channels_used: row.get("channels_used"),
                active_days: row.get("active_days"),
            })
            .unwrap_or_default())
    }

    async fn daily_row_exists(&self, user_id: u64, guild_id: u64, day: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM daily_stats WHERE user_id = ? AND guild_id = ? AND day = ?",
        )
        .bind(user_id as i64)
        .bind(guild_id as i64)
        .bind(day)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| QuestlineError::Database(format!("Failed to probe daily stats: {}", e)))?;

        Ok(row.is_some())
    }

    /// Record the channel for the day. Returns true when this is the first
    /// activity in that channel today.
    async fn record_channel(
        &self,
        user_id: u64,
        guild_id: u64,
        channel_id: u64,
        day: &str,
    ) -> Result<bool> {
        let pool = self.db.pool().clone();
        let day = day.to_string();

        let rows_affected = with_write_retry("record_daily_channel", move || {
            let pool = pool.clone();
            let day = day.clone();
            async move {
                sqlx::query(
                    "INSERT OR IGNORE INTO daily_channels (user_id, guild_id, day, channel_id)
                     VALUES (?, ?, ?, ?)",
                )
                .bind(user_id as i64)
                .bind(guild_id as i64)
                .bind(&day)
                .bind(channel_id as i64)
                .execute(&pool)
                .await
                .map(|r| r.rows_affected())
            }
        })
        .await?;

        Ok(rows_affected == 1)
    }

    async fn upsert_daily(
        &self,
        user_id: u64,
        guild_id: u64,
        day: &str,
        delta: DailyStat,
    ) -> Result<()> {
        let pool = self.db.pool().clone();
        let day = day.to_string();

        with_write_retry("upsert_daily_stats", move || {
            let pool = pool.clone();
            let day = day.clone();
            let d = delta.clone();
            async move {
                sqlx::query(
                    "INSERT INTO daily_stats (user_id, guild_id, day, messages, words,
                                              voice_minutes, channels_used, replies)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT(user_id, guild_id, day) DO UPDATE SET
                        messages = messages + excluded.messages,
                        words = words + excluded.words,
                        voice_minutes = voice_minutes + excluded.voice_minutes,
                        channels_used = channels_used + excluded.channels_used,
                        replies = replies + excluded.replies",
                )
                .bind(user_id as i64)
                .bind(guild_id as i64)
                .bind(&day)
                .bind(d.messages)
                .bind(d.words)
                .bind(d.voice_minutes)
                .bind(d.channels_used)
                .bind(d.replies)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }

    async fn upsert_weekly(
        &self,
        user_id: u64,
        guild_id: u64,
        week: &str,
        delta: WeeklyStat,
    ) -> Result<()> {
        let pool = self.db.pool().clone();
        let week = week.to_string();

        with_write_retry("upsert_weekly_stats", move || {
            let pool = pool.clone();
            let week = week.clone();
            let d = delta.clone();
            async move {
                sqlx::query(
                    "INSERT INTO weekly_stats (user_id, guild_id, week_start, messages, words,
                                               voice_minutes, channels_used, active_days)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT(user_id, guild_id, week_start) DO UPDATE SET
                        messages = messages + excluded.messages,
                        words = words + excluded.words,
                        voice_minutes = voice_minutes + excluded.voice_minutes,
                        channels_used = channels_used + excluded.channels_used,
                        active_days = active_days + excluded.active_days",
                )
                .bind(user_id as i64)
                .bind(guild_id as i64)
                .bind(&week)
                .bind(d.messages)
                .bind(d.words)
                .bind(d.voice_minutes)
                .bind(d.channels_used)
                .bind(d.active_days)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{DateTime, Duration, Utc};

    use super::*;
    use crate::database::Database;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .expect("valid timestamp")
            .with_timezone(&Utc)
    }

    async fn recorder() -> StatsRecorder {
        let db = Arc::new(Database::in_memory().await.expect("should create db"));
        StatsRecorder::new(db)
    }

    #[test]
    fn day_key_is_calendar_date() {
        assert_eq!(day_key(ts("2026-08-06T15:30:00Z")), "2026-08-06");
    }

    #[test]
    fn week_key_is_monday_of_iso_week() {
        // Thursday 2026-08-06 belongs to the week starting Monday 2026-08-03
        assert_eq!(week_start_key(ts("2026-08-06T15:30:00Z")), "2026-08-03");
        // A Monday is its own week start
        assert_eq!(week_start_key(ts("2026-08-03T00:00:01Z")), "2026-08-03");
        // Sunday still belongs to the preceding Monday
        assert_eq!(week_start_key(ts("2026-08-09T23:59:59Z")), "2026-08-03");
    }

    #[tokio::test]
    async fn messages_accumulate_additively() {
        let recorder = recorder().await;
        let now = ts("2026-08-06T12:00:00Z");

        recorder
            .record_message(1, 2, 10, 5, false, now)
            .await
            .expect("first message");
        recorder
            .record_message(1, 2, 10, 7, true, now + Duration::minutes(1))
            .await
            .expect("second message");

        let daily = recorder.daily(1, 2, "2026-08-06").await.expect("daily");
        assert_eq!(daily.messages, 2);
        assert_eq!(daily.words, 12);
        assert_eq!(daily.replies, 1);

        let weekly = recorder.weekly(1, 2, "2026-08-03").await.expect("weekly");
        assert_eq!(weekly.messages, 2);
        assert_eq!(weekly.words, 12);
    }

    #[tokio::test]
    async fn channels_used_counts_distinct_channels() {
        let recorder = recorder().await;
        let now = ts("2026-08-06T12:00:00Z");

        recorder
            .record_message(1, 2, 10, 1, false, now)
            .await
            .expect("msg in channel 10");
        recorder
            .record_message(1, 2, 10, 1, false, now)
            .await
            .expect("msg in channel 10 again");
        recorder
            .record_message(1, 2, 11, 1, false, now)
            .await
            .expect("msg in channel 11");

        let daily = recorder.daily(1, 2, "2026-08-06").await.expect("daily");
        assert_eq!(daily.channels_used, 2);
    }

    #[tokio::test]
    async fn active_days_bump_once_per_day() {
        let recorder = recorder().await;

        // Two messages on Thursday, one on Friday, same ISO week
        let thursday = ts("2026-08-06T12:00:00Z");
        let friday = ts("2026-08-07T09:00:00Z");

        recorder
            .record_message(1, 2, 10, 1, false, thursday)
            .await
            .expect("thursday msg 1");
        recorder
            .record_message(1, 2, 10, 1, false, thursday + Duration::hours(1))
            .await
            .expect("thursday msg 2");
        recorder
            .record_message(1, 2, 10, 1, false, friday)
            .await
            .expect("friday msg");

        let weekly = recorder.weekly(1, 2, "2026-08-03").await.expect("weekly");
        assert_eq!(weekly.active_days, 2);
    }

    #[tokio::test]
    async fn voice_minutes_accumulate_and_mark_day_active() {
        let recorder = recorder().await;
        let now = ts("2026-08-06T12:00:00Z");

        recorder
            .record_voice(1, 2, 1800, now)
            .await
            .expect("voice 30min");
        recorder
            .record_voice(1, 2, 600, now + Duration::hours(1))
            .await
            .expect("voice 10min");

        let daily = recorder.daily(1, 2, "2026-08-06").await.expect("daily");
        assert_eq!(daily.voice_minutes, 40);
        assert_eq!(daily.messages, 0);

        let weekly = recorder.weekly(1, 2, "2026-08-03").await.expect("weekly");
        assert_eq!(weekly.voice_minutes, 40);
        assert_eq!(weekly.active_days, 1);
    }

    #[tokio::test]
    async fn absent_periods_read_as_zero() {
        let recorder = recorder().await;

        let daily = recorder.daily(7, 7, "2026-01-01").await.expect("daily");
        assert_eq!(daily, DailyStat::default());

        let weekly = recorder.weekly(7, 7, "2025-12-29").await.expect("weekly");
        assert_eq!(weekly, WeeklyStat::default());
    }

    #[tokio::test]
    async fn periods_are_isolated_per_day_and_member() {
        let recorder = recorder().await;

        recorder
            .record_message(1, 2, 10, 3, false, ts("2026-08-06T12:00:00Z"))
            .await
            .expect("day one");
        recorder
            .record_message(1, 2, 10, 4, false, ts("2026-08-07T12:00:00Z"))
            .await
            .expect("day two");

        assert_eq!(
            recorder.daily(1, 2, "2026-08-06").await.expect("daily").words,
            3
        );
        assert_eq!(
            recorder.daily(1, 2, "2026-08-07").await.expect("daily").words,
            4
        );
        assert_eq!(
            recorder.daily(3, 2, "2026-08-06").await.expect("daily").words,
            0
        );
    }
}

#[cfg(test)]
mod property_tests {
    use chrono::{DateTime, Duration, NaiveDate, Utc, Weekday};
    use proptest::prelude::*;

    use super::week_start_key;
    use chrono::Datelike;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Every date in a calendar week maps to the same Monday key, and
        /// that key is always a Monday on or before the date.
        #[test]
        fn prop_week_key_is_monday_on_or_before(days_since_epoch in 0i64..40_000) {
            let date = NaiveDate::from_ymd_opt(1970, 1, 1)
                .expect("epoch")
                .checked_add_days(chrono::Days::new(days_since_epoch as u64))
                .expect("in range");
            let dt = DateTime::<Utc>::from_naive_utc_and_offset(
                date.and_hms_opt(12, 0, 0).expect("midday"),
                Utc,
            );

            let key = week_start_key(dt);
            let monday = NaiveDate::parse_from_str(&key, "%Y-%m-%d").expect("valid key");

            prop_assert_eq!(monday.weekday(), Weekday::Mon);
            prop_assert!(monday <= date);
            prop_assert!(date - monday < Duration::days(7));
        }
    }
}

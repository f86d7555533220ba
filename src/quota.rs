//! # Quota Tracking Module
//!
//! ## Purpose
//! Tracks upstream calls made in the current UTC calendar day against the
//! configured daily limit. The counter survives restarts via a persisted
//! snapshot and resets exactly once at each UTC day boundary.
//!
//! ## Input/Output Specification
//! - **Input**: call consumption events, the current UTC date
//! - **Output**: consistent `{date, count_used}` snapshots, reset times
//!
//! ## Key Features
//! - All mutation originates from the single worker loop; readers observe
//!   consistent snapshots
//! - Day-boundary rollover happens on first access after the date advances,
//!   before any other operation proceeds

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Persisted quota snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaState {
    /// UTC calendar date the counter applies to
    pub date: NaiveDate,
    /// Upstream calls consumed on that date
    pub count_used: u32,
}

/// Daily upstream-call quota tracker
#[derive(Debug)]
pub struct QuotaTracker {
    state: QuotaState,
    daily_limit: u32,
}

impl QuotaTracker {
    /// Create a tracker from an optional persisted snapshot.
    ///
    /// A snapshot from an earlier date is rolled over immediately.
    pub fn new(daily_limit: u32, persisted: Option<QuotaState>, today: NaiveDate) -> Self {
        let state = persisted.unwrap_or(QuotaState {
            date: today,
            count_used: 0,
        });
        let mut tracker = Self { state, daily_limit };
        tracker.roll_over(today);
        tracker
    }

    /// Reset the counter when the UTC date has advanced past the stored one.
    fn roll_over(&mut self, today: NaiveDate) {
        if today > self.state.date {
            tracing::info!(
                "Quota reset: {} calls used on {}, new day {}",
                self.state.count_used,
                self.state.date,
                today
            );
            self.state = QuotaState {
                date: today,
                count_used: 0,
            };
        }
    }

    /// Whether another upstream call is permitted today.
    pub fn can_consume(&mut self, today: NaiveDate) -> bool {
        self.roll_over(today);
        self.state.count_used < self.daily_limit
    }

    /// Consume one upstream call. Returns `false` (without incrementing)
    /// when the day's budget is already spent.
    pub fn consume(&mut self, today: NaiveDate) -> bool {
        self.roll_over(today);
        if self.state.count_used >= self.daily_limit {
            return false;
        }
        self.state.count_used += 1;
        true
    }

    /// Consistent snapshot for persistence and stats.
    pub fn snapshot(&mut self, today: NaiveDate) -> QuotaState {
        self.roll_over(today);
        self.state
    }

    /// Configured daily limit.
    pub fn daily_limit(&self) -> u32 {
        self.daily_limit
    }

    /// Instant of the next UTC-midnight reset after `today`.
    pub fn next_reset(&self, today: NaiveDate) -> DateTime<Utc> {
        let next_day = today
            .checked_add_days(Days::new(1))
            .unwrap_or(today)
            .and_hms_opt(0, 0, 0)
            .expect("midnight is always a valid time");
        next_day.and_utc()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, d).unwrap()
    }

    #[test]
    fn test_count_never_exceeds_limit() {
        let mut quota = QuotaTracker::new(3, None, day(1));
        for _ in 0..3 {
            assert!(quota.can_consume(day(1)));
            assert!(quota.consume(day(1)));
        }
        assert!(!quota.can_consume(day(1)));
        assert!(!quota.consume(day(1)));
        assert_eq!(quota.snapshot(day(1)).count_used, 3);
    }

    #[test]
    fn test_resets_exactly_once_at_day_boundary() {
        let mut quota = QuotaTracker::new(2, None, day(1));
        assert!(quota.consume(day(1)));
        assert!(quota.consume(day(1)));
        assert!(!quota.can_consume(day(1)));

        // First access on the next day resets the counter.
        assert!(quota.can_consume(day(2)));
        let snap = quota.snapshot(day(2));
        assert_eq!(snap.date, day(2));
        assert_eq!(snap.count_used, 0);

        // Further accesses on the same day do not reset again.
        assert!(quota.consume(day(2)));
        assert_eq!(quota.snapshot(day(2)).count_used, 1);
    }

    #[test]
    fn test_stale_persisted_snapshot_rolls_over_on_load() {
        let persisted = QuotaState {
            date: day(1),
            count_used: 200,
        };
        let mut quota = QuotaTracker::new(200, Some(persisted), day(3));
        assert_eq!(quota.snapshot(day(3)).count_used, 0);
        assert!(quota.can_consume(day(3)));
    }

    #[test]
    fn test_fresh_persisted_snapshot_is_kept() {
        let persisted = QuotaState {
            date: day(5),
            count_used: 7,
        };
        let mut quota = QuotaTracker::new(200, Some(persisted), day(5));
        assert_eq!(quota.snapshot(day(5)).count_used, 7);
    }

    #[test]
    fn test_next_reset_is_following_midnight() {
        let quota = QuotaTracker::new(200, None, day(1));
        let reset = quota.next_reset(day(1));
        assert_eq!(reset.date_naive(), day(2));
        assert_eq!(reset.time(), chrono::NaiveTime::from_hms_opt(0, 0, 0).unwrap());
    }
}

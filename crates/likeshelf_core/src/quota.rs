//! crates/likeshelf_core/src/quota.rs
//!
//! Per-user usage accounting. The counter arithmetic lives here as plain data so
//! every store applies exactly the same rules inside its own transaction; the
//! `QuotaManager` is the entry point the engines call.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::ports::{DatabaseService, PortResult};

/// The two independently metered kinds of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaType {
    Sync,
    Categorize,
}

impl QuotaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaType::Sync => "sync",
            QuotaType::Categorize => "categorize",
        }
    }
}

impl fmt::Display for QuotaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Store-independent quota settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaPolicy {
    /// Day of month (1..=28) on which counters reset, at 00:00 UTC.
    pub reset_day: u32,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self { reset_day: 1 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaCounter {
    pub used: u64,
    pub limit: u64,
}

impl QuotaCounter {
    pub fn new(used: u64, limit: u64) -> Self {
        Self { used, limit }
    }

    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }
}

/// Both counters of one user plus their shared reset time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaState {
    pub sync: QuotaCounter,
    pub categorize: QuotaCounter,
    pub reset_at: Option<DateTime<Utc>>,
}

/// A read-only view of one counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaUsage {
    pub quota: QuotaType,
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaReport {
    pub sync: QuotaUsage,
    pub categorize: QuotaUsage,
}

/// A reservation that would push `used` past `limit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaExceeded {
    pub quota: QuotaType,
    pub used: u64,
    pub limit: u64,
    pub requested: u64,
    pub reset_at: Option<DateTime<Utc>>,
}

impl QuotaExceeded {
    pub fn time_until_reset(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.reset_at.map(|at| (at - now).max(Duration::zero()))
    }
}

impl fmt::Display for QuotaExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} quota exceeded: {} of {} used, {} requested",
            self.quota, self.used, self.limit, self.requested
        )?;
        match self.time_until_reset(Utc::now()) {
            Some(left) => write!(
                f,
                "; resets in {}d {}h",
                left.num_days(),
                left.num_hours() % 24
            ),
            None => Ok(()),
        }
    }
}

impl QuotaState {
    pub fn new(sync_limit: u64, categorize_limit: u64) -> Self {
        Self {
            sync: QuotaCounter::new(0, sync_limit),
            categorize: QuotaCounter::new(0, categorize_limit),
            reset_at: None,
        }
    }

    fn counter(&self, quota: QuotaType) -> &QuotaCounter {
        match quota {
            QuotaType::Sync => &self.sync,
            QuotaType::Categorize => &self.categorize,
        }
    }

    fn counter_mut(&mut self, quota: QuotaType) -> &mut QuotaCounter {
        match quota {
            QuotaType::Sync => &mut self.sync,
            QuotaType::Categorize => &mut self.categorize,
        }
    }

    /// Zeroes both counters and schedules the next reset when `reset_at` is unset or
    /// not in the future. Returns whether a reset happened.
    pub fn reset_if_due(&mut self, now: DateTime<Utc>, policy: &QuotaPolicy) -> bool {
        if matches!(self.reset_at, Some(at) if at > now) {
            return false;
        }
        self.sync.used = 0;
        self.categorize.used = 0;
        self.reset_at = Some(next_reset_after(now, policy.reset_day));
        true
    }

    /// Increments `quota` by `amount` if the result stays within the limit.
    /// On failure the state is left untouched.
    pub fn reserve(&mut self, quota: QuotaType, amount: u64) -> Result<QuotaUsage, QuotaExceeded> {
        let counter = *self.counter(quota);
        if counter.used.saturating_add(amount) > counter.limit {
            return Err(QuotaExceeded {
                quota,
                used: counter.used,
                limit: counter.limit,
                requested: amount,
                reset_at: self.reset_at,
            });
        }
        self.counter_mut(quota).used += amount;
        Ok(self.usage(quota))
    }

    /// Increments `quota` by `amount` without checking the limit.
    pub fn increment(&mut self, quota: QuotaType, amount: u64) -> QuotaUsage {
        let counter = self.counter_mut(quota);
        counter.used = counter.used.saturating_add(amount);
        self.usage(quota)
    }

    pub fn usage(&self, quota: QuotaType) -> QuotaUsage {
        let counter = self.counter(quota);
        QuotaUsage {
            quota,
            used: counter.used,
            limit: counter.limit,
            remaining: counter.remaining(),
            reset_at: self.reset_at,
        }
    }

    pub fn report(&self) -> QuotaReport {
        QuotaReport {
            sync: self.usage(QuotaType::Sync),
            categorize: self.usage(QuotaType::Categorize),
        }
    }
}

/// The first `reset_day` 00:00 UTC strictly after `now`.
pub fn next_reset_after(now: DateTime<Utc>, reset_day: u32) -> DateTime<Utc> {
    let day = reset_day.clamp(1, 28);
    if let Some(this_month) = month_boundary(now.year(), now.month(), day) {
        if this_month > now {
            return this_month;
        }
    }
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    month_boundary(year, month, day).unwrap_or_else(|| now + Duration::days(30))
}

fn month_boundary(year: i32, month: u32, day: u32) -> Option<DateTime<Utc>> {
    let midnight = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(0, 0, 0)?;
    Some(Utc.from_utc_datetime(&midnight))
}

//=========================================================================================
// Quota Manager
//=========================================================================================

/// Race-free usage accounting on top of the store's transactions.
#[derive(Clone)]
pub struct QuotaManager {
    db: Arc<dyn DatabaseService>,
}

impl QuotaManager {
    pub fn new(db: Arc<dyn DatabaseService>) -> Self {
        Self { db }
    }

    /// Current usage of both counters, after any due reset.
    pub async fn get_usage(&self, user_id: Uuid) -> PortResult<QuotaReport> {
        let state = self.db.quota_state(user_id, Utc::now()).await?;
        Ok(state.report())
    }

    /// Atomically checks and consumes `amount` units of `quota`.
    pub async fn reserve(&self, user_id: Uuid, quota: QuotaType, amount: u64) -> PortResult<QuotaUsage> {
        let usage = self
            .db
            .reserve_quota(user_id, quota, amount, Utc::now())
            .await
            .inspect_err(|e| info!(%user_id, %quota, amount, "Quota reservation refused: {}", e))?;
        debug!(
            %user_id,
            %quota,
            amount,
            used = usage.used,
            limit = usage.limit,
            "Quota reserved"
        );
        Ok(usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::PortError;
    use crate::test_support::InMemoryDb;
    use assert_matches::assert_matches;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn next_reset_is_later_this_month_when_day_not_reached() {
        assert_eq!(next_reset_after(at(2026, 3, 10, 12), 15), at(2026, 3, 15, 0));
    }

    #[test]
    fn next_reset_rolls_over_when_day_already_passed() {
        assert_eq!(next_reset_after(at(2026, 3, 20, 12), 15), at(2026, 4, 15, 0));
        assert_eq!(next_reset_after(at(2026, 3, 15, 0), 15), at(2026, 4, 15, 0));
        assert_eq!(next_reset_after(at(2026, 12, 2, 0), 1), at(2027, 1, 1, 0));
    }

    #[test]
    fn reset_day_is_clamped_to_a_day_every_month_has() {
        assert_eq!(next_reset_after(at(2026, 2, 1, 0), 31), at(2026, 2, 28, 0));
    }

    #[test]
    fn unset_or_past_reset_zeroes_counters() {
        let policy = QuotaPolicy::default();
        let mut state = QuotaState::new(10, 10);
        state.sync.used = 7;
        state.categorize.used = 3;
        assert!(state.reset_if_due(at(2026, 5, 6, 0), &policy));
        assert_eq!(state.sync.used, 0);
        assert_eq!(state.categorize.used, 0);
        assert_eq!(state.reset_at, Some(at(2026, 6, 1, 0)));

        state.sync.used = 4;
        assert!(!state.reset_if_due(at(2026, 5, 31, 23), &policy));
        assert_eq!(state.sync.used, 4);
        assert!(state.reset_if_due(at(2026, 6, 1, 0), &policy));
        assert_eq!(state.sync.used, 0);
    }

    #[test]
    fn reserve_refuses_overflow_without_mutating() {
        let mut state = QuotaState::new(5, 5);
        state.reserve(QuotaType::Sync, 4).unwrap();
        let refused = state.reserve(QuotaType::Sync, 2).unwrap_err();
        assert_eq!(refused.used, 4);
        assert_eq!(refused.requested, 2);
        assert_eq!(state.sync.used, 4);
        let usage = state.reserve(QuotaType::Sync, 1).unwrap();
        assert_eq!(usage.remaining, 0);
    }

    #[test]
    fn increment_records_usage_beyond_the_limit() {
        let mut state = QuotaState::new(5, 5);
        let usage = state.increment(QuotaType::Categorize, 8);
        assert_eq!(usage.used, 8);
        assert_eq!(usage.remaining, 0);
        assert_eq!(state.sync.used, 0);
    }

    #[test]
    fn time_until_reset_never_goes_negative() {
        let exceeded = QuotaExceeded {
            quota: QuotaType::Sync,
            used: 1,
            limit: 1,
            requested: 1,
            reset_at: Some(at(2026, 5, 1, 0)),
        };
        assert_eq!(exceeded.time_until_reset(at(2026, 4, 30, 0)), Some(Duration::days(1)));
        assert_eq!(exceeded.time_until_reset(at(2026, 5, 2, 0)), Some(Duration::zero()));
    }

    #[tokio::test]
    async fn get_usage_reports_both_counters_after_lazy_reset() {
        let db = Arc::new(InMemoryDb::new());
        let user = db.add_user(100, 40);
        let manager = QuotaManager::new(db.clone());

        manager.reserve(user, QuotaType::Categorize, 15).await.unwrap();
        let report = manager.get_usage(user).await.unwrap();
        assert_eq!(report.sync.used, 0);
        assert_eq!(report.categorize.used, 15);
        assert_eq!(report.categorize.remaining, 25);
        assert!(report.sync.reset_at.is_some());
    }

    #[tokio::test]
    async fn reserve_for_unknown_user_is_not_found() {
        let db = Arc::new(InMemoryDb::new());
        let manager = QuotaManager::new(db);
        let result = manager.reserve(Uuid::new_v4(), QuotaType::Sync, 1).await;
        assert_matches!(result, Err(PortError::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reservations_never_exceed_the_limit() {
        let db = Arc::new(InMemoryDb::new());
        let user = db.add_user(15, 15);
        let manager = QuotaManager::new(db.clone());

        let mut handles = Vec::new();
        for _ in 0..40 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.reserve(user, QuotaType::Sync, 1).await
            }));
        }

        let mut committed = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => committed += 1,
                Err(e) => assert_matches!(e, PortError::QuotaExceeded(_)),
            }
        }

        assert_eq!(committed, 15);
        assert_eq!(db.quota(user).sync.used, 15);
    }
}

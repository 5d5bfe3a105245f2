//! Module for rate limiting.
//!
//! [`RateCounter`] enforces the per-sender hourly and daily ceilings on ingestion.
//! [`NoticeThrottle`] keeps the notices about those denials from becoming a
//! flood of their own.

use crate::error::Error;
use crate::utils::mask_address;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::fmt;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};

fn hour() -> Duration {
    Duration::hours(1)
}

fn day() -> Duration {
    Duration::days(1)
}

/// Counters of one hashed sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateRecord {
    pub sender_hash: String,
    pub hourly_count: u32,
    pub daily_count: u32,
    pub hourly_window_start: Option<DateTime<Utc>>,
    pub daily_window_start: Option<DateTime<Utc>>,
    pub blocked_until: Option<DateTime<Utc>>,
}

impl RateRecord {
    pub fn new(sender_hash: impl Into<String>) -> Self {
        Self {
            sender_hash: sender_hash.into(),
            hourly_count: 0,
            daily_count: 0,
            hourly_window_start: None,
            daily_window_start: None,
            blocked_until: None,
        }
    }

    /// Resets every window that has fully elapsed at `now`.
    fn roll_windows(&mut self, now: DateTime<Utc>) {
        if self.hourly_window_start.is_some_and(|start| now - start >= hour()) {
            self.hourly_window_start = None;
            self.hourly_count = 0;
        }
        if self.daily_window_start.is_some_and(|start| now - start >= day()) {
            self.daily_window_start = None;
            self.daily_count = 0;
        }
        if self.blocked_until.is_some_and(|until| until <= now) {
            self.blocked_until = None;
        }
    }

    fn exceeded(&self, hourly_limit: u32, daily_limit: u32) -> Option<LimitKind> {
        if self.hourly_count >= hourly_limit {
            Some(LimitKind::Hourly)
        } else if self.daily_count >= daily_limit {
            Some(LimitKind::Daily)
        } else {
            None
        }
    }

    fn resets_at(&self, kind: LimitKind, now: DateTime<Utc>) -> DateTime<Utc> {
        match kind {
            LimitKind::Hourly => self.hourly_window_start.unwrap_or(now) + hour(),
            LimitKind::Daily => self.daily_window_start.unwrap_or(now) + day(),
        }
    }

    fn reserve(&mut self, now: DateTime<Utc>) {
        self.hourly_window_start.get_or_insert(now);
        self.daily_window_start.get_or_insert(now);
        self.hourly_count = self.hourly_count.saturating_add(1);
        self.daily_count = self.daily_count.saturating_add(1);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitKind {
    Hourly,
    Daily,
}

impl LimitKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hourly => "hourly_limit",
            Self::Daily => "daily_limit",
        }
    }
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`RateCounter::check_and_reserve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Denied {
        reason: LimitKind,
        hourly: u32,
        daily: u32,
        resets_at: DateTime<Utc>,
    },
}

/// Persistence for [`RateRecord`]s, keyed by sender hash.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn load(&self, sender_hash: &str) -> Result<Option<RateRecord>, Error>;
    async fn save(&self, record: &RateRecord) -> Result<(), Error>;
    /// Deletes records whose daily window started before `cutoff`.
    async fn purge_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, Error>;
}

/// Per-sender hourly and daily ceilings.
pub struct RateCounter {
    store: Arc<dyn CounterStore>,
    hourly_limit: u32,
    daily_limit: u32,
    // Serializes read-modify-write cycles on the store.
    guard: tokio::sync::Mutex<()>,
}

impl RateCounter {
    pub fn new(store: Arc<dyn CounterStore>, hourly_limit: u32, daily_limit: u32) -> Self {
        Self {
            store,
            hourly_limit,
            daily_limit,
            guard: tokio::sync::Mutex::new(()),
        }
    }

    /// Admits the sender and counts the message, or reports which ceiling is hit.
    ///
    /// A failing store admits the message.
    pub async fn check_and_reserve(&self, sender: &str, sender_hash: &str) -> Admission {
        self.check_and_reserve_at(sender, sender_hash, Utc::now())
            .await
    }

    pub(crate) async fn check_and_reserve_at(
        &self,
        sender: &str,
        sender_hash: &str,
        now: DateTime<Utc>,
    ) -> Admission {
        let _guard = self.guard.lock().await;

        let mut record = match self.store.load(sender_hash).await {
            Ok(record) => record.unwrap_or_else(|| RateRecord::new(sender_hash)),
            Err(e) => {
                log::warn!(
                    "Rate counter unavailable for {}, admitting: {e}",
                    mask_address(sender)
                );
                return Admission::Admitted;
            }
        };
        record.roll_windows(now);

        let admission = match record.exceeded(self.hourly_limit, self.daily_limit) {
            Some(reason) => {
                let resets_at = record.resets_at(reason, now);
                record.blocked_until = Some(resets_at);
                Admission::Denied {
                    reason,
                    hourly: record.hourly_count,
                    daily: record.daily_count,
                    resets_at,
                }
            }
            None => {
                record.reserve(now);
                Admission::Admitted
            }
        };

        if let Err(e) = self.store.save(&record).await {
            log::warn!(
                "Failed to persist rate counter for {}: {e}",
                mask_address(sender)
            );
        }
        admission
    }

    pub fn hourly_limit(&self) -> u32 {
        self.hourly_limit
    }

    pub fn daily_limit(&self) -> u32 {
        self.daily_limit
    }

    pub async fn purge_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, Error> {
        let _guard = self.guard.lock().await;
        self.store.purge_stale(cutoff).await
    }
}

/// Lets through at most one notice per (recipient, kind) per hour.
pub struct NoticeThrottle {
    limiter: Mutex<DefaultKeyedRateLimiter<(String, &'static str)>>,
}

impl Default for NoticeThrottle {
    fn default() -> Self {
        Self::new()
    }
}

impl NoticeThrottle {
    pub fn new() -> Self {
        let quota = Quota::per_hour(NonZeroU32::MIN);
        Self {
            limiter: Mutex::new(RateLimiter::keyed(quota)),
        }
    }

    pub fn allow(&self, recipient: &str, kind: &'static str) -> bool {
        let Ok(limiter) = self.limiter.lock() else {
            log::error!("notice throttle lock poisoned");
            return false;
        };
        let allowed = limiter
            .check_key(&(recipient.to_lowercase(), kind))
            .is_ok();
        if allowed {
            limiter.retain_recent();
        }
        allowed
    }
}

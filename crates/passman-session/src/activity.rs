//! Clocks and the shared activity timestamp.
//!
//! The last-activity instant lives in the device-scoped persistent tier so
//! that every context on the device reads the same value and a reload cannot
//! reset it.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use passman_vault::KeyValueStore;

use crate::error::Result;

/// Persistent-tier key holding the RFC 3339 last-activity instant.
pub const LAST_ACTIVITY_ENTRY: &str = "last_activity_at";

/// How far ahead of the local clock a stored timestamp may be before it is
/// treated as corrupt.
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let delta = chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now = *now + delta;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// ActivityClock
// ---------------------------------------------------------------------------

/// What the persistent tier currently holds for the activity timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityReading {
    Missing,
    At(DateTime<Utc>),
    Corrupt,
}

/// Reader and writer of the shared last-activity timestamp.
#[derive(Clone)]
pub struct ActivityClock {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    idle_timeout: Duration,
}

impl ActivityClock {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, idle_timeout: Duration) -> Self {
        Self {
            store,
            clock,
            idle_timeout,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Record activity at the current instant. Last write wins.
    pub async fn touch(&self) -> Result<()> {
        let now = self.clock.now().to_rfc3339();
        self.store.set(LAST_ACTIVITY_ENTRY, &now).await?;
        tracing::trace!(at = %now, "activity recorded");
        Ok(())
    }

    pub async fn read(&self) -> Result<ActivityReading> {
        let reading = match self.store.get(LAST_ACTIVITY_ENTRY).await? {
            None => ActivityReading::Missing,
            Some(raw) => match DateTime::parse_from_rfc3339(&raw) {
                Ok(at) => self.classify(at.with_timezone(&Utc)),
                Err(_) => ActivityReading::Corrupt,
            },
        };
        Ok(reading)
    }

    /// A timestamp further ahead than [`MAX_CLOCK_SKEW`] would hold the idle
    /// lock off for every context on the device, so it reads as corrupt.
    fn classify(&self, at: DateTime<Utc>) -> ActivityReading {
        let ahead = (at - self.clock.now()).to_std().unwrap_or_default();
        if ahead > MAX_CLOCK_SKEW {
            tracing::warn!(ahead_secs = ahead.as_secs(), "activity timestamp is in the future");
            return ActivityReading::Corrupt;
        }
        ActivityReading::At(at)
    }

    /// Whether the idle threshold has been reached.
    ///
    /// A missing timestamp is seeded with now and counts as fresh. An
    /// unparsable one, or one too far in the future, counts as expired. A
    /// timestamp slightly ahead (clock skew between contexts) counts as zero
    /// elapsed.
    pub async fn is_expired(&self) -> Result<bool> {
        let at = match self.read().await? {
            ActivityReading::At(at) => at,
            ActivityReading::Missing => {
                self.touch().await?;
                return Ok(false);
            }
            ActivityReading::Corrupt => {
                tracing::warn!("activity timestamp unreadable, treating session as idle");
                return Ok(true);
            }
        };

        let elapsed = (self.clock.now() - at).to_std().unwrap_or_default();
        Ok(elapsed >= self.idle_timeout)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Wall-clock abstraction.
//!
//! Everything that compares against a poll's window reads time through a
//! [`Clock`], so tests can drive the lifecycle with a [`ManualClock`].

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real system clock.
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

    pub fn set(&self, at: DateTime<Utc>) {
        *self.lock() = at;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.lock();
        *now += by;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DateTime<Utc>> {
        self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.lock()
    }
}

/// Delay before a timer for `target` may fire.
///
/// Rounds the remaining time up to whole seconds and adds one more second so
/// the timer never fires before `target` because of clock rounding. Returns
/// `None` once `target` has been reached.
pub fn timer_delay(target: DateTime<Utc>, now: DateTime<Utc>) -> Option<Duration> {
    if now >= target {
        return None;
    }
    let remaining_ms = (target - now).num_milliseconds().max(0) as u64;
    let whole_secs = remaining_ms.div_ceil(1000);
    Some(Duration::from_secs(whole_secs + 1))
}

/// Convert a std duration into a chrono duration, saturating on overflow.
pub fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

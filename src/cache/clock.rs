use std::sync::Mutex;

use time::{Date, Duration, OffsetDateTime};

use super::lock::mutex_lock;

const SOURCE: &str = "cache::clock";

/// Source of "now" for TTLs and immutability decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;

    /// Current UTC calendar day.
    fn today(&self) -> Date {
        self.now().date()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Settable clock for tests and replaying historical runs.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub fn new(now: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: OffsetDateTime) {
        *mutex_lock(&self.now, SOURCE, "set") = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = mutex_lock(&self.now, SOURCE, "advance");
        *now = now.saturating_add(by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *mutex_lock(&self.now, SOURCE, "now")
    }
}

//! Time sources for expiry decisions.

use crate::types::TimeStamp;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Source of "now" for the sweeper and notification timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> TimeStamp;
}

/// Wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> TimeStamp {
        TimeStamp::now()
    }
}

/// Settable clock shared between clones; only ever moved by hand.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    seconds: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(seconds: i64) -> Self {
        Self {
            seconds: Arc::new(AtomicI64::new(seconds)),
        }
    }

    pub fn set(&self, seconds: i64) {
        self.seconds.store(seconds, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.seconds.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> TimeStamp {
        TimeStamp::from_secs(self.seconds.load(Ordering::SeqCst))
    }
}

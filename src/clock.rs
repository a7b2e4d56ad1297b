//! The timer capability (spec §9: "timer as a replaceable capability").
//!
//! `Clock::now` is the only primitive the reliability engine needs; a single
//! pending retransmission deadline per connection is tracked as a plain
//! `Option<Instant>` (see [`crate::conn::Timer`]) rather than a registered
//! callback, since the engine is driven by one cooperative loop
//! ([`crate::runtime`]) that already polls for due work each iteration.
//! Tests inject a [`ManualClock`] so RTO/backoff behavior is deterministic
//! and doesn't need real sleeps.

use std::cell::Cell;
use std::time::{Duration, Instant};

pub trait Clock {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only advances when told to. `Instant` itself cannot be
/// constructed out of thin air, so this anchors to the instant it was
/// created and tracks an additional offset `advance` adds to.
pub struct ManualClock {
    epoch: Instant,
    offset: Cell<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        ManualClock {
            epoch: Instant::now(),
            offset: Cell::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.offset.set(self.offset.get() + by);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.epoch + self.offset.get()
    }
}

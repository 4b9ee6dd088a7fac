// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Coarse time source used for TTL expiry, segment maturity, and resetting the
//! frequency counters in the hash table.

use core::sync::atomic::{AtomicU32, Ordering};

/// A source of coarse time, in whole seconds since some fixed start point.
/// Time should not go backwards.
pub trait Clock: Send + Sync {
    fn now(&self) -> u32;
}

/// The default clock, counting seconds since the clock was created.
pub struct CoarseClock {
    start: clocksource::coarse::Instant,
}

impl CoarseClock {
    pub fn new() -> Self {
        Self {
            start: clocksource::coarse::Instant::now(),
        }
    }
}

impl Default for CoarseClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for CoarseClock {
    fn now(&self) -> u32 {
        self.start.elapsed().as_secs()
    }
}

/// A clock which only moves when told to. Useful for tests and simulations.
#[derive(Default)]
pub struct ManualClock {
    now: AtomicU32,
}

impl ManualClock {
    pub fn new(start: u32) -> Self {
        Self {
            now: AtomicU32::new(start),
        }
    }

    pub fn set(&self, now: u32) {
        self.now.store(now, Ordering::Release);
    }

    pub fn advance(&self, seconds: u32) {
        self.now.fetch_add(seconds, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u32 {
        self.now.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock() {
        let clock = ManualClock::new(5);
        assert_eq!(clock.now(), 5);
        clock.advance(10);
        assert_eq!(clock.now(), 15);
        clock.set(3);
        assert_eq!(clock.now(), 3);
    }

    #[test]
    fn coarse_clock_starts_near_zero() {
        let clock = CoarseClock::new();
        assert!(clock.now() <= 1);
    }
}

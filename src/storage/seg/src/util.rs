// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Bounded retry combinators for the optimistic concurrency paths.

use core::sync::atomic::{AtomicU32, Ordering};

/// The outcome of a bounded optimistic operation.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Outcome<T> {
    /// The operation completed with the given result.
    Success(T),
    /// Every attempt lost a race with another thread.
    Contended,
    /// The operation decided it could not proceed.
    Exhausted,
}

/// What a single attempt inside [`retry`] produced.
pub(crate) enum Attempt<T> {
    /// Stop and return this value.
    Done(T),
    /// Lost a race, try again if attempts remain.
    Retry,
    /// Give up without further attempts.
    GiveUp,
}

/// Run `f` up to `max_attempts` times. The attempt number, starting at zero,
/// is passed in so callers can relax conditions on later attempts.
pub(crate) fn retry<T, F>(max_attempts: usize, mut f: F) -> Outcome<T>
where
    F: FnMut(usize) -> Attempt<T>,
{
    for attempt in 0..max_attempts {
        match f(attempt) {
            Attempt::Done(v) => return Outcome::Success(v),
            Attempt::Retry => {
                backoff(attempt as u32);
            }
            Attempt::GiveUp => return Outcome::Exhausted,
        }
    }
    Outcome::Contended
}

/// Compare-and-swap loop on an `AtomicU32`. The closure sees the current
/// value and returns the new value plus a result, or `None` to abort.
pub(crate) fn cas_u32<T, F>(atomic: &AtomicU32, max_attempts: u32, mut f: F) -> Outcome<T>
where
    F: FnMut(u32) -> Option<(u32, T)>,
{
    let mut current = atomic.load(Ordering::Acquire);
    for attempt in 0..max_attempts {
        let (new, result) = match f(current) {
            Some(v) => v,
            None => return Outcome::Exhausted,
        };
        match atomic.compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return Outcome::Success(result),
            Err(actual) => {
                current = actual;
                backoff(attempt);
            }
        }
    }
    Outcome::Contended
}

/// Exponential spin backoff, capped at 64 spins.
#[inline]
pub(crate) fn backoff(attempt: u32) {
    for _ in 0..(1u32 << attempt.min(6)) {
        core::hint::spin_loop();
    }
}

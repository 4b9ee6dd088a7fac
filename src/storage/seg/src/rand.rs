// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Thread-local fast PRNG used for probabilistic frequency counting and random
//! victim selection.

use rand::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::cell::RefCell;

thread_local! {
    static RNG: RefCell<Xoshiro256PlusPlus> = RefCell::new(Xoshiro256PlusPlus::from_entropy());
}

/// Returns a random `u64` from the calling thread's generator.
pub(crate) fn random_u64() -> u64 {
    RNG.with(|rng| rng.borrow_mut().next_u64())
}

#[cfg(test)]
/// Reseed the calling thread's generator so tests are repeatable.
pub(crate) fn reseed(seed: u64) {
    RNG.with(|rng| *rng.borrow_mut() = Xoshiro256PlusPlus::seed_from_u64(seed));
}

// Copyright 2022-2023 polystm Contributors
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU32, Ordering};

use rand::Rng;

/// Largest doubling step of [`BusyBreaker`].
const MAX_WAIT_UNITS: u32 = 7;

/// Largest exponent used by [`exp_backoff`].
const MAX_BACKOFF_SHIFT: u32 = 16;

/// A busy keeper for short delays on CPU spin loops. Each call spins twice
/// as long as the previous one until the breaker trips.
#[derive(Default)]
pub struct BusyBreaker {
    unit: AtomicU32,
}

impl BusyBreaker {
    /// Keeps the CPU busy for the next wait unit, hinting the spin to the
    /// scheduler. Returns `Err(())` once the breaker has reached its limit.
    pub fn spin(&self) -> Result<(), ()> {
        match self.unit.load(Ordering::Acquire) {
            unit if unit <= MAX_WAIT_UNITS => {
                for _ in 0..(1u32 << unit) {
                    std::hint::spin_loop();
                }
                self.unit.store(unit + 1, Ordering::Release);
                Ok(())
            }
            _ => Err(()),
        }
    }

    /// Resets the breaker to the shortest wait unit.
    pub fn reset(&self) {
        self.unit.store(0, Ordering::Release);
    }
}

/// Randomized exponential backoff after an abort: spin for a random number
/// of cycles bounded by an exponent of the consecutive-abort count.
pub(crate) fn exp_backoff(consec_aborts: u32) {
    let shift = consec_aborts.min(MAX_BACKOFF_SHIFT);
    let bound = 1u64 << shift;
    let spins = rand::thread_rng().gen_range(0..bound.max(1));
    for _ in 0..spins {
        std::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_trips_after_max_units() {
        let breaker = BusyBreaker::default();

        for _ in 0..=MAX_WAIT_UNITS {
            assert!(breaker.spin().is_ok());
        }
        assert!(breaker.spin().is_err());

        breaker.reset();
        assert!(breaker.spin().is_ok());
    }

    #[test]
    fn test_backoff_is_bounded() {
        // saturates at the shift cap instead of overflowing
        exp_backoff(0);
        exp_backoff(MAX_BACKOFF_SHIFT + 10);
    }
}

// Copyright 2022-2023 polystm Contributors
// SPDX-License-Identifier: Apache-2.0

//! Ownership records.
//!
//! One orec covers a stripe of application memory. Its metadata word holds
//! either a version number (unlocked) or a lock token naming the owning
//! transaction; `prior` stashes the pre-acquisition version so rollback can
//! restore it.

use std::sync::atomic::{AtomicU64, Ordering};

use lazy_static::lazy_static;

use crate::types::{Word, WORD_SHIFT};

/// Most significant bit marks a lock token; the low bits then carry the
/// 1-based owner id. Unlocked values are plain clock versions.
pub(crate) const LOCK_BIT: u64 = 1 << 63;

/// Stripe count. Prime, so the multiplicative hash distributes adjacent
/// words across the table.
const NUM_ORECS: usize = 65_537;

const HASH_MULTIPLIER: usize = 0x9E37_79B9;

/// Lock token of the transaction with the given slot id.
#[inline]
pub(crate) fn lock_token(id: u32) -> u64 {
    LOCK_BIT | id as u64
}

#[inline]
pub(crate) fn is_locked(raw: u64) -> bool {
    raw & LOCK_BIT != 0
}

/// Owner id encoded in a lock token, or 0 for an unlocked value.
#[inline]
pub(crate) fn owner_of(raw: u64) -> u32 {
    if is_locked(raw) {
        (raw & !LOCK_BIT) as u32
    } else {
        0
    }
}

pub(crate) struct Orec {
    /// Version number or lock token.
    pub(crate) version: AtomicU64,
    /// Version stashed by the acquirer, restored on rollback.
    pub(crate) prior: AtomicU64,
}

impl Orec {
    fn new() -> Self {
        Self {
            version: AtomicU64::new(0),
            prior: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn load(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Commit-time acquisition: CAS the observed version to the caller's
    /// lock token and stash the version for rollback.
    #[inline]
    pub(crate) fn try_acquire(&self, observed: u64, token: u64) -> bool {
        if self
            .version
            .compare_exchange(observed, token, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.prior.store(observed, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Publishes a fresh version, releasing the lock.
    #[inline]
    pub(crate) fn release(&self, new_version: u64) {
        self.version.store(new_version, Ordering::Release);
    }

    /// Restores the stashed version, undoing an acquisition.
    #[inline]
    pub(crate) fn restore(&self) {
        self.version
            .store(self.prior.load(Ordering::Relaxed), Ordering::Release);
    }
}

lazy_static! {
    static ref ORECS: Box<[Orec]> = (0..NUM_ORECS).map(|_| Orec::new()).collect();
}

/// The orec covering the stripe of `addr`.
#[inline]
pub(crate) fn get_orec(addr: *mut Word) -> &'static Orec {
    let stripe = (addr as usize >> WORD_SHIFT).wrapping_mul(HASH_MULTIPLIER) % NUM_ORECS;
    &ORECS[stripe]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_token_encoding() {
        let token = lock_token(7);
        assert!(is_locked(token));
        assert_eq!(owner_of(token), 7);
        assert!(!is_locked(42));
        assert_eq!(owner_of(42), 0);
    }

    #[test]
    fn test_acquire_release_round_trip() {
        let orec = Orec::new();
        orec.release(10);

        let token = lock_token(3);
        assert!(orec.try_acquire(10, token));
        assert_eq!(orec.load(), token);

        // stale observation fails
        assert!(!orec.try_acquire(10, lock_token(4)));

        orec.restore();
        assert_eq!(orec.load(), 10);

        assert!(orec.try_acquire(10, token));
        orec.release(11);
        assert_eq!(orec.load(), 11);
    }

    #[test]
    fn test_same_stripe_for_same_word() {
        let value: u64 = 0;
        let addr = &value as *const u64 as *mut Word;
        assert!(std::ptr::eq(get_orec(addr), get_orec(addr)));
    }
}

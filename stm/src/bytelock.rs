// Copyright 2022-2023 polystm Contributors
// SPDX-License-Identifier: Apache-2.0

//! Byte-locks: visible-reader striped locks.
//!
//! Each lock packs a writer slot and one reader byte per thread into a
//! single cache line, so a writer can enumerate readers without touching
//! remote descriptors.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use lazy_static::lazy_static;

use crate::registry::MAX_THREADS;
use crate::types::{Word, WORD_SHIFT};

/// Stripe count, prime like the orec table.
const NUM_BYTELOCKS: usize = 65_537;

const HASH_MULTIPLIER: usize = 0x9E37_79B9;

#[repr(C, align(64))]
pub(crate) struct ByteLock {
    /// 0, or the 1-based slot id of the writing owner.
    pub(crate) owner: AtomicU32,
    /// `readers[i] != 0` means thread `i + 1` holds a read token.
    pub(crate) readers: [AtomicU8; MAX_THREADS],
}

impl ByteLock {
    fn new() -> Self {
        const ZERO: AtomicU8 = AtomicU8::new(0);
        Self {
            owner: AtomicU32::new(0),
            readers: [ZERO; MAX_THREADS],
        }
    }

    #[inline]
    pub(crate) fn owner(&self) -> u32 {
        self.owner.load(Ordering::Acquire)
    }

    /// CAS the free owner slot to the caller.
    #[inline]
    pub(crate) fn try_own(&self, id: u32) -> bool {
        self.owner
            .compare_exchange(0, id, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub(crate) fn release_owner(&self) {
        self.owner.store(0, Ordering::Release);
    }

    #[inline]
    pub(crate) fn has_read_token(&self, id: u32) -> bool {
        self.readers[(id - 1) as usize].load(Ordering::Relaxed) != 0
    }

    /// Publishes the caller's reader byte; release so the token is visible
    /// before the subsequent owner check on the read path.
    #[inline]
    pub(crate) fn set_read_token(&self, id: u32) {
        self.readers[(id - 1) as usize].store(1, Ordering::Release);
    }

    #[inline]
    pub(crate) fn clear_read_token(&self, id: u32) {
        self.readers[(id - 1) as usize].store(0, Ordering::Release);
    }

    #[inline]
    pub(crate) fn reader_at(&self, slot: usize) -> u8 {
        self.readers[slot].load(Ordering::Acquire)
    }
}

lazy_static! {
    static ref BYTELOCKS: Box<[ByteLock]> = (0..NUM_BYTELOCKS).map(|_| ByteLock::new()).collect();
}

/// The byte-lock covering the stripe of `addr`.
#[inline]
pub(crate) fn get_bytelock(addr: *mut Word) -> &'static ByteLock {
    let stripe = (addr as usize >> WORD_SHIFT).wrapping_mul(HASH_MULTIPLIER) % NUM_BYTELOCKS;
    &BYTELOCKS[stripe]
}

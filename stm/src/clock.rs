// Copyright 2022-2023 polystm Contributors
// SPDX-License-Identifier: Apache-2.0

//! The 64-bit monotonic global version clock.
//!
//! Snapshots are sampled at begin, commit obtains a fresh value strictly
//! greater than any version already published into an orec.

use std::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct GlobalClock {
    value: AtomicU64,
}

impl GlobalClock {
    pub(crate) const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Samples the current time with acquire semantics; used for begin-time
    /// snapshots and snapshot extension.
    #[inline]
    pub(crate) fn sample(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Advances the clock and returns the new value. The returned timestamp
    /// is unique to the caller and greater than every previously published
    /// orec version.
    #[inline]
    pub(crate) fn advance(&self) -> u64 {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }
}

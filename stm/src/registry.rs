// Copyright 2022-2023 polystm Contributors
// SPDX-License-Identifier: Apache-2.0

//! The runtime singleton: global clock, serial lock, the published dispatch
//! and the descriptor registry with its quiescence walk.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use atom::AtomSetOnce;
use lazy_static::lazy_static;
use log::debug;

use crate::clock::GlobalClock;
use crate::config::CONFIG;
use crate::dispatch::AlgorithmId;
use crate::errors::fatal;
use crate::serial::SerialLock;
use crate::types::{Liveness, TOP};

/// Width of the byte-lock reader array; also the hard cap on live threads.
pub const MAX_THREADS: usize = 60;

/// The cross-thread face of a transaction descriptor. Remote threads read
/// and write these fields only; everything else on [`crate::Tx`] is private
/// to the owning thread.
#[repr(align(64))]
pub(crate) struct TxShared {
    /// Slot claimed by a live thread.
    in_use: AtomicBool,
    /// Snapshot timestamp, or [`TOP`] while inactive.
    pub(crate) start_time: AtomicU64,
    /// Commit timestamp published for the quiescence protocol.
    pub(crate) last_val_time: AtomicU64,
    /// Liveness word for remote-abort protocols.
    pub(crate) alive: AtomicU32,
}

impl TxShared {
    fn new() -> Self {
        Self {
            in_use: AtomicBool::new(false),
            start_time: AtomicU64::new(TOP),
            last_val_time: AtomicU64::new(TOP),
            alive: AtomicU32::new(Liveness::Active as u32),
        }
    }

    #[inline]
    pub(crate) fn liveness(&self) -> Liveness {
        Liveness::from_u32(self.alive.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_liveness(&self, state: Liveness) {
        self.alive.store(state as u32, Ordering::Release);
    }

    /// Atomically moves `from` to `to`; fails if the liveness changed
    /// underneath, e.g. a victim that reached its commit point first.
    #[inline]
    pub(crate) fn transition(&self, from: Liveness, to: Liveness) -> bool {
        self.alive
            .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

pub(crate) struct Runtime {
    pub(crate) clock: GlobalClock,
    pub(crate) serial: SerialLock,
    /// The published dispatch, swapped only under the serial write lock.
    active: AtomicUsize,
    /// Descriptor slots, allocated on first claim and recycled on thread
    /// exit. Indexed by slot id minus one.
    slots: Vec<AtomSetOnce<Box<TxShared>>>,
    /// High-water mark of claimed slots; bounds the quiescence walk.
    threadcount: AtomicUsize,
}

impl Runtime {
    fn new() -> Self {
        let slots = (0..MAX_THREADS).map(|_| AtomSetOnce::empty()).collect();
        Self {
            clock: GlobalClock::new(),
            serial: SerialLock::new(),
            active: AtomicUsize::new(AlgorithmId::parse(&CONFIG.initial_algorithm).to_usize()),
            slots,
            threadcount: AtomicUsize::new(0),
        }
    }

    /// Claims a descriptor slot for the calling thread under the serial
    /// write lock. Slot ids are 1-based.
    pub(crate) fn claim_slot(&self) -> (u32, &TxShared) {
        self.serial.write_acquire();

        let limit = CONFIG.num_threads.min(MAX_THREADS);
        for slot in 0..limit {
            if self.slots[slot].is_none(Ordering::Acquire) {
                self.slots[slot].set_if_none(Box::new(TxShared::new()), Ordering::AcqRel);
            }
            let shared = self.slots[slot]
                .get(Ordering::Acquire)
                .expect("descriptor slot was just populated");

            if shared
                .in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                shared.start_time.store(TOP, Ordering::SeqCst);
                shared.set_liveness(Liveness::Active);
                self.threadcount.fetch_max(slot + 1, Ordering::AcqRel);
                self.serial.write_release();

                let id = (slot + 1) as u32;
                debug!("TX({}): registered descriptor slot", id);
                return (id, shared);
            }
        }

        self.serial.write_release();
        fatal("descriptor slots exhausted (raise STM_NUM_THREADS)");
    }

    /// Returns a recycled slot to the registry on thread exit.
    pub(crate) fn release_slot(&self, id: u32) {
        if let Some(shared) = self.shared(id) {
            shared.start_time.store(TOP, Ordering::SeqCst);
            shared.in_use.store(false, Ordering::Release);
            debug!("TX({}): released descriptor slot", id);
        }
    }

    /// The shared descriptor of slot `id`, if that slot was ever claimed.
    #[inline]
    pub(crate) fn shared(&self, id: u32) -> Option<&TxShared> {
        debug_assert!(id >= 1);
        self.slots[(id - 1) as usize].get(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn published(&self) -> AlgorithmId {
        AlgorithmId::from_usize(self.active.load(Ordering::Acquire))
    }

    /// Publishes a new dispatch. Callers must hold the serial write lock.
    pub(crate) fn publish(&self, id: AlgorithmId) {
        self.active.store(id.to_usize(), Ordering::Release);
    }

    /// Live threads ever registered; quiescence walks this prefix.
    pub(crate) fn threadcount(&self) -> usize {
        self.threadcount.load(Ordering::Acquire)
    }

    /// Privatization fence: blocks until every other in-flight transaction
    /// has observed a snapshot at least as new as `end_time`, or gone
    /// inactive (`start_time == TOP` satisfies the bound trivially).
    pub(crate) fn quiesce(&self, end_time: u64, self_id: u32) {
        for slot in 0..self.threadcount() {
            if slot + 1 == self_id as usize {
                continue;
            }
            if let Some(shared) = self.slots[slot].get(Ordering::Acquire) {
                while shared.start_time.load(Ordering::SeqCst) < end_time {
                    std::hint::spin_loop();
                }
            }
        }
    }
}

lazy_static! {
    static ref RUNTIME: Runtime = Runtime::new();
}

#[inline]
pub(crate) fn runtime() -> &'static Runtime {
    &RUNTIME
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_liveness_transition_is_single_shot() {
        let shared = TxShared::new();
        assert_eq!(shared.liveness(), Liveness::Active);

        assert!(shared.transition(Liveness::Active, Liveness::Committed));
        // a racing killer now loses
        assert!(!shared.transition(Liveness::Active, Liveness::Aborted));
        assert_eq!(shared.liveness(), Liveness::Committed);
    }

    #[test]
    fn test_quiesce_ignores_inactive_slots() {
        // a freshly claimed and released slot publishes TOP, so quiescence
        // must not spin on it
        let runtime = runtime();
        let (id, _) = runtime.claim_slot();
        runtime.release_slot(id);

        runtime.quiesce(runtime.clock.sample() + 1, 0);
    }
}

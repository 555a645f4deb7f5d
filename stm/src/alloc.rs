// Copyright 2022-2023 polystm Contributors
// SPDX-License-Identifier: Apache-2.0

//! Transactional memory management and registered user actions.
//!
//! Allocations and deferred frees are logged in insertion order (so nesting
//! checkpoints can drop a suffix) and materialized through an address-ordered
//! min-heap when the transaction resolves.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::types::WORD_BYTES;

#[derive(Clone, Copy)]
struct AllocEntry {
    addr: *mut u8,
    layout: Layout,
    /// `true` for memory allocated inside the transaction, `false` for a
    /// deferred free of pre-existing memory.
    allocated: bool,
}

/// The allocation log.
///
/// On commit, transactional allocations become permanent and deferred frees
/// are executed; on abort the roles flip. Either way the frees drain in
/// ascending address order.
#[derive(Default)]
pub(crate) struct AllocLog {
    entries: Vec<AllocEntry>,
}

impl AllocLog {
    /// Allocates zeroed, word-aligned memory owned by the transaction until
    /// commit.
    pub(crate) fn allocate(&mut self, size: usize) -> *mut u8 {
        let layout = Self::layout_for(size);
        let addr = unsafe { alloc_zeroed(layout) };
        if addr.is_null() {
            handle_alloc_error(layout);
        }
        self.entries.push(AllocEntry {
            addr,
            layout,
            allocated: true,
        });
        addr
    }

    /// Schedules `addr` for release at commit.
    pub(crate) fn defer_free(&mut self, addr: *mut u8, size: usize) {
        self.entries.push(AllocEntry {
            addr,
            layout: Self::layout_for(size),
            allocated: false,
        });
    }

    /// Commit: drop the allocation records, execute the deferred frees.
    pub(crate) fn on_commit(&mut self) {
        Self::drain(&mut self.entries, false);
    }

    /// Abort: release everything allocated inside the transaction, discard
    /// the deferred frees.
    pub(crate) fn on_abort(&mut self) {
        Self::drain(&mut self.entries, true);
    }

    /// Nested rollback: resolve only the entries recorded after the
    /// checkpoint, as an abort would.
    pub(crate) fn rollback_to(&mut self, len: usize) {
        let mut suffix: Vec<AllocEntry> = self.entries.drain(len..).collect();
        Self::drain(&mut suffix, true);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn drain(entries: &mut Vec<AllocEntry>, free_allocated: bool) {
        let mut heap = BinaryHeap::new();
        for entry in entries.drain(..) {
            if entry.allocated == free_allocated {
                heap.push(Reverse((
                    entry.addr as usize,
                    entry.layout.size(),
                    entry.layout.align(),
                )));
            }
        }
        while let Some(Reverse((addr, size, align))) = heap.pop() {
            let layout = Layout::from_size_align(size, align).expect("logged layout is valid");
            unsafe { dealloc(addr as *mut u8, layout) };
        }
    }

    fn layout_for(size: usize) -> Layout {
        Layout::from_size_align(size.max(1), WORD_BYTES).expect("allocation size overflow")
    }
}

type Action = Box<dyn FnOnce() + Send>;

struct ActionEntry {
    callback: Action,
    on_commit: bool,
}

/// Registered user callbacks: commit handlers run in registration order
/// after a successful commit, abort handlers run newest-first before
/// rollback.
#[derive(Default)]
pub(crate) struct ActionLog {
    entries: Vec<ActionEntry>,
}

impl ActionLog {
    pub(crate) fn register(&mut self, callback: Action, on_commit: bool) {
        self.entries.push(ActionEntry { callback, on_commit });
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn run_commit(&mut self) {
        for entry in self.entries.drain(..) {
            if entry.on_commit {
                (entry.callback)();
            }
        }
    }

    pub(crate) fn run_abort(&mut self) {
        for entry in self.entries.drain(..).rev() {
            if !entry.on_commit {
                (entry.callback)();
            }
        }
    }

    /// Nested rollback: run the abort handlers registered after the
    /// checkpoint, newest-first, and drop the commit handlers with them.
    pub(crate) fn rollback_to(&mut self, len: usize) {
        for entry in self.entries.drain(len..).rev() {
            if !entry.on_commit {
                (entry.callback)();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn test_alloc_commit_keeps_memory() {
        let mut log = AllocLog::default();
        let addr = log.allocate(64);
        assert!(!addr.is_null());

        log.on_commit();
        assert_eq!(log.len(), 0);

        // memory survived the commit; release it manually
        unsafe { dealloc(addr, Layout::from_size_align(64, WORD_BYTES).unwrap()) };
    }

    #[test]
    fn test_alloc_abort_releases_memory() {
        let mut log = AllocLog::default();
        let addr = log.allocate(64);
        assert!(!addr.is_null());
        log.on_abort();
        assert_eq!(log.len(), 0);
    }

    #[test]
    fn test_deferred_free_waits_for_commit() {
        let mut log = AllocLog::default();
        let addr = log.allocate(32);
        log.on_commit();

        // abort discards the deferred free, the memory stays valid
        log.defer_free(addr, 32);
        log.on_abort();

        // commit executes it
        log.defer_free(addr, 32);
        log.on_commit();
    }

    #[test]
    fn test_allocation_is_zeroed() {
        let mut log = AllocLog::default();
        let addr = log.allocate(16);
        let bytes = unsafe { std::slice::from_raw_parts(addr, 16) };
        assert!(bytes.iter().all(|&b| b == 0));
        log.on_abort();
    }

    #[test]
    fn test_actions_ordering() {
        let trace = Arc::new(AtomicUsize::new(0));
        let mut log = ActionLog::default();

        for i in 1..=3u32 {
            let trace = trace.clone();
            log.register(
                Box::new(move || {
                    // shift in the handler index to observe ordering
                    trace
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                            Some(v * 10 + i as usize)
                        })
                        .unwrap();
                }),
                true,
            );
        }
        log.run_commit();
        assert_eq!(trace.load(Ordering::SeqCst), 123);

        trace.store(0, Ordering::SeqCst);
        let mut log = ActionLog::default();
        for i in 1..=3u32 {
            let trace = trace.clone();
            log.register(
                Box::new(move || {
                    trace
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                            Some(v * 10 + i as usize)
                        })
                        .unwrap();
                }),
                false,
            );
        }
        log.run_abort();
        assert_eq!(trace.load(Ordering::SeqCst), 321);
    }
}

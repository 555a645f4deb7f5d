// Copyright 2022-2023 polystm Contributors
// SPDX-License-Identifier: Apache-2.0

//! The serial lock: a word-sized reader-writer spin lock.
//!
//! Every speculative transaction holds the read side from begin to commit or
//! rollback. The write side serializes the whole runtime; it is taken by the
//! serial dispatches, by dispatch switches and by descriptor registration.

use std::sync::atomic::{AtomicUsize, Ordering};

const WRITER: usize = 1 << (usize::BITS - 1);

pub(crate) struct SerialLock {
    /// Writer bit in the most significant position, reader count below.
    state: AtomicUsize,
}

impl SerialLock {
    pub(crate) const fn new() -> Self {
        Self {
            state: AtomicUsize::new(0),
        }
    }

    pub(crate) fn read_acquire(&self) {
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state & WRITER == 0
                && self
                    .state
                    .compare_exchange_weak(state, state + 1, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
            std::hint::spin_loop();
        }
    }

    pub(crate) fn read_release(&self) {
        let previous = self.state.fetch_sub(1, Ordering::Release);
        debug_assert!(previous & !WRITER > 0, "serial lock reader underflow");
    }

    /// Takes the write side: sets the writer bit, then drains readers.
    pub(crate) fn write_acquire(&self) {
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state & WRITER == 0
                && self
                    .state
                    .compare_exchange_weak(
                        state,
                        state | WRITER,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                break;
            }
            std::hint::spin_loop();
        }
        while self.state.load(Ordering::Acquire) != WRITER {
            std::hint::spin_loop();
        }
    }

    pub(crate) fn write_release(&self) {
        debug_assert_eq!(self.state.load(Ordering::Relaxed), WRITER);
        self.state.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use threadpool::ThreadPool;

    #[test]
    fn test_readers_coexist() {
        let lock = SerialLock::new();
        lock.read_acquire();
        lock.read_acquire();
        lock.read_release();
        lock.read_release();
    }

    #[test]
    fn test_writer_excludes_writers() {
        let lock = Arc::new(SerialLock::new());
        let shared = Arc::new(AtomicUsize::new(0));
        let pool = ThreadPool::new(8);
        let rounds = 2000;

        for _ in 0..8 {
            let lock = lock.clone();
            let shared = shared.clone();
            pool.execute(move || {
                for _ in 0..rounds {
                    lock.write_acquire();
                    let seen = shared.load(Ordering::Relaxed);
                    shared.store(seen + 1, Ordering::Relaxed);
                    lock.write_release();
                }
            });
        }
        pool.join();

        assert_eq!(shared.load(Ordering::Relaxed), 8 * rounds);
    }
}

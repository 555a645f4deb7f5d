// Copyright 2022-2023 polystm Contributors
// SPDX-License-Identifier: Apache-2.0

//! # polystm
//!
//! An adaptive software transactional memory runtime. Application code
//! delimits atomic regions as closures; the runtime executes them
//! speculatively on concurrent threads, detects conflicts through one of
//! several interchangeable algorithms, and either commits a region's
//! effects or rolls them back and reruns it.
//!
//! Two conflict-detection algorithms carry the load: a lazy-acquire
//! ownership-record algorithm with extensible timestamps (`OrecELA`) and an
//! eager byte-lock algorithm with visible readers and requestor-wins remote
//! abort (`ByteEAR`). A serial and a serial-irrevocable dispatch serve as
//! the universal fallback, and a retry policy moves transactions between
//! dispatches as their abort history develops. Committing writers run a
//! quiescence fence, so memory privatized by a committed transaction can be
//! read non-transactionally without racing a late writeback.
//!
//! ```
//! use polystm::atomic;
//!
//! let mut value: usize = 0;
//! let addr = &mut value as *mut usize;
//!
//! atomic(|tx| {
//!     let current: usize = unsafe { tx.read(addr)? };
//!     unsafe { tx.write(addr, current + 1) }
//! });
//!
//! assert_eq!(value, 1);
//! ```

mod algs;
mod alloc;
pub mod breaker;
mod bytelock;
mod clock;
pub mod config;
pub mod dispatch;
pub mod errors;
mod logs;
mod orec;
pub mod policy;
mod registry;
mod serial;
pub mod tx;
pub mod types;

mod cm;

pub use breaker::BusyBreaker;
pub use config::{Config, CONFIG};
pub use dispatch::{current_algorithm, set_algorithm, AlgorithmId};
pub use errors::{RestartCounters, RestartReason, TxError};
pub use policy::next_algorithm;
pub use registry::MAX_THREADS;
pub use tx::Tx;
pub use types::{read_direct, write_direct, TmWord, TxProps, Word};

/// Runs `f` as an atomic region and returns its value once an attempt
/// commits. Conflicting attempts are rolled back and rerun with the
/// dispatch chosen by the retry policy; bounded retries degrade to
/// serial-irrevocable execution, so the loop always terminates for a
/// terminating body.
pub fn atomic<R>(f: impl FnMut(&mut Tx) -> Result<R, TxError>) -> R {
    atomic_with(TxProps::empty(), f)
}

/// [`atomic`], with begin-time properties. `TxProps::DOES_GO_IRREVOCABLE`
/// routes the first attempt to the serial-irrevocable dispatch;
/// `TxProps::READ_ONLY` pins the read-only barrier set.
pub fn atomic_with<R>(props: TxProps, mut f: impl FnMut(&mut Tx) -> Result<R, TxError>) -> R {
    tx::with_current(|tx| {
        tx.props = props;
        loop {
            tx.begin_outer();
            match f(tx) {
                Ok(value) => match tx.commit_outer() {
                    Ok(()) => return value,
                    Err(err) => tx.handle_abort(err),
                },
                Err(err) => tx.handle_abort(err),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_thread_read_modify_write() {
        let mut value: usize = 7;
        let addr = &mut value as *mut usize;

        let seen = atomic(|tx| {
            let current: usize = unsafe { tx.read(addr)? };
            unsafe { tx.write(addr, current + 3)? };
            Ok(current)
        });

        assert_eq!(seen, 7);
        assert_eq!(value, 10);
    }

    #[test]
    fn test_atomic_returns_closure_value() {
        let result = atomic(|_tx| Ok("done"));
        assert_eq!(result, "done");
    }
}

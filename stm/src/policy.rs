// Copyright 2022-2023 polystm Contributors
// SPDX-License-Identifier: Apache-2.0

//! The retry policy: a pure decision tree from the last restart reason and
//! the descriptor's counters to the dispatch of the next attempt.

use log::debug;

use crate::dispatch::{set_algorithm, AlgorithmId};
use crate::errors::{RestartCounters, RestartReason};
use crate::registry::runtime;
use crate::tx::Tx;
use crate::types::TxProps;

/// Consecutive aborts tolerated before the attempt is forced onto the
/// serial-irrevocable dispatch. Bounds the abort count of any transaction,
/// which is what makes overall progress provable.
pub const SERIAL_ABORT_CEILING: u32 = 16;

/// Validation failures a descriptor may accumulate on the lazy algorithm
/// before eager acquisition is worth the switch.
pub const VALIDATE_SWITCH_CEILING: u64 = 8;

/// Decides where the next attempt runs.
///
/// Pure in its inputs: the reason the last attempt died (`None` for an
/// explicit restart), the monotonic per-reason counters, the
/// consecutive-abort count, the registered thread count and the current
/// dispatch.
pub fn next_algorithm(
    reason: Option<RestartReason>,
    counters: &RestartCounters,
    consec_aborts: u32,
    threads: usize,
    current: AlgorithmId,
) -> AlgorithmId {
    if reason == Some(RestartReason::SerialIrrevocable) {
        return AlgorithmId::SerialIrrevocable;
    }
    if consec_aborts >= SERIAL_ABORT_CEILING {
        return AlgorithmId::SerialIrrevocable;
    }
    // speculation keeps failing validation: wasted work shrinks with eager
    // acquisition, but only when there is actual concurrency to arbitrate
    let validation_conflict = matches!(
        reason,
        Some(
            RestartReason::ValidateRead
                | RestartReason::ValidateWrite
                | RestartReason::ValidateCommit
        )
    );
    if validation_conflict
        && counters.validation_failures() >= VALIDATE_SWITCH_CEILING
        && threads > 1
        && current == AlgorithmId::OrecEla
    {
        return AlgorithmId::ByteEar;
    }
    current
}

/// Applies the decision tree after a rollback. Serial-family targets are
/// installed as a one-shot override for this descriptor; everything else is
/// published globally inside a serial section.
pub(crate) fn after_abort(tx: &mut Tx, reason: Option<RestartReason>) {
    if reason == Some(RestartReason::NotReadOnly) {
        // retry as a writer
        tx.props.remove(TxProps::READ_ONLY);
    }

    let mut target = next_algorithm(
        reason,
        &tx.restarts,
        tx.consec_aborts,
        runtime().threadcount(),
        tx.alg,
    );

    if target == AlgorithmId::SerialIrrevocable && tx.props.contains(TxProps::HAS_NO_IRREVOCABLE)
    {
        target = AlgorithmId::Serial;
    }

    if target == tx.alg {
        return;
    }

    debug!(
        "TX({}): retry policy moves {} -> {}",
        tx.id,
        tx.alg.name(),
        target.name()
    );

    if target.takes_write_lock() {
        tx.pending = Some(target);
    } else if target != runtime().published() {
        set_algorithm(target);
        tx.restarts.bump(RestartReason::InitMethodGroup);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validation_history(failures: u64) -> RestartCounters {
        let mut counters = RestartCounters::default();
        for _ in 0..failures {
            counters.bump(RestartReason::ValidateCommit);
        }
        counters
    }

    #[test]
    fn test_serial_irrevocable_reason_is_sticky() {
        let counters = RestartCounters::default();
        assert_eq!(
            next_algorithm(
                Some(RestartReason::SerialIrrevocable),
                &counters,
                1,
                8,
                AlgorithmId::OrecEla,
            ),
            AlgorithmId::SerialIrrevocable
        );
    }

    #[test]
    fn test_bounded_aborts_force_serial() {
        let counters = RestartCounters::default();
        assert_eq!(
            next_algorithm(
                Some(RestartReason::LockedWrite),
                &counters,
                SERIAL_ABORT_CEILING,
                8,
                AlgorithmId::ByteEar,
            ),
            AlgorithmId::SerialIrrevocable
        );
    }

    #[test]
    fn test_validation_storm_goes_eager() {
        let counters = validation_history(VALIDATE_SWITCH_CEILING);
        assert_eq!(
            next_algorithm(
                Some(RestartReason::ValidateCommit),
                &counters,
                2,
                8,
                AlgorithmId::OrecEla,
            ),
            AlgorithmId::ByteEar
        );

        // a non-validation conflict keeps the lazy dispatch, history or not
        assert_eq!(
            next_algorithm(
                Some(RestartReason::LockedRead),
                &counters,
                2,
                8,
                AlgorithmId::OrecEla,
            ),
            AlgorithmId::OrecEla
        );

        // a single thread gains nothing from eager acquisition
        assert_eq!(
            next_algorithm(
                Some(RestartReason::ValidateCommit),
                &counters,
                2,
                1,
                AlgorithmId::OrecEla,
            ),
            AlgorithmId::OrecEla
        );
    }

    #[test]
    fn test_sparse_validation_failures_stay_lazy() {
        let counters = validation_history(VALIDATE_SWITCH_CEILING - 1);
        assert_eq!(
            next_algorithm(
                Some(RestartReason::ValidateRead),
                &counters,
                2,
                8,
                AlgorithmId::OrecEla,
            ),
            AlgorithmId::OrecEla
        );
    }

    #[test]
    fn test_quiet_abort_keeps_the_dispatch() {
        let counters = RestartCounters::default();
        assert_eq!(
            next_algorithm(None, &counters, 1, 8, AlgorithmId::ByteEar),
            AlgorithmId::ByteEar
        );
    }
}

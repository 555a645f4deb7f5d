// Copyright 2022-2023 polystm Contributors
// SPDX-License-Identifier: Apache-2.0

//! Contention managers: the policy half of conflict handling, composed with
//! an algorithm by type parameter. `may_kill` arbitrates remote aborts; the
//! lifecycle hooks let a manager keep per-descriptor pacing state.

use crate::breaker::exp_backoff;
use crate::tx::Tx;

pub(crate) trait ContentionManager: Sync + 'static {
    fn on_begin(_tx: &mut Tx) {}

    fn on_commit(_tx: &mut Tx) {}

    fn on_abort(_tx: &mut Tx) {}

    /// May `tx` remotely abort the transaction in slot `victim`?
    fn may_kill(tx: &Tx, victim: u32) -> bool;
}

/// Requestor wins: always kill the other party, never pace.
pub(crate) struct HyperAggressive;

impl ContentionManager for HyperAggressive {
    #[inline]
    fn may_kill(_tx: &Tx, _victim: u32) -> bool {
        true
    }
}

/// Requestor wins, but pace retries with randomized exponential backoff so
/// two symmetric killers cannot livelock each other.
pub(crate) struct Backoff;

impl ContentionManager for Backoff {
    fn on_abort(tx: &mut Tx) {
        exp_backoff(tx.consec_aborts);
    }

    #[inline]
    fn may_kill(_tx: &Tx, _victim: u32) -> bool {
        true
    }
}

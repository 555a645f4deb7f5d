// Copyright 2022-2023 polystm Contributors
// SPDX-License-Identifier: Apache-2.0

//! OrecELA: lazy write acquisition over ownership records, with extensible
//! timestamps and a privatization-safe quiescence fence after commit.
//!
//! Reads sample the covering orec around the value; a too-new version
//! extends the snapshot by revalidating the read set against a fresh
//! timestamp. Writes buffer into the redo log and acquire their orecs only
//! at commit, so in-flight transactions never hold locks.

use std::marker::PhantomData;
use std::sync::atomic::{fence, Ordering};

use crate::cm::ContentionManager;
use crate::config::CONFIG;
use crate::dispatch::Algorithm;
use crate::errors::{RestartReason, TxError};
use crate::orec::{get_orec, is_locked};
use crate::registry::runtime;
use crate::tx::Tx;
use crate::types::{load_word, Liveness, Word, TOP};

pub(crate) struct OrecEla<CM> {
    _cm: PhantomData<CM>,
}

impl<CM> OrecEla<CM> {
    pub(crate) const fn new() -> Self {
        Self { _cm: PhantomData }
    }
}

/// In-flight read-set validation: every observed orec must still be at or
/// below the snapshot time. Walked linearly, each entry exactly once.
fn validate(tx: &Tx) -> Result<(), TxError> {
    for entry in tx.reads.iter() {
        let ivt = entry.orec.load();
        if ivt > tx.start_time && ivt != tx.my_lock {
            return Err(TxError::Conflict(RestartReason::ValidateRead));
        }
    }
    Ok(())
}

impl<CM: ContentionManager> Algorithm for OrecEla<CM> {
    fn name(&self) -> &'static str {
        "OrecELA"
    }

    fn begin(&self, tx: &mut Tx) {
        let now = runtime().clock.sample();
        tx.start_time = now;
        tx.shared.start_time.store(now, Ordering::SeqCst);
        tx.shared.set_liveness(Liveness::Active);
        CM::on_begin(tx);
    }

    fn read_ro(&self, tx: &mut Tx, addr: *mut Word, _mask: Word) -> Result<Word, TxError> {
        let orec = get_orec(addr);
        let mut spins = 0u32;

        loop {
            // value first, version second; the acquire load of the version
            // orders the pair
            let val = unsafe { load_word(addr) };
            let ivt = orec.load();

            // common case: unlocked and covered by the snapshot
            if ivt <= tx.start_time {
                tx.reads.push(orec, ivt);
                return Ok(val);
            }

            if is_locked(ivt) {
                // observing our own lock means not-locked-by-another
                if ivt == tx.my_lock {
                    tx.reads.push(orec, ivt);
                    return Ok(val);
                }
                spins += 1;
                if spins > CONFIG.drain_budget() {
                    return Err(TxError::Conflict(RestartReason::LockedRead));
                }
                std::hint::spin_loop();
                continue;
            }

            // unlocked but newer than the snapshot: extend the timestamp
            // and revalidate everything read so far
            let extended = runtime().clock.sample();
            validate(tx)?;
            tx.start_time = extended;
            tx.shared.start_time.store(extended, Ordering::SeqCst);
        }
    }

    fn read_rw(&self, tx: &mut Tx, addr: *mut Word, mask: Word) -> Result<Word, TxError> {
        // check the redo log for a RAW hazard; last writer wins
        if let Some(entry) = tx.writes.find(addr) {
            if entry.mask & mask == mask {
                return Ok(entry.val);
            }
        }

        let mem = self.read_ro(tx, addr, mask)?;

        // merge a partial hit over the memory value
        if let Some(entry) = tx.writes.find(addr) {
            return Ok((mem & !entry.mask) | (entry.val & entry.mask));
        }
        Ok(mem)
    }

    fn write_ro(
        &self,
        tx: &mut Tx,
        addr: *mut Word,
        val: Word,
        mask: Word,
    ) -> Result<(), TxError> {
        tx.writes.insert(addr, val, mask);
        Ok(())
    }

    fn write_rw(
        &self,
        tx: &mut Tx,
        addr: *mut Word,
        val: Word,
        mask: Word,
    ) -> Result<(), TxError> {
        tx.writes.insert(addr, val, mask);
        Ok(())
    }

    fn commit_ro(&self, tx: &mut Tx) -> Result<(), TxError> {
        CM::on_commit(tx);
        tx.reads.clear();
        tx.shared.start_time.store(TOP, Ordering::SeqCst);
        Ok(())
    }

    fn commit_rw(&self, tx: &mut Tx) -> Result<(), TxError> {
        let start_time = tx.start_time;
        let my_lock = tx.my_lock;

        // acquire phase: lock every stripe the redo log touches
        for entry in tx.writes.iter() {
            let orec = get_orec(entry.addr);
            let ivt = orec.load();

            if ivt <= start_time {
                if !orec.try_acquire(ivt, my_lock) {
                    return Err(TxError::Conflict(RestartReason::ValidateCommit));
                }
                tx.locks.push(orec);
            } else if ivt != my_lock {
                return Err(TxError::Conflict(RestartReason::ValidateCommit));
            }
        }

        // validate phase
        for entry in tx.reads.iter() {
            let ivt = entry.orec.load();
            if ivt > start_time && ivt != my_lock {
                return Err(TxError::Conflict(RestartReason::ValidateCommit));
            }
        }

        // writeback phase
        tx.writes.writeback();
        fence(Ordering::SeqCst);

        // release phase: fresh commit timestamp, published into every held
        // orec; last_val_time is recorded before the release stores
        let end_time = runtime().clock.advance();
        tx.shared.last_val_time.store(end_time, Ordering::SeqCst);
        tx.shared.start_time.store(TOP, Ordering::SeqCst);
        for orec in tx.locks.drain(..) {
            orec.release(end_time);
        }

        CM::on_commit(tx);
        tx.reads.clear();
        tx.writes.clear();

        // quiescence phase: no snapshot older than end_time may still be
        // running once we return to the application
        fence(Ordering::SeqCst);
        runtime().quiesce(end_time, tx.id);
        Ok(())
    }

    fn rollback(&self, tx: &mut Tx) {
        tx.shared.last_val_time.store(TOP, Ordering::SeqCst);

        // undo commit-time acquisitions
        for orec in tx.locks.drain(..) {
            orec.restore();
        }

        CM::on_abort(tx);
        tx.reads.clear();
        tx.writes.clear();
        tx.undo.clear();
        tx.shared.start_time.store(TOP, Ordering::SeqCst);
    }

    fn irrevoc(&self, _tx: &mut Tx) -> bool {
        // by the time an in-flight upgrade is wanted, restarting on the
        // serial-irrevocable dispatch is cheaper than committing here
        false
    }

    fn on_switch(&self) {}
}

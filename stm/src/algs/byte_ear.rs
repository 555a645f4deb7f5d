// Copyright 2022-2023 polystm Contributors
// SPDX-License-Identifier: Apache-2.0

//! ByteEAR: eager byte-lock acquisition with in-place writes, an undo log,
//! visible readers and requestor-wins remote abort.
//!
//! Conflicts are resolved by killing the other party through a CAS on its
//! liveness word; a victim that already reached its commit point wins the
//! race instead. Because writes land in place, anyone displacing an owner
//! must wait for the owner slot to clear (the unwind restores memory)
//! before touching the stripe.

use std::marker::PhantomData;
use std::sync::atomic::{fence, Ordering};

use crate::bytelock::{get_bytelock, ByteLock};
use crate::cm::ContentionManager;
use crate::config::CONFIG;
use crate::dispatch::Algorithm;
use crate::errors::{RestartReason, TxError};
use crate::registry::{runtime, MAX_THREADS};
use crate::tx::Tx;
use crate::types::{load_word, store_word_masked, Liveness, Word, TOP};

pub(crate) struct ByteEar<CM> {
    _cm: PhantomData<CM>,
}

impl<CM> ByteEar<CM> {
    pub(crate) const fn new() -> Self {
        Self { _cm: PhantomData }
    }
}

impl<CM: ContentionManager> ByteEar<CM> {
    /// Displaces the current owner of `lock`, if any, and waits for its
    /// unwind to finish. `budget` bounds the wait; exceeding it aborts with
    /// `reason`.
    fn clear_owner(
        tx: &Tx,
        lock: &'static ByteLock,
        budget: u32,
        reason: RestartReason,
    ) -> Result<(), TxError> {
        let mut spins = 0u32;
        loop {
            let owner = lock.owner();
            if owner == 0 || owner == tx.id {
                return Ok(());
            }

            if let Some(victim) = runtime().shared(owner) {
                match victim.liveness() {
                    // the owner is writing back its commit; yield to it
                    Liveness::Committed => return Err(TxError::Conflict(reason)),
                    Liveness::Active => {
                        if CM::may_kill(tx, owner) {
                            // losing this race means the victim committed
                            // first; the next iteration re-inspects it
                            let _ = victim.transition(Liveness::Active, Liveness::Aborted);
                        } else {
                            return Err(TxError::Conflict(reason));
                        }
                    }
                    // unwinding; the slot clears once its undo completes
                    Liveness::Aborted => {}
                }
            }

            if tx.shared.liveness() == Liveness::Aborted {
                return Err(TxError::Conflict(reason));
            }
            spins += 1;
            if spins > budget {
                return Err(TxError::Conflict(reason));
            }
            std::hint::spin_loop();
        }
    }

    fn read_common(&self, tx: &mut Tx, addr: *mut Word) -> Result<Word, TxError> {
        let lock = get_bytelock(addr);

        // publish the read token before inspecting the owner
        if !lock.has_read_token(tx.id) {
            tx.r_bytelocks.push(lock);
            lock.set_read_token(tx.id);
        }

        Self::clear_owner(
            tx,
            lock,
            CONFIG.read_budget() + CONFIG.drain_budget(),
            RestartReason::LockedRead,
        )?;

        let val = unsafe { load_word(addr) };

        // remote aborts become visible here at the latest
        if tx.shared.liveness() == Liveness::Aborted {
            return Err(TxError::Conflict(RestartReason::LockedRead));
        }
        Ok(val)
    }

    fn write_common(
        &self,
        tx: &mut Tx,
        addr: *mut Word,
        val: Word,
        mask: Word,
    ) -> Result<(), TxError> {
        let lock = get_bytelock(addr);

        if lock.owner() != tx.id {
            // displace the owner, then race for the slot
            let budget = CONFIG.acquire_budget() + CONFIG.drain_budget();
            let mut spins = 0u32;
            loop {
                Self::clear_owner(tx, lock, budget, RestartReason::LockedWrite)?;
                if lock.try_own(tx.id) {
                    break;
                }
                if tx.shared.liveness() == Liveness::Aborted {
                    return Err(TxError::Conflict(RestartReason::LockedWrite));
                }
                spins += 1;
                if spins > budget {
                    return Err(TxError::Conflict(RestartReason::LockedWrite));
                }
                std::hint::spin_loop();
            }

            tx.w_bytelocks.push(lock);
            lock.clear_read_token(tx.id);

            // abort every visible active reader; a reader that wins the
            // liveness race is committing, so yield to it
            for slot in 0..MAX_THREADS {
                let reader_id = (slot + 1) as u32;
                if reader_id == tx.id || lock.reader_at(slot) == 0 {
                    continue;
                }
                if let Some(reader) = runtime().shared(reader_id) {
                    if reader.liveness() == Liveness::Active {
                        if !CM::may_kill(tx, reader_id) {
                            return Err(TxError::Conflict(RestartReason::LockedWrite));
                        }
                        if !reader.transition(Liveness::Active, Liveness::Aborted)
                            && reader.liveness() == Liveness::Committed
                        {
                            return Err(TxError::Conflict(RestartReason::LockedWrite));
                        }
                    }
                }
            }
        }

        // undo entry, then the in-place masked write
        let old = unsafe { load_word(addr) };
        tx.undo.push(addr, old, mask);
        unsafe { store_word_masked(addr, val, mask) };

        if tx.shared.liveness() == Liveness::Aborted {
            return Err(TxError::Conflict(RestartReason::LockedWrite));
        }
        Ok(())
    }

    fn release_all(tx: &mut Tx) {
        for lock in tx.w_bytelocks.drain(..) {
            lock.release_owner();
        }
        for lock in tx.r_bytelocks.drain(..) {
            lock.clear_read_token(tx.id);
        }
    }
}

impl<CM: ContentionManager> Algorithm for ByteEar<CM> {
    fn name(&self) -> &'static str {
        "ByteEAR"
    }

    fn begin(&self, tx: &mut Tx) {
        tx.shared.set_liveness(Liveness::Active);
        let now = runtime().clock.sample();
        tx.start_time = now;
        tx.shared.start_time.store(now, Ordering::SeqCst);
        CM::on_begin(tx);
    }

    fn read_ro(&self, tx: &mut Tx, addr: *mut Word, _mask: Word) -> Result<Word, TxError> {
        self.read_common(tx, addr)
    }

    fn read_rw(&self, tx: &mut Tx, addr: *mut Word, _mask: Word) -> Result<Word, TxError> {
        let lock = get_bytelock(addr);

        // writes land in place, so owning the stripe makes the memory word
        // itself the read-after-write value
        if lock.owner() == tx.id {
            return Ok(unsafe { load_word(addr) });
        }
        self.read_common(tx, addr)
    }

    fn write_ro(
        &self,
        tx: &mut Tx,
        addr: *mut Word,
        val: Word,
        mask: Word,
    ) -> Result<(), TxError> {
        self.write_common(tx, addr, val, mask)
    }

    fn write_rw(
        &self,
        tx: &mut Tx,
        addr: *mut Word,
        val: Word,
        mask: Word,
    ) -> Result<(), TxError> {
        self.write_common(tx, addr, val, mask)
    }

    fn commit_ro(&self, tx: &mut Tx) -> Result<(), TxError> {
        for lock in tx.r_bytelocks.drain(..) {
            lock.clear_read_token(tx.id);
        }
        CM::on_commit(tx);
        tx.shared.start_time.store(TOP, Ordering::SeqCst);
        Ok(())
    }

    fn commit_rw(&self, tx: &mut Tx) -> Result<(), TxError> {
        // win the liveness race or unwind; a killer that got in first has
        // already decided this attempt's fate
        if !tx
            .shared
            .transition(Liveness::Active, Liveness::Committed)
        {
            return Err(TxError::Conflict(RestartReason::ValidateCommit));
        }
        fence(Ordering::SeqCst);

        Self::release_all(tx);
        tx.undo.clear();
        CM::on_commit(tx);
        tx.shared.start_time.store(TOP, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(&self, tx: &mut Tx) {
        // restore memory before dropping ownership
        tx.undo.undo_all();
        fence(Ordering::SeqCst);

        Self::release_all(tx);
        tx.writes.clear();
        tx.reads.clear();

        CM::on_abort(tx);
        tx.shared.start_time.store(TOP, Ordering::SeqCst);
    }

    fn irrevoc(&self, _tx: &mut Tx) -> bool {
        false
    }

    fn on_switch(&self) {
        // no algorithm leaves the byte-lock table in a nonzero state
    }
}

// Copyright 2022-2023 polystm Contributors
// SPDX-License-Identifier: Apache-2.0

//! The serial dispatches: the universal fallback. Both run under the write
//! side of the serial lock, so the transaction body executes alone and
//! reads and writes go straight to memory.
//!
//! `Serial` keeps an undo log and can still roll back (explicit restarts,
//! cancelled regions); `SerialIrrevocable` disables logging entirely and
//! must never unwind.

use std::sync::atomic::Ordering;

use crate::dispatch::Algorithm;
use crate::errors::{fatal, TxError};
use crate::registry::runtime;
use crate::tx::Tx;
use crate::types::{load_word, store_word_masked, Liveness, Word, TOP};

pub(crate) struct Serial;

impl Algorithm for Serial {
    fn name(&self) -> &'static str {
        "Serial"
    }

    fn begin(&self, tx: &mut Tx) {
        let now = runtime().clock.sample();
        tx.start_time = now;
        tx.shared.start_time.store(now, Ordering::SeqCst);
        tx.shared.set_liveness(Liveness::Active);
    }

    fn read_ro(&self, _tx: &mut Tx, addr: *mut Word, _mask: Word) -> Result<Word, TxError> {
        Ok(unsafe { load_word(addr) })
    }

    fn read_rw(&self, tx: &mut Tx, addr: *mut Word, mask: Word) -> Result<Word, TxError> {
        self.read_ro(tx, addr, mask)
    }

    fn write_ro(
        &self,
        tx: &mut Tx,
        addr: *mut Word,
        val: Word,
        mask: Word,
    ) -> Result<(), TxError> {
        let old = unsafe { load_word(addr) };
        tx.undo.push(addr, old, mask);
        unsafe { store_word_masked(addr, val, mask) };
        Ok(())
    }

    fn write_rw(
        &self,
        tx: &mut Tx,
        addr: *mut Word,
        val: Word,
        mask: Word,
    ) -> Result<(), TxError> {
        self.write_ro(tx, addr, val, mask)
    }

    fn commit_ro(&self, tx: &mut Tx) -> Result<(), TxError> {
        tx.shared.start_time.store(TOP, Ordering::SeqCst);
        Ok(())
    }

    fn commit_rw(&self, tx: &mut Tx) -> Result<(), TxError> {
        tx.undo.clear();
        tx.shared.start_time.store(TOP, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(&self, tx: &mut Tx) {
        tx.undo.undo_all();
        tx.writes.clear();
        tx.reads.clear();
        tx.shared.start_time.store(TOP, Ordering::SeqCst);
    }

    fn irrevoc(&self, tx: &mut Tx) -> bool {
        // already alone under the write lock; the caller re-routes the
        // dispatch once the undo log is gone
        tx.undo.clear();
        true
    }

    fn on_switch(&self) {}
}

pub(crate) struct SerialIrrevocable;

impl Algorithm for SerialIrrevocable {
    fn name(&self) -> &'static str {
        "SerialIrrevocable"
    }

    fn begin(&self, tx: &mut Tx) {
        let now = runtime().clock.sample();
        tx.start_time = now;
        tx.shared.start_time.store(now, Ordering::SeqCst);
        tx.shared.set_liveness(Liveness::Active);
    }

    fn read_ro(&self, _tx: &mut Tx, addr: *mut Word, _mask: Word) -> Result<Word, TxError> {
        Ok(unsafe { load_word(addr) })
    }

    fn read_rw(&self, tx: &mut Tx, addr: *mut Word, mask: Word) -> Result<Word, TxError> {
        self.read_ro(tx, addr, mask)
    }

    fn write_ro(
        &self,
        _tx: &mut Tx,
        addr: *mut Word,
        val: Word,
        mask: Word,
    ) -> Result<(), TxError> {
        unsafe { store_word_masked(addr, val, mask) };
        Ok(())
    }

    fn write_rw(
        &self,
        tx: &mut Tx,
        addr: *mut Word,
        val: Word,
        mask: Word,
    ) -> Result<(), TxError> {
        self.write_ro(tx, addr, val, mask)
    }

    fn commit_ro(&self, tx: &mut Tx) -> Result<(), TxError> {
        tx.shared.start_time.store(TOP, Ordering::SeqCst);
        Ok(())
    }

    fn commit_rw(&self, tx: &mut Tx) -> Result<(), TxError> {
        tx.shared.start_time.store(TOP, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(&self, _tx: &mut Tx) {
        fatal("irrevocable transaction rolled back");
    }

    fn irrevoc(&self, _tx: &mut Tx) -> bool {
        true
    }

    fn on_switch(&self) {}
}

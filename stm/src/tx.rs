// Copyright 2022-2023 polystm Contributors
// SPDX-License-Identifier: Apache-2.0

//! The per-thread transaction descriptor and the dispatch-independent
//! lifecycle: begin, commit, abort, closed nesting and the typed barriers.

use std::cell::RefCell;

use log::{debug, trace};

use crate::alloc::{ActionLog, AllocLog};
use crate::bytelock::ByteLock;
use crate::dispatch::{algorithm, AlgorithmId};
use crate::errors::{fatal, RestartCounters, RestartReason, TxError};
use crate::logs::{Checkpoint, ReadSet, UndoLog, WriteSet};
use crate::orec::{lock_token, Orec};
use crate::policy;
use crate::registry::{runtime, TxShared};
use crate::types::{word_of, BarrierMode, TmWord, TxProps, TxState, Word, TOP};

/// A thread's transaction descriptor. One exists per registered thread and
/// lives until thread exit; the same descriptor is reused across attempts.
pub struct Tx {
    /// 1-based descriptor slot.
    pub(crate) id: u32,
    /// Orec lock token naming this transaction.
    pub(crate) my_lock: u64,
    /// Fields visible to other threads.
    pub(crate) shared: &'static TxShared,

    /// Depth of active regions; 1 is the outermost.
    pub(crate) nesting: u32,
    pub(crate) state: TxState,
    pub(crate) props: TxProps,
    pub(crate) mode: BarrierMode,
    /// Dispatch installed at the last begin.
    pub(crate) alg: AlgorithmId,
    /// Local copy of the published snapshot timestamp.
    pub(crate) start_time: u64,

    pub(crate) reads: ReadSet,
    pub(crate) writes: WriteSet,
    pub(crate) undo: UndoLog,
    pub(crate) locks: Vec<&'static Orec>,
    pub(crate) r_bytelocks: Vec<&'static ByteLock>,
    pub(crate) w_bytelocks: Vec<&'static ByteLock>,
    pub(crate) allocs: AllocLog,
    pub(crate) actions: ActionLog,
    checkpoints: Vec<Checkpoint>,

    pub(crate) restarts: RestartCounters,
    /// Aborts since the last successful commit.
    pub(crate) consec_aborts: u32,
    /// One-shot dispatch override installed by the retry policy.
    pub(crate) pending: Option<AlgorithmId>,
}

thread_local! {
    static CURRENT: RefCell<Option<Tx>> = RefCell::new(None);
}

/// Runs `f` with the calling thread's descriptor, registering the thread on
/// first use.
pub(crate) fn with_current<R>(f: impl FnOnce(&mut Tx) -> R) -> R {
    CURRENT.with(|cell| {
        let mut slot = match cell.try_borrow_mut() {
            Ok(slot) => slot,
            Err(_) => panic!("nested atomic region; use Tx::nested inside the open transaction"),
        };
        let tx = slot.get_or_insert_with(Tx::register);
        f(tx)
    })
}

impl Tx {
    fn register() -> Self {
        let (id, shared) = runtime().claim_slot();
        Self {
            id,
            my_lock: lock_token(id),
            shared,
            nesting: 0,
            state: TxState::empty(),
            props: TxProps::empty(),
            mode: BarrierMode::ReadOnly,
            alg: runtime().published(),
            start_time: TOP,
            reads: ReadSet::default(),
            writes: WriteSet::default(),
            undo: UndoLog::default(),
            locks: Vec::new(),
            r_bytelocks: Vec::new(),
            w_bytelocks: Vec::new(),
            allocs: AllocLog::default(),
            actions: ActionLog::default(),
            checkpoints: Vec::new(),
            restarts: RestartCounters::default(),
            consec_aborts: 0,
            pending: None,
        }
    }

    /// This transaction's descriptor slot.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Name of the dispatch the current attempt runs on.
    pub fn algorithm(&self) -> &'static str {
        self.alg.name()
    }

    /// Per-reason abort counters.
    pub fn restarts(&self) -> &RestartCounters {
        &self.restarts
    }

    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    /// Starts the outermost region: picks a dispatch, enters the serial
    /// lock on the appropriate side and runs the dispatch's begin.
    pub(crate) fn begin_outer(&mut self) {
        debug_assert_eq!(self.nesting, 0, "begin with an open region");

        let rt = runtime();
        let pending = self.pending.take().or_else(|| {
            self.props
                .contains(TxProps::DOES_GO_IRREVOCABLE)
                .then_some(AlgorithmId::SerialIrrevocable)
        });

        let choice = match pending {
            Some(id) => {
                debug_assert!(id.takes_write_lock());
                rt.serial.write_acquire();
                id
            }
            None => {
                rt.serial.read_acquire();
                let id = rt.published();
                if id.takes_write_lock() {
                    // the published dispatch itself is serial; trade sides
                    rt.serial.read_release();
                    rt.serial.write_acquire();
                }
                id
            }
        };

        if choice.takes_write_lock() {
            self.state.insert(TxState::SERIAL);
            if choice == AlgorithmId::SerialIrrevocable {
                self.state.insert(TxState::IRREVOCABLE);
            }
        }

        self.alg = choice;
        self.mode = BarrierMode::ReadOnly;
        self.nesting = 1;
        trace!("TX({}): begin on {}", self.id, choice.name());
        algorithm(choice).begin(self);
    }

    /// Commits the outermost region. On success the serial lock is
    /// released, commit handlers run in registration order and deferred
    /// frees are materialized.
    pub(crate) fn commit_outer(&mut self) -> Result<(), TxError> {
        debug_assert_eq!(self.nesting, 1, "commit with nested regions open");

        let alg = algorithm(self.alg);
        match self.mode {
            BarrierMode::ReadOnly => alg.commit_ro(self)?,
            BarrierMode::ReadWrite => alg.commit_rw(self)?,
        }

        self.release_serial_side();
        self.nesting = 0;
        self.state = TxState::empty();
        self.actions.run_commit();
        self.allocs.on_commit();
        self.checkpoints.clear();
        self.consec_aborts = 0;
        trace!("TX({}): committed", self.id);
        Ok(())
    }

    /// Unwinds an aborted attempt: abort handlers newest-first, dispatch
    /// rollback, allocation disposal, serial-lock release, counters, then
    /// the retry policy. The caller loops back into `begin_outer`, which is
    /// exactly the continuation contract: the next attempt observes a fresh
    /// begin with the policy's dispatch.
    pub(crate) fn handle_abort(&mut self, err: TxError) {
        let reason = match err {
            TxError::Conflict(reason) => Some(reason),
            TxError::Restart | TxError::Cancelled => None,
        };
        debug!("TX({}): rollback ({:?})", self.id, reason);

        self.actions.run_abort();
        self.consec_aborts = self.consec_aborts.saturating_add(1);

        algorithm(self.alg).rollback(self);
        self.allocs.on_abort();
        self.release_serial_side();

        self.state = TxState::empty();
        self.nesting = 0;
        self.checkpoints.clear();
        if let Some(reason) = reason {
            self.restarts.bump(reason);
        }
        policy::after_abort(self, reason);
    }

    fn release_serial_side(&mut self) {
        let rt = runtime();
        if self.state.contains(TxState::SERIAL) {
            rt.serial.write_release();
        } else {
            rt.serial.read_release();
        }
    }

    // ------------------------------------------------------------------
    // closed nesting
    // ------------------------------------------------------------------

    /// Runs `f` as a closed-nested region. A [`TxError::Cancelled`] from
    /// the region rolls the logs back to the checkpoint taken here and
    /// surfaces to the caller; conflicts propagate and restart the whole
    /// transaction. Locks acquired inside the region stay held until the
    /// outermost commit or rollback.
    pub fn nested<R>(
        &mut self,
        f: impl FnOnce(&mut Tx) -> Result<R, TxError>,
    ) -> Result<R, TxError> {
        debug_assert!(self.nesting >= 1, "nested region outside a transaction");

        self.checkpoints.push(Checkpoint {
            reads: self.reads.len(),
            writes: self.writes.len(),
            undo: self.undo.len(),
            allocs: self.allocs.len(),
            actions: self.actions.len(),
        });
        self.writes.set_barrier(self.writes.len());
        self.nesting += 1;

        match f(self) {
            Ok(value) => {
                // inner commit: merge into the enclosing region
                self.nesting -= 1;
                self.checkpoints.pop();
                self.restore_write_barrier();
                Ok(value)
            }
            Err(TxError::Cancelled) => {
                if self.state.contains(TxState::IRREVOCABLE) {
                    fatal("cancelled nested region inside an irrevocable transaction");
                }
                let mark = self.checkpoints.pop().expect("nesting checkpoint");
                self.undo.undo_to(mark.undo);
                self.writes.truncate(mark.writes);
                self.reads.truncate(mark.reads);
                self.actions.rollback_to(mark.actions);
                self.allocs.rollback_to(mark.allocs);
                self.nesting -= 1;
                self.restore_write_barrier();
                self.restarts.bump(RestartReason::ClosedNesting);
                trace!("TX({}): nested region cancelled", self.id);
                Err(TxError::Cancelled)
            }
            Err(other) => Err(other),
        }
    }

    fn restore_write_barrier(&mut self) {
        let barrier = self.checkpoints.last().map(|mark| mark.writes).unwrap_or(0);
        self.writes.set_barrier(barrier);
    }

    /// Aborts the innermost nested region; pair with [`Tx::nested`].
    pub fn cancel(&self) -> TxError {
        TxError::Cancelled
    }

    /// Aborts and restarts the whole transaction.
    pub fn restart(&self) -> TxError {
        TxError::Restart
    }

    /// Requests that the rest of this transaction run irrevocably. When the
    /// current dispatch cannot upgrade in place, the attempt restarts on
    /// the serial-irrevocable dispatch.
    pub fn become_irrevocable(&mut self) -> Result<(), TxError> {
        if self.state.contains(TxState::IRREVOCABLE) {
            return Ok(());
        }
        if algorithm(self.alg).irrevoc(self) {
            self.state.insert(TxState::IRREVOCABLE);
            // the upgrade drops the undo log, so every later rollback must
            // resolve to the irrevocable dispatch
            self.alg = AlgorithmId::SerialIrrevocable;
            Ok(())
        } else {
            Err(TxError::Conflict(RestartReason::SerialIrrevocable))
        }
    }

    // ------------------------------------------------------------------
    // barriers
    // ------------------------------------------------------------------

    /// Word-granularity read barrier.
    ///
    /// # Safety
    /// `addr` must be word-aligned and point to memory that stays valid for
    /// the duration of the transaction.
    pub unsafe fn read_word(&mut self, addr: *mut Word, mask: Word) -> Result<Word, TxError> {
        debug_assert!(self.nesting >= 1, "barrier outside a transaction");
        let alg = algorithm(self.alg);
        match self.mode {
            BarrierMode::ReadOnly => alg.read_ro(self, addr, mask),
            BarrierMode::ReadWrite => alg.read_rw(self, addr, mask),
        }
    }

    /// Word-granularity write barrier. Bits outside `mask` are unaffected.
    ///
    /// # Safety
    /// `addr` must be word-aligned and point to memory that stays valid for
    /// the duration of the transaction.
    pub unsafe fn write_word(
        &mut self,
        addr: *mut Word,
        val: Word,
        mask: Word,
    ) -> Result<(), TxError> {
        debug_assert!(self.nesting >= 1, "barrier outside a transaction");
        if self.props.contains(TxProps::READ_ONLY) {
            return Err(TxError::Conflict(RestartReason::NotReadOnly));
        }

        let alg = algorithm(self.alg);
        match self.mode {
            BarrierMode::ReadOnly => {
                alg.write_ro(self, addr, val, mask)?;
                self.mode = BarrierMode::ReadWrite;
                Ok(())
            }
            BarrierMode::ReadWrite => alg.write_rw(self, addr, val, mask),
        }
    }

    /// Typed read barrier for 1/2/4/8-byte values.
    ///
    /// # Safety
    /// `addr` must be aligned for `T` and point to memory that stays valid
    /// for the duration of the transaction.
    pub unsafe fn read<T: TmWord>(&mut self, addr: *const T) -> Result<T, TxError> {
        let (base, shift, mask) = word_of(addr);
        let word = self.read_word(base, mask)?;
        Ok(T::from_word((word & mask) >> shift))
    }

    /// Typed write barrier for 1/2/4/8-byte values.
    ///
    /// # Safety
    /// `addr` must be aligned for `T` and point to memory that stays valid
    /// for the duration of the transaction.
    pub unsafe fn write<T: TmWord>(&mut self, addr: *mut T, val: T) -> Result<(), TxError> {
        let (base, shift, mask) = word_of(addr as *const T);
        self.write_word(base, val.into_word() << shift, mask)
    }

    // ------------------------------------------------------------------
    // memory management and user actions
    // ------------------------------------------------------------------

    /// Allocates zeroed, word-aligned memory. The allocation is discarded
    /// if the transaction aborts.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        self.allocs.allocate(size)
    }

    /// Schedules `addr` for release when the transaction commits; on abort
    /// the memory is untouched.
    ///
    /// # Safety
    /// `addr` must have been allocated with size `size` through this
    /// runtime's allocation barriers, and must not be used after commit.
    pub unsafe fn dealloc(&mut self, addr: *mut u8, size: usize) {
        self.allocs.defer_free(addr, size);
    }

    /// Registers a handler to run after a successful commit, in
    /// registration order.
    pub fn on_commit(&mut self, callback: impl FnOnce() + Send + 'static) {
        self.actions.register(Box::new(callback), true);
    }

    /// Registers a handler to run on abort, newest-first, before rollback.
    pub fn on_abort(&mut self, callback: impl FnOnce() + Send + 'static) {
        self.actions.register(Box::new(callback), false);
    }
}

impl Drop for Tx {
    fn drop(&mut self) {
        runtime().release_slot(self.id);
    }
}

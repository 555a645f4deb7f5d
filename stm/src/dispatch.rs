// Copyright 2022-2023 polystm Contributors
// SPDX-License-Identifier: Apache-2.0

//! The dispatch layer: one capability table per algorithm, with the active
//! table published process-wide and swapped only inside a serial section.

use log::{info, warn};

use crate::algs;
use crate::config::DEFAULT_ALGORITHM;
use crate::errors::TxError;
use crate::registry::runtime;
use crate::tx::Tx;
use crate::types::Word;

/// The capability set every conflict-detection algorithm implements.
///
/// Barriers come in read-only and writing flavours; the lifecycle layer
/// selects between them from the descriptor's barrier mode and flips the
/// mode on the first write.
pub(crate) trait Algorithm: Sync {
    fn name(&self) -> &'static str;

    fn begin(&self, tx: &mut Tx);
    fn read_ro(&self, tx: &mut Tx, addr: *mut Word, mask: Word) -> Result<Word, TxError>;
    fn read_rw(&self, tx: &mut Tx, addr: *mut Word, mask: Word) -> Result<Word, TxError>;
    fn write_ro(&self, tx: &mut Tx, addr: *mut Word, val: Word, mask: Word)
        -> Result<(), TxError>;
    fn write_rw(&self, tx: &mut Tx, addr: *mut Word, val: Word, mask: Word)
        -> Result<(), TxError>;
    fn commit_ro(&self, tx: &mut Tx) -> Result<(), TxError>;
    fn commit_rw(&self, tx: &mut Tx) -> Result<(), TxError>;
    fn rollback(&self, tx: &mut Tx);

    /// In-flight upgrade to irrevocability; `false` means the caller must
    /// restart on the serial-irrevocable dispatch instead.
    fn irrevoc(&self, tx: &mut Tx) -> bool;

    /// Invoked while the runtime is quiescent, right after this table is
    /// published.
    fn on_switch(&self);

    fn privatization_safe(&self) -> bool {
        true
    }
}

/// Identifier of a registered dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgorithmId {
    /// Lazy-acquire orec algorithm with extensible timestamps.
    OrecEla,
    /// Eager-acquire byte-lock algorithm with requestor-wins remote abort.
    ByteEar,
    /// Serial execution under the write side of the serial lock, with undo.
    Serial,
    /// Serial execution with logging disabled; cannot roll back.
    SerialIrrevocable,
}

impl AlgorithmId {
    pub fn name(self) -> &'static str {
        match self {
            AlgorithmId::OrecEla => "OrecELA",
            AlgorithmId::ByteEar => "ByteEAR",
            AlgorithmId::Serial => "Serial",
            AlgorithmId::SerialIrrevocable => "SerialIrrevocable",
        }
    }

    /// Resolves an `STM_CONFIG` name, falling back to the default dispatch.
    pub(crate) fn parse(name: &str) -> Self {
        match name {
            "OrecELA" => AlgorithmId::OrecEla,
            "ByteEAR" => AlgorithmId::ByteEar,
            "Serial" => AlgorithmId::Serial,
            "SerialIrrevocable" => AlgorithmId::SerialIrrevocable,
            other => {
                warn!(
                    "unknown STM_CONFIG algorithm {:?}, using {}",
                    other, DEFAULT_ALGORITHM
                );
                AlgorithmId::OrecEla
            }
        }
    }

    pub(crate) fn to_usize(self) -> usize {
        match self {
            AlgorithmId::OrecEla => 0,
            AlgorithmId::ByteEar => 1,
            AlgorithmId::Serial => 2,
            AlgorithmId::SerialIrrevocable => 3,
        }
    }

    pub(crate) fn from_usize(raw: usize) -> Self {
        match raw {
            0 => AlgorithmId::OrecEla,
            1 => AlgorithmId::ByteEar,
            2 => AlgorithmId::Serial,
            _ => AlgorithmId::SerialIrrevocable,
        }
    }

    /// Serial-family dispatches own the whole runtime for their span.
    pub(crate) fn takes_write_lock(self) -> bool {
        matches!(self, AlgorithmId::Serial | AlgorithmId::SerialIrrevocable)
    }
}

/// The registered table for `id`.
#[inline]
pub(crate) fn algorithm(id: AlgorithmId) -> &'static dyn Algorithm {
    match id {
        AlgorithmId::OrecEla => &algs::OREC_ELA,
        AlgorithmId::ByteEar => &algs::BYTE_EAR,
        AlgorithmId::Serial => &algs::SERIAL,
        AlgorithmId::SerialIrrevocable => &algs::SERIAL_IRREVOCABLE,
    }
}

/// Publishes a new dispatch inside a serial section. In-flight transactions
/// have drained once the write side is held, so no attempt ever observes a
/// mixed table.
pub fn set_algorithm(to: AlgorithmId) {
    let rt = runtime();
    rt.serial.write_acquire();
    if rt.published() != to {
        rt.publish(to);
        algorithm(to).on_switch();
        info!("dispatch switched to {}", to.name());
    }
    rt.serial.write_release();
}

/// The currently published dispatch.
pub fn current_algorithm() -> AlgorithmId {
    runtime().published()
}

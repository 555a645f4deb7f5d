// Copyright 2022-2023 polystm Contributors
// SPDX-License-Identifier: Apache-2.0

//! The registered conflict-detection algorithms.

mod byte_ear;
mod orec_ela;
mod serial;

pub(crate) use byte_ear::ByteEar;
pub(crate) use orec_ela::OrecEla;
pub(crate) use serial::{Serial, SerialIrrevocable};

use crate::cm::{Backoff, HyperAggressive};

/// Lazy orec algorithm, requestor-wins arbitration at commit time only.
pub(crate) static OREC_ELA: OrecEla<HyperAggressive> = OrecEla::new();

/// Eager byte-lock algorithm; backoff keeps symmetric killers from
/// livelocking.
pub(crate) static BYTE_EAR: ByteEar<Backoff> = ByteEar::new();

pub(crate) static SERIAL: Serial = Serial;

pub(crate) static SERIAL_IRREVOCABLE: SerialIrrevocable = SerialIrrevocable;

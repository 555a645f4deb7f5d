// Copyright 2022-2023 polystm Contributors
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error as DeriveError;

/// Why a speculative attempt was torn down. Every algorithm categorizes its
/// aborts into exactly one reason; the retry policy reads the per-reason
/// counters to pick the next dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RestartReason {
    /// A log structure had to be rebuilt mid-flight.
    Reallocation,
    /// A read barrier gave up on a held location.
    LockedRead,
    /// A write barrier gave up on a held location.
    LockedWrite,
    /// In-flight read-set validation failed.
    ValidateRead,
    /// In-flight write-set validation failed.
    ValidateWrite,
    /// Commit-time acquisition or validation failed.
    ValidateCommit,
    /// The transaction must rerun on the serial-irrevocable dispatch.
    SerialIrrevocable,
    /// A read-only region issued a write.
    NotReadOnly,
    /// A closed-nested region rolled back to its checkpoint.
    ClosedNesting,
    /// The method group changed and the attempt had to re-begin.
    InitMethodGroup,
}

impl RestartReason {
    pub const COUNT: usize = 10;

    pub(crate) fn index(self) -> usize {
        match self {
            RestartReason::Reallocation => 0,
            RestartReason::LockedRead => 1,
            RestartReason::LockedWrite => 2,
            RestartReason::ValidateRead => 3,
            RestartReason::ValidateWrite => 4,
            RestartReason::ValidateCommit => 5,
            RestartReason::SerialIrrevocable => 6,
            RestartReason::NotReadOnly => 7,
            RestartReason::ClosedNesting => 8,
            RestartReason::InitMethodGroup => 9,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RestartReason::Reallocation => "reallocation",
            RestartReason::LockedRead => "locked-read",
            RestartReason::LockedWrite => "locked-write",
            RestartReason::ValidateRead => "validate-read",
            RestartReason::ValidateWrite => "validate-write",
            RestartReason::ValidateCommit => "validate-commit",
            RestartReason::SerialIrrevocable => "serial-irrevocable",
            RestartReason::NotReadOnly => "not-read-only",
            RestartReason::ClosedNesting => "closed-nesting",
            RestartReason::InitMethodGroup => "init-method-group",
        }
    }
}

/// Monotonic per-reason abort counters kept on the descriptor.
#[derive(Debug, Default)]
pub struct RestartCounters {
    counts: [u64; RestartReason::COUNT],
}

impl RestartCounters {
    pub(crate) fn bump(&mut self, reason: RestartReason) {
        self.counts[reason.index()] += 1;
    }

    pub fn get(&self, reason: RestartReason) -> u64 {
        self.counts[reason.index()]
    }

    pub(crate) fn validation_failures(&self) -> u64 {
        self.get(RestartReason::ValidateRead)
            + self.get(RestartReason::ValidateWrite)
            + self.get(RestartReason::ValidateCommit)
    }
}

/// Errors travelling out of a transaction closure. `Conflict` and `Restart`
/// are consumed by the retry loop and never reach application code;
/// `Cancelled` surfaces from [`crate::Tx::nested`] to the enclosing region.
#[derive(Debug, DeriveError)]
pub enum TxError {
    #[error("transaction conflict ({})", .0.name())]
    Conflict(RestartReason),

    #[error("transaction restart requested")]
    Restart,

    #[error("nested region cancelled")]
    Cancelled,
}

/// Integrity violations do not unwind; they diagnose and take the process
/// down, matching the runtime's no-partial-state guarantee.
pub(crate) fn fatal(msg: &str) -> ! {
    log::error!("fatal: {}", msg);
    eprintln!("polystm fatal: {}", msg);
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_bump() {
        let mut counters = RestartCounters::default();
        counters.bump(RestartReason::ValidateRead);
        counters.bump(RestartReason::ValidateCommit);
        counters.bump(RestartReason::ValidateCommit);

        assert_eq!(counters.get(RestartReason::ValidateRead), 1);
        assert_eq!(counters.get(RestartReason::ValidateCommit), 2);
        assert_eq!(counters.validation_failures(), 3);
        assert_eq!(counters.get(RestartReason::LockedRead), 0);
    }

    #[test]
    fn test_reason_names_are_stable() {
        assert_eq!(RestartReason::SerialIrrevocable.name(), "serial-irrevocable");
        assert_eq!(RestartReason::InitMethodGroup.index(), RestartReason::COUNT - 1);
    }
}

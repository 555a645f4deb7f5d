// Copyright 2022-2023 polystm Contributors
// SPDX-License-Identifier: Apache-2.0

//! Process-wide tuning knobs, sampled from the environment exactly once.

use lazy_static::lazy_static;
use log::warn;

use crate::registry::MAX_THREADS;

/// Default initial dispatch when `STM_CONFIG` is unset.
pub const DEFAULT_ALGORITHM: &str = "OrecELA";

/// Default base spin budget when `STM_SPIN_COUNT` is unset.
pub const DEFAULT_SPIN_COUNT: u32 = 32;

#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the initially published dispatch (`STM_CONFIG`).
    pub initial_algorithm: String,
    /// Cap on claimable descriptor slots (`STM_NUM_THREADS`).
    pub num_threads: usize,
    /// Base spin budget before a bounded wait becomes an abort
    /// (`STM_SPIN_COUNT`).
    pub spin_count: u32,
}

impl Config {
    fn from_env() -> Self {
        let initial_algorithm =
            std::env::var("STM_CONFIG").unwrap_or_else(|_| DEFAULT_ALGORITHM.to_string());

        let num_threads = match std::env::var("STM_NUM_THREADS") {
            Ok(raw) => match raw.parse::<usize>() {
                Ok(n) if n >= 1 => n.min(MAX_THREADS),
                _ => {
                    warn!("STM_NUM_THREADS={:?} is not a valid thread count", raw);
                    MAX_THREADS
                }
            },
            Err(_) => MAX_THREADS,
        };

        let spin_count = match std::env::var("STM_SPIN_COUNT") {
            Ok(raw) => match raw.parse::<u32>() {
                Ok(n) if n >= 1 => n,
                _ => {
                    warn!("STM_SPIN_COUNT={:?} is not a valid spin budget", raw);
                    DEFAULT_SPIN_COUNT
                }
            },
            Err(_) => DEFAULT_SPIN_COUNT,
        };

        Self {
            initial_algorithm,
            num_threads,
            spin_count,
        }
    }

    /// Spin budget for waiting out a held read location.
    pub(crate) fn read_budget(&self) -> u32 {
        self.spin_count
    }

    /// Spin budget for acquiring write ownership.
    pub(crate) fn acquire_budget(&self) -> u32 {
        self.spin_count * 4
    }

    /// Spin budget for waiting out an unwinding owner.
    pub(crate) fn drain_budget(&self) -> u32 {
        self.spin_count * 8
    }
}

lazy_static! {
    pub static ref CONFIG: Config = Config::from_env();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budgets_scale_from_spin_count() {
        let config = Config {
            initial_algorithm: DEFAULT_ALGORITHM.to_string(),
            num_threads: MAX_THREADS,
            spin_count: 32,
        };

        assert_eq!(config.read_budget(), 32);
        assert_eq!(config.acquire_budget(), 128);
        assert_eq!(config.drain_budget(), 256);
    }
}

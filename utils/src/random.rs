// Copyright 2022-2023 polystm Contributors
// SPDX-License-Identifier: Apache-2.0

use rand::distributions::{Distribution, Standard};

// Random value for `T`.
pub fn random<T>() -> T
where
    Standard: Distribution<T>,
{
    rand::random()
}

// Random bool.
pub fn coinflip() -> bool {
    random()
}

// Random usize in range 0..upper_bound (excluding the upper bound).
pub fn usize(upper_bound: usize) -> usize {
    random::<usize>() % upper_bound
}

// `count` random usizes below `upper_bound`.
pub fn usizes(count: usize, upper_bound: usize) -> Vec<usize> {
    (0..count).map(|_| usize(upper_bound)).collect()
}

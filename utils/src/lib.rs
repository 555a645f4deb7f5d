// Copyright 2022-2023 polystm Contributors
// SPDX-License-Identifier: Apache-2.0

//! Small helpers shared by the polystm test suites.

pub mod random;

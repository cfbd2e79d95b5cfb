// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core functionality for [forkrun](https://crates.io/crates/forkrun), a runner that executes
//! test classes in forked processes.
//!
//! The basic flow of a run is:
//!
//! 1. [`config`] loads the profile to use.
//! 2. [`discovery`] scans a classes directory for test classes, filtered by a
//!    [`TestListResolver`](forkrun_filtering::TestListResolver).
//! 3. [`run_order`] orders the classes, possibly using the run history in [`statistics`].
//! 4. [`fork`] starts forks, which speak the [`protocol`] over their standard streams.
//! 5. [`reporter`] prints events and the final [`result`].

pub mod channel;
pub mod config;
pub mod discovery;
pub mod errors;
pub mod fork;
pub mod protocol;
pub mod reporter;
pub mod result;
pub mod run_order;
pub mod statistics;
mod stopwatch;

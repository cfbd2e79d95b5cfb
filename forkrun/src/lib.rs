// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A test runner that executes test classes in forked processes.
//!
//! forkrun scans a directory of compiled test classes, orders them and hands them to child
//! processes ("forks") over a line-based protocol on their standard streams. The forks report
//! results back the same way.
//!
//! The library surface of this crate is not stable: use the `forkrun` binary, or
//! [forkrun-metadata](https://crates.io/crates/forkrun-metadata) to consume its JSON output.

#![warn(missing_docs)]

mod dispatch;
mod errors;
mod output;

#[doc(hidden)]
pub use dispatch::*;
#[doc(hidden)]
pub use errors::*;
#[doc(hidden)]
pub use output::{OutputContext, OutputWriter};

// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Machine-readable output and exit codes for forkrun.
//!
//! `forkrun list` and `forkrun run` both accept `--message-format json`. The types in this crate
//! describe that output, and [`ForkrunCommand`] runs the binary and parses it.

mod command;
mod errors;
mod exit_codes;
mod run_summary;

pub use command::*;
pub use errors::*;
pub use exit_codes::*;
pub use run_summary::*;

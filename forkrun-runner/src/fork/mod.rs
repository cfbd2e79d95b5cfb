// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Starting and supervising forked test processes.
//!
//! Each fork is a child process speaking the [protocol](crate::protocol): it reads commands from
//! its stdin and writes events to its stdout. For every fork, forkrun runs three threads: one
//! feeding queued commands to stdin, one decoding events from stdout and one collecting stderr.
//! A supervisor loop reacts to events, enforces the fork timeout and reports results back to
//! the thread driving the run.
//!
//! Forks are started by [`ForkStarter`] in one of two modes:
//!
//! * reusable forks ask for test classes with `next-test` until none remain;
//! * single-class forks are sent one class up front and exit after running it.

mod client;
mod command;
mod queue;
mod starter;
mod stub;

pub use client::{FailureKind, ForkOutcome, MISSING_GOODBYE_MESSAGE, TestFailure};
pub use command::ForkCommand;
pub use starter::{ForkConfiguration, ForkStarter, RunEvent, RunReport};
pub use stub::{StubBehavior, run_stub_fork};

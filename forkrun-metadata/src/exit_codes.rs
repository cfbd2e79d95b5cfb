// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

/// Documented exit codes for `forkrun` failures.
///
/// A `forkrun` invocation can fail for several reasons. Calling automation can use these codes
/// to tell a failing test run apart from a run that found nothing to do, and both of those apart
/// from infrastructure problems.
///
/// Unknown/unexpected failures will always result in exit code 1.
pub enum ForkrunExitCode {}

impl ForkrunExitCode {
    /// No errors occurred and forkrun exited normally.
    pub const OK: i32 = 0;

    /// No tests were selected to run, but no other errors occurred.
    pub const NO_TESTS_RUN: i32 = 4;

    /// One or more tests failed.
    pub const TEST_RUN_FAILED: i32 = 100;

    /// A forked process crashed, timed out, or its channel failed.
    pub const FORK_FAILED: i32 = 101;

    /// Writing data to stdout or stderr produced an error.
    pub const WRITE_OUTPUT_ERROR: i32 = 110;

    /// A user issue happened while setting up a forkrun invocation.
    pub const SETUP_ERROR: i32 = 96;

    /// A test include/exclude pattern failed to parse.
    pub const INVALID_TEST_PATTERN: i32 = 94;

    /// The run order list failed to parse.
    pub const INVALID_RUN_ORDER: i32 = 93;
}

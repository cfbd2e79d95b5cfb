// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Aggregated results of a test run.

use forkrun_metadata::{RunSummary, TestSetSummary};

/// Counts for a fork or a whole run.
///
/// Results from different forks are combined with [`aggregate`](Self::aggregate), which doesn't
/// depend on the order forks finish in.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(test, derive(test_strategy::Arbitrary))]
pub struct RunResult {
    /// The number of tests that completed, in any state.
    pub completed: u32,

    /// The number of tests that ended in an error.
    pub errors: u32,

    /// The number of tests that failed an assertion.
    pub failures: u32,

    /// The number of tests that were skipped, including assumption failures.
    pub skipped: u32,

    /// The number of tests that failed at first and passed on a rerun.
    pub flakes: u32,

    /// An infrastructure failure, if any.
    pub fork_failure: Option<String>,

    /// Whether a fork was killed because it exceeded its timeout.
    pub timed_out: bool,
}

impl RunResult {
    /// Combines two results.
    ///
    /// Counts are added up. If both results carry a fork failure, the lexicographically
    /// smaller message is kept.
    pub fn aggregate(&self, other: &RunResult) -> RunResult {
        let fork_failure = match (&self.fork_failure, &other.fork_failure) {
            (Some(a), Some(b)) => Some(a.min(b).clone()),
            (Some(a), None) | (None, Some(a)) => Some(a.clone()),
            (None, None) => None,
        };
        RunResult {
            completed: self.completed.saturating_add(other.completed),
            errors: self.errors.saturating_add(other.errors),
            failures: self.failures.saturating_add(other.failures),
            skipped: self.skipped.saturating_add(other.skipped),
            flakes: self.flakes.saturating_add(other.flakes),
            fork_failure,
            timed_out: self.timed_out || other.timed_out,
        }
    }

    /// Returns true if no test failed and every fork exited cleanly.
    pub fn is_success(&self) -> bool {
        self.errors == 0 && self.failures == 0 && !self.has_fork_failure()
    }

    /// Returns true if a fork crashed, broke the protocol or timed out.
    pub fn has_fork_failure(&self) -> bool {
        self.timed_out || self.fork_failure.is_some()
    }

    /// Returns true if no tests completed.
    pub fn is_no_tests(&self) -> bool {
        self.completed == 0
    }

    /// Converts this result into its machine-readable form.
    pub fn to_summary(&self, test_sets: Vec<TestSetSummary>) -> RunSummary {
        let mut summary = RunSummary::default();
        summary.completed = self.completed;
        summary.errors = self.errors;
        summary.failures = self.failures;
        summary.skipped = self.skipped;
        summary.flakes = self.flakes;
        summary.timed_out = self.timed_out;
        summary.fork_failure = self.fork_failure.clone();
        summary.test_sets = test_sets;
        summary
    }

    /// Returns the process exit code for this result.
    pub fn exit_code(&self) -> i32 {
        self.to_summary(Vec::new()).exit_code()
    }
}

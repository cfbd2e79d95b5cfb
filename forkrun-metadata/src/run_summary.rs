// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::ForkrunExitCode;
use serde::{Deserialize, Serialize};

/// Machine-readable output of `forkrun list --message-format json`.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub struct TestListSummary {
    /// The run order that was applied, in its canonical string form.
    pub run_order: String,

    /// The random seed in effect, if the run order is random.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub random_seed: Option<u64>,

    /// Fully qualified class names, in execution order.
    pub classes: Vec<String>,
}

impl TestListSummary {
    /// Creates a new list summary.
    pub fn new(run_order: impl Into<String>, random_seed: Option<u64>, classes: Vec<String>) -> Self {
        Self {
            run_order: run_order.into(),
            random_seed,
            classes,
        }
    }

    /// Parses this summary from a string.
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Machine-readable output of `forkrun run --message-format json`.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub struct RunSummary {
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

    /// Whether a fork was killed because it exceeded its timeout.
    pub timed_out: bool,

    /// The first infrastructure failure, if any: a crashed fork or a broken channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fork_failure: Option<String>,

    /// Per-class results, in completion order.
    #[serde(default)]
    pub test_sets: Vec<TestSetSummary>,
}

impl RunSummary {
    /// Parses this summary from a string.
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Returns the exit code forkrun reports for this summary.
    pub fn exit_code(&self) -> i32 {
        if self.timed_out || self.fork_failure.is_some() {
            ForkrunExitCode::FORK_FAILED
        } else if self.errors > 0 || self.failures > 0 {
            ForkrunExitCode::TEST_RUN_FAILED
        } else if self.completed == 0 {
            ForkrunExitCode::NO_TESTS_RUN
        } else {
            ForkrunExitCode::OK
        }
    }
}

/// Results for a single test class.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub struct TestSetSummary {
    /// The fully qualified class name.
    pub class_name: String,

    /// The fork that ran this class, starting from 1.
    pub fork_number: u32,

    /// Tests that passed.
    pub passed: u32,

    /// Tests that failed or errored.
    pub failed: u32,

    /// Tests that were skipped.
    pub skipped: u32,

    /// Elapsed time reported by the fork, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
}

impl TestSetSummary {
    /// Creates a new, empty summary for a class.
    pub fn new(class_name: impl Into<String>, fork_number: u32) -> Self {
        Self {
            class_name: class_name.into(),
            fork_number,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    // Textually scoped so that test_case-generated modules (which `use super::*`)
    // do not see an ambiguous glob-imported `assert_eq` alongside the prelude one.
    macro_rules! assert_eq {
        ($($tt:tt)*) => { pretty_assertions::assert_eq!($($tt)*) };
    }
    use test_case::test_case;

    #[test]
    fn run_summary_json_shape() {
        let summary = RunSummary {
            completed: 3,
            failures: 1,
            test_sets: vec![TestSetSummary {
                passed: 2,
                failed: 1,
                elapsed_ms: Some(15),
                ..TestSetSummary::new("pkg.ATest", 1)
            }],
            ..Default::default()
        };
        let json = serde_json::to_string(&summary).unwrap();
        assert_eq!(
            json,
            r#"{"completed":3,"errors":0,"failures":1,"skipped":0,"flakes":0,"timed-out":false,"test-sets":[{"class-name":"pkg.ATest","fork-number":1,"passed":2,"failed":1,"skipped":0,"elapsed-ms":15}]}"#
        );
        assert_eq!(RunSummary::parse(&json).unwrap(), summary);
    }

    #[test_case(0, 0, 0, false, false => ForkrunExitCode::NO_TESTS_RUN; "nothing ran")]
    #[test_case(2, 0, 0, false, false => ForkrunExitCode::OK; "all passed")]
    #[test_case(2, 1, 0, false, false => ForkrunExitCode::TEST_RUN_FAILED; "one error")]
    #[test_case(2, 0, 1, false, false => ForkrunExitCode::TEST_RUN_FAILED; "one failure")]
    #[test_case(2, 1, 0, true, false => ForkrunExitCode::FORK_FAILED; "timeout wins")]
    #[test_case(0, 0, 0, false, true => ForkrunExitCode::FORK_FAILED; "crash without tests")]
    fn exit_codes(completed: u32, errors: u32, failures: u32, timed_out: bool, crashed: bool) -> i32 {
        let summary = RunSummary {
            completed,
            errors,
            failures,
            timed_out,
            fork_failure: crashed.then(|| "fork 1 crashed".to_owned()),
            ..Default::default()
        };
        summary.exit_code()
    }
}

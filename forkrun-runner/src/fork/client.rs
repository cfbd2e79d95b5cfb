// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    protocol::{ConsoleLevel, Event, ReportEntry, ReportKind, RunMode, StackTrace, StandardStream},
    result::RunResult,
    statistics::{ClassMethod, extract_class_name},
};
use camino::Utf8PathBuf;
use forkrun_metadata::TestSetSummary;
use indexmap::IndexMap;
use std::{collections::VecDeque, process::ExitStatus, time::Duration};
use tracing::{debug, error, info, warn};

/// Reported when a fork exits without sending `bye`.
pub const MISSING_GOODBYE_MESSAGE: &str = "The forked VM terminated without saying properly \
    goodbye. VM crash or System.exit called?";

const STDERR_TAIL_LINES: usize = 20;

/// Whether a test failed an assertion or ended in an unexpected error.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FailureKind {
    /// The test failed an assertion.
    Failure,

    /// The test ended in an unexpected error.
    Error,
}

/// A test that failed or errored, with the output it produced.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestFailure {
    /// The fork the test ran in.
    pub fork_number: u32,

    /// The fully qualified class name.
    pub class_name: String,

    /// The method name, if known.
    pub method_name: Option<String>,

    /// How the test failed.
    pub kind: FailureKind,

    /// The failure message, if any.
    pub message: Option<String>,

    /// The stack trace, if any.
    pub stack_trace: Option<StackTrace>,

    /// Standard output written by the test.
    pub stdout: String,

    /// Standard error written by the test.
    pub stderr: String,
}

/// A single execution of a test, recorded in the run statistics.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct TestRecord {
    pub(crate) test: ClassMethod,
    pub(crate) run_time_ms: u32,
    pub(crate) passed: bool,
}

/// What the supervisor of a fork must do after an event.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum ClientAction {
    None,
    AcknowledgeBye,
    SendNextTest,
    StopOnNextTest,
    TestSetCompleted(TestSetSummary),
    TestFailed(TestFailure),
}

/// How a fork process ended.
#[derive(Debug, Default)]
pub(crate) struct ForkExit {
    pub(crate) status: Option<ExitStatus>,
    pub(crate) timed_out: Option<Duration>,
    pub(crate) stream_error: Option<String>,
    pub(crate) corrupted_lines: usize,
    pub(crate) dump_file: Option<Utf8PathBuf>,
}

/// The results of a single fork.
#[derive(Clone, Debug)]
pub struct ForkOutcome {
    /// The fork number, starting from 1.
    pub fork_number: u32,

    /// Counts for tests run in this fork, and the fork failure if any.
    pub result: RunResult,

    /// How the process exited, if it could be waited on.
    pub exit_status: Option<ExitStatus>,

    /// System properties reported by the fork.
    pub system_properties: IndexMap<String, String>,

    /// Lines the fork wrote to stdout outside of frames.
    pub corrupted_lines: usize,

    /// The dump file corrupted lines were written to, if dumping is enabled.
    pub dump_file: Option<Utf8PathBuf>,

    /// The last lines the fork wrote to stderr.
    pub stderr_tail: Vec<String>,

    pub(crate) records: Vec<TestRecord>,
}

/// Tracks the state of a fork from the events it sends.
#[derive(Debug)]
pub(crate) struct ForkClient {
    fork_number: u32,
    command: String,
    said_goodbye: bool,
    stop_requested: bool,
    exit_error: Option<StackTrace>,
    system_properties: IndexMap<String, String>,
    current_set: Option<TestSetSummary>,
    result: RunResult,
    records: Vec<TestRecord>,
    // Tests that failed in a normal run and may still pass on a rerun.
    pending_reruns: IndexMap<ClassMethod, FailureKind>,
    stdout: String,
    stderr: String,
    stderr_tail: VecDeque<String>,
}

impl ForkClient {
    pub(crate) fn new(fork_number: u32, command: impl Into<String>) -> Self {
        Self {
            fork_number,
            command: command.into(),
            said_goodbye: false,
            stop_requested: false,
            exit_error: None,
            system_properties: IndexMap::new(),
            current_set: None,
            result: RunResult::default(),
            records: Vec::new(),
            pending_reruns: IndexMap::new(),
            stdout: String::new(),
            stderr: String::new(),
            stderr_tail: VecDeque::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn said_goodbye(&self) -> bool {
        self.said_goodbye
    }

    pub(crate) fn handle_event(&mut self, event: Event) -> ClientAction {
        match event {
            Event::Bye => {
                self.said_goodbye = true;
                ClientAction::AcknowledgeBye
            }
            Event::StopOnNextTest => {
                if self.stop_requested {
                    ClientAction::None
                } else {
                    self.stop_requested = true;
                    ClientAction::StopOnNextTest
                }
            }
            Event::NextTest => ClientAction::SendNextTest,
            Event::Console { level, message } => {
                let message = message.unwrap_or_default();
                let fork_number = self.fork_number;
                match level {
                    ConsoleLevel::Debug => debug!("[fork {fork_number}] {message}"),
                    ConsoleLevel::Info => info!("[fork {fork_number}] {message}"),
                    ConsoleLevel::Warning => warn!("[fork {fork_number}] {message}"),
                }
                ClientAction::None
            }
            Event::ConsoleError(trace) => {
                error!("[fork {}] {}", self.fork_number, describe_trace(&trace));
                ClientAction::None
            }
            Event::JvmExitError(trace) => {
                error!(
                    "fork {} is exiting with an error: {}",
                    self.fork_number,
                    describe_trace(&trace)
                );
                self.exit_error = Some(trace);
                ClientAction::None
            }
            Event::Output {
                stream,
                new_line,
                data,
                ..
            } => {
                let buf = match stream {
                    StandardStream::Stdout => &mut self.stdout,
                    StandardStream::Stderr => &mut self.stderr,
                };
                buf.push_str(data.as_deref().unwrap_or_default());
                if new_line {
                    buf.push('\n');
                }
                ClientAction::None
            }
            Event::SystemProperty { key, value, .. } => {
                if let Some(key) = key {
                    self.system_properties
                        .insert(key, value.unwrap_or_default());
                }
                ClientAction::None
            }
            Event::Report { kind, entry } => self.handle_report(kind, entry),
        }
    }

    /// Records a line the fork wrote to its stderr outside of the protocol.
    pub(crate) fn stderr_line(&mut self, line: String) {
        debug!("[fork {} stderr] {line}", self.fork_number);
        if self.stderr_tail.len() == STDERR_TAIL_LINES {
            self.stderr_tail.pop_front();
        }
        self.stderr_tail.push_back(line);
    }

    fn handle_report(&mut self, kind: ReportKind, entry: ReportEntry) -> ClientAction {
        let rerun = entry.run_mode == RunMode::RerunTestAfterFailure;
        match kind {
            ReportKind::TestSetStarting => {
                let class_name = entry
                    .source
                    .as_deref()
                    .or(entry.name.as_deref())
                    .map(extract_class_name)
                    .unwrap_or_default();
                self.current_set = Some(TestSetSummary::new(class_name, self.fork_number));
                self.clear_output();
                ClientAction::None
            }
            ReportKind::TestSetCompleted => {
                let mut summary = self.current_set.take().unwrap_or_else(|| {
                    let class_name = entry.source.as_deref().unwrap_or_default();
                    TestSetSummary::new(extract_class_name(class_name), self.fork_number)
                });
                summary.elapsed_ms = entry.elapsed_ms.map(|ms| u64::try_from(ms).unwrap_or(0));
                ClientAction::TestSetCompleted(summary)
            }
            ReportKind::TestStarting => {
                self.clear_output();
                ClientAction::None
            }
            ReportKind::TestSucceeded => {
                let test = self.test_of(&entry);
                if rerun {
                    if let Some(kind) = self.pending_reruns.shift_remove(&test) {
                        match kind {
                            FailureKind::Failure => self.result.failures -= 1,
                            FailureKind::Error => self.result.errors -= 1,
                        }
                        self.result.flakes += 1;
                        if let Some(set) = &mut self.current_set {
                            set.failed = set.failed.saturating_sub(1);
                            set.passed += 1;
                        }
                    }
                } else {
                    self.result.completed += 1;
                    if let Some(set) = &mut self.current_set {
                        set.passed += 1;
                    }
                }
                self.record(test, &entry, true);
                ClientAction::None
            }
            ReportKind::TestFailed | ReportKind::TestError => {
                let kind = if kind == ReportKind::TestFailed {
                    FailureKind::Failure
                } else {
                    FailureKind::Error
                };
                let test = self.test_of(&entry);
                self.record(test.clone(), &entry, false);
                if rerun {
                    return ClientAction::None;
                }

                self.result.completed += 1;
                match kind {
                    FailureKind::Failure => self.result.failures += 1,
                    FailureKind::Error => self.result.errors += 1,
                }
                if let Some(set) = &mut self.current_set {
                    set.failed += 1;
                }
                self.pending_reruns.insert(test.clone(), kind);

                let stack_trace = entry.stack_trace;
                let message = entry.message.or_else(|| {
                    stack_trace
                        .as_ref()
                        .and_then(|trace| trace.message.clone())
                });
                ClientAction::TestFailed(TestFailure {
                    fork_number: self.fork_number,
                    class_name: test.class_name,
                    method_name: test.method_name,
                    kind,
                    message,
                    stack_trace,
                    stdout: std::mem::take(&mut self.stdout),
                    stderr: std::mem::take(&mut self.stderr),
                })
            }
            ReportKind::TestSkipped | ReportKind::TestAssumptionFailure => {
                if !rerun {
                    self.result.completed += 1;
                    self.result.skipped += 1;
                    if let Some(set) = &mut self.current_set {
                        set.skipped += 1;
                    }
                }
                ClientAction::None
            }
        }
    }

    fn test_of(&self, entry: &ReportEntry) -> ClassMethod {
        let class_name = match (&entry.source, &self.current_set) {
            (Some(source), _) => extract_class_name(source).to_owned(),
            (None, Some(set)) => set.class_name.clone(),
            (None, None) => String::new(),
        };
        ClassMethod::new(class_name, entry.name.clone())
    }

    fn record(&mut self, test: ClassMethod, entry: &ReportEntry, passed: bool) {
        let run_time_ms = entry
            .elapsed_ms
            .map_or(0, |ms| u32::try_from(ms).unwrap_or(0));
        self.records.push(TestRecord {
            test,
            run_time_ms,
            passed,
        });
    }

    fn clear_output(&mut self) {
        self.stdout.clear();
        self.stderr.clear();
    }

    /// Consumes the client once the fork has exited.
    pub(crate) fn finish(self, exit: ForkExit) -> ForkOutcome {
        let mut result = self.result;
        let fork_number = self.fork_number;
        let status = exit
            .status
            .map_or_else(|| "unknown".to_owned(), |status| status.to_string());

        let fork_failure = if let Some(timeout) = exit.timed_out {
            result.timed_out = true;
            Some(format!(
                "fork {fork_number} was killed after timing out ({}s)",
                timeout.as_secs_f64()
            ))
        } else if let Some(trace) = &self.exit_error {
            Some(format!(
                "fork {fork_number} exited with an error: {}",
                describe_trace(trace)
            ))
        } else if !self.said_goodbye {
            Some(format!(
                "{MISSING_GOODBYE_MESSAGE}\nCommand was: {}\nExit status: {status}",
                self.command
            ))
        } else if let Some(error) = exit.stream_error {
            Some(format!(
                "error reading events from fork {fork_number}: {error}"
            ))
        } else if exit.status.is_some_and(|status| !status.success()) {
            Some(format!(
                "fork {fork_number} exited with {status} after saying goodbye"
            ))
        } else {
            None
        };
        result.fork_failure = fork_failure;

        ForkOutcome {
            fork_number,
            result,
            exit_status: exit.status,
            system_properties: self.system_properties,
            corrupted_lines: exit.corrupted_lines,
            dump_file: exit.dump_file,
            stderr_tail: self.stderr_tail.into(),
            records: self.records,
        }
    }
}

fn describe_trace(trace: &StackTrace) -> String {
    let message = trace.message.as_deref().unwrap_or("(no message)");
    match trace.smart_trimmed.as_deref().or(trace.stack_trace.as_deref()) {
        Some(stack) => format!("{message}\n{stack}"),
        None => message.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn report(kind: ReportKind, source: &str, name: Option<&str>) -> Event {
        Event::Report {
            kind,
            entry: ReportEntry {
                source: Some(source.to_owned()),
                name: name.map(ToOwned::to_owned),
                elapsed_ms: Some(12),
                ..Default::default()
            },
        }
    }

    fn rerun(kind: ReportKind, source: &str, name: &str) -> Event {
        Event::Report {
            kind,
            entry: ReportEntry {
                run_mode: RunMode::RerunTestAfterFailure,
                source: Some(source.to_owned()),
                name: Some(name.to_owned()),
                ..Default::default()
            },
        }
    }

    fn output(data: &str) -> Event {
        Event::Output {
            stream: StandardStream::Stdout,
            new_line: true,
            run_mode: RunMode::NormalRun,
            test_run_id: None,
            data: Some(data.to_owned()),
        }
    }

    #[test]
    fn lifecycle() {
        let mut client = ForkClient::new(1, "runner");
        assert_eq!(client.handle_event(Event::NextTest), ClientAction::SendNextTest);
        client.handle_event(report(ReportKind::TestSetStarting, "a.OneTest", None));
        client.handle_event(report(ReportKind::TestStarting, "a.OneTest", Some("passes")));
        client.handle_event(report(ReportKind::TestSucceeded, "a.OneTest", Some("passes")));
        client.handle_event(report(ReportKind::TestStarting, "a.OneTest", Some("fails")));
        client.handle_event(output("some output"));

        let action = client.handle_event(report(ReportKind::TestFailed, "a.OneTest", Some("fails")));
        let ClientAction::TestFailed(failure) = action else {
            panic!("expected a failure, got {action:?}");
        };
        assert_eq!(failure.class_name, "a.OneTest");
        assert_eq!(failure.method_name.as_deref(), Some("fails"));
        assert_eq!(failure.kind, FailureKind::Failure);
        assert_eq!(failure.stdout, "some output\n");

        client.handle_event(report(ReportKind::TestSkipped, "a.OneTest", Some("skipped")));
        let action = client.handle_event(report(ReportKind::TestSetCompleted, "a.OneTest", None));
        let ClientAction::TestSetCompleted(summary) = action else {
            panic!("expected a completed test set, got {action:?}");
        };
        assert_eq!(summary.class_name, "a.OneTest");
        assert_eq!((summary.passed, summary.failed, summary.skipped), (1, 1, 1));
        assert_eq!(summary.elapsed_ms, Some(12));

        assert_eq!(client.handle_event(Event::Bye), ClientAction::AcknowledgeBye);
        assert!(client.said_goodbye());

        let outcome = client.finish(ForkExit::default());
        assert_eq!(
            outcome.result,
            RunResult {
                completed: 3,
                failures: 1,
                skipped: 1,
                ..Default::default()
            }
        );
        assert_eq!(outcome.records.len(), 2);
        assert!(outcome.records[0].passed);
        assert!(!outcome.records[1].passed);
    }

    #[test]
    fn passing_rerun_is_a_flake() {
        let mut client = ForkClient::new(1, "runner");
        client.handle_event(report(ReportKind::TestSetStarting, "a.OneTest", None));
        client.handle_event(report(ReportKind::TestError, "a.OneTest", Some("flaky")));
        client.handle_event(report(ReportKind::TestFailed, "a.OneTest", Some("broken")));
        assert_eq!(
            client.handle_event(rerun(ReportKind::TestSucceeded, "a.OneTest", "flaky")),
            ClientAction::None
        );
        assert_eq!(
            client.handle_event(rerun(ReportKind::TestFailed, "a.OneTest", "broken")),
            ClientAction::None
        );
        client.handle_event(Event::Bye);

        let outcome = client.finish(ForkExit::default());
        assert_eq!(
            outcome.result,
            RunResult {
                completed: 2,
                failures: 1,
                flakes: 1,
                ..Default::default()
            }
        );
    }

    #[test]
    fn stop_on_next_test_is_requested_once() {
        let mut client = ForkClient::new(2, "runner");
        assert_eq!(
            client.handle_event(Event::StopOnNextTest),
            ClientAction::StopOnNextTest
        );
        assert_eq!(client.handle_event(Event::StopOnNextTest), ClientAction::None);
    }

    #[test]
    fn system_properties() {
        let mut client = ForkClient::new(1, "runner");
        client.handle_event(Event::SystemProperty {
            run_mode: RunMode::NormalRun,
            test_run_id: None,
            key: Some("java.version".to_owned()),
            value: Some("21".to_owned()),
        });
        client.handle_event(Event::Bye);
        let outcome = client.finish(ForkExit::default());
        assert_eq!(
            outcome.system_properties.get("java.version").map(String::as_str),
            Some("21")
        );
    }

    #[test]
    fn missing_goodbye() {
        let mut client = ForkClient::new(3, "runner --crash");
        client.stderr_line("Exception in thread main".to_owned());
        let outcome = client.finish(ForkExit::default());
        let failure = outcome.result.fork_failure.expect("fork failure recorded");
        assert!(failure.starts_with(MISSING_GOODBYE_MESSAGE), "{failure}");
        assert!(failure.contains("runner --crash"), "{failure}");
        assert_eq!(outcome.stderr_tail, vec!["Exception in thread main"]);
    }

    #[test]
    fn timeout_takes_precedence() {
        let client = ForkClient::new(1, "runner");
        let outcome = client.finish(ForkExit {
            timed_out: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        assert!(outcome.result.timed_out);
        assert_eq!(
            outcome.result.fork_failure.as_deref(),
            Some("fork 1 was killed after timing out (5s)")
        );
    }

    #[test]
    fn exit_error() {
        let mut client = ForkClient::new(1, "runner");
        client.handle_event(Event::JvmExitError(StackTrace {
            message: Some("out of memory".to_owned()),
            ..Default::default()
        }));
        client.handle_event(Event::Bye);
        let outcome = client.finish(ForkExit::default());
        assert_eq!(
            outcome.result.fork_failure.as_deref(),
            Some("fork 1 exited with an error: out of memory")
        );
    }
}

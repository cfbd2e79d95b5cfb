// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;

/// Distinguishes a normal test run from a rerun of a failed test.
#[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
pub enum RunMode {
    /// A normal run.
    #[default]
    NormalRun,

    /// A rerun of a test that failed earlier in this run.
    RerunTestAfterFailure,
}

impl RunMode {
    /// Returns the name written on the wire.
    pub fn name(self) -> &'static str {
        match self {
            Self::NormalRun => "normal-run",
            Self::RerunTestAfterFailure => "rerun-test-after-failure",
        }
    }

    pub(crate) fn from_name(name: &[u8]) -> Option<Self> {
        [Self::NormalRun, Self::RerunTestAfterFailure]
            .into_iter()
            .find(|mode| mode.name().as_bytes() == name)
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A 64-bit identifier for a test: the upper 32 bits identify the source (class), and the lower
/// 32 bits identify the name (method). Zero in either half means that half is absent.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TestRunId(u64);

impl TestRunId {
    /// Creates an identifier from its raw value.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Creates an identifier from a source id and a name id.
    pub fn new(source_id: Option<u32>, name_id: Option<u32>) -> Self {
        let source = u64::from(source_id.unwrap_or(0));
        let name = u64::from(name_id.unwrap_or(0));
        Self((source << 32) | name)
    }

    /// Returns the raw value.
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Returns the source id, if present.
    pub fn source_id(self) -> Option<u32> {
        let source = (self.0 >> 32) as u32;
        (source != 0).then_some(source)
    }

    /// Returns the name id, if present.
    pub fn name_id(self) -> Option<u32> {
        let name = self.0 as u32;
        (name != 0).then_some(name)
    }
}

impl fmt::Display for TestRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// How a fork should shut down.
#[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
pub enum Shutdown {
    /// Finish the current work, then exit normally.
    #[default]
    Default,

    /// Exit as soon as possible.
    Exit,

    /// Halt immediately.
    Kill,
}

impl Shutdown {
    /// Returns the parameter written on the wire.
    pub fn param(self) -> &'static str {
        match self {
            Self::Default => "DEFAULT",
            Self::Exit => "EXIT",
            Self::Kill => "KILL",
        }
    }

    /// Parses a wire parameter. Unknown values map to [`Shutdown::Default`].
    pub fn from_param(param: &str) -> Self {
        match param {
            "EXIT" => Self::Exit,
            "KILL" => Self::Kill,
            _ => Self::Default,
        }
    }
}

/// A command sent from the controller to a fork.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    /// Run the given test class.
    RunClass(String),

    /// No more classes will be sent.
    TestSetFinished,

    /// Skip all tests from the next one onwards.
    SkipSinceNextTest,

    /// Shut down.
    Shutdown(Shutdown),

    /// Do nothing. Used to wake up the fork.
    Noop,

    /// Acknowledges the fork's goodbye. The fork may exit after receiving this.
    ByeAck,
}

impl Command {
    /// Returns the opcode written on the wire.
    pub fn opcode(&self) -> &'static str {
        match self {
            Self::RunClass(_) => "run-testclass",
            Self::TestSetFinished => "testset-finished",
            Self::SkipSinceNextTest => "skip-since-next-test",
            Self::Shutdown(_) => "shutdown",
            Self::Noop => "noop",
            Self::ByeAck => "bye-ack",
        }
    }
}

/// The opcode of an event sent from a fork to the controller.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum EventType {
    /// `bye`
    Bye,
    /// `stop-on-next-test`
    StopOnNextTest,
    /// `next-test`
    NextTest,
    /// `console-info-log`
    ConsoleInfoLog,
    /// `console-debug-log`
    ConsoleDebugLog,
    /// `console-warning-log`
    ConsoleWarningLog,
    /// `console-error-log`
    ConsoleErrorLog,
    /// `jvm-exit-error`
    JvmExitError,
    /// `std-out-stream`
    StdOutStream,
    /// `std-out-stream-new-line`
    StdOutStreamNewLine,
    /// `std-err-stream`
    StdErrStream,
    /// `std-err-stream-new-line`
    StdErrStreamNewLine,
    /// `sys-prop`
    SystemProperty,
    /// `testset-starting`
    TestSetStarting,
    /// `testset-completed`
    TestSetCompleted,
    /// `test-starting`
    TestStarting,
    /// `test-succeeded`
    TestSucceeded,
    /// `test-failed`
    TestFailed,
    /// `test-skipped`
    TestSkipped,
    /// `test-error`
    TestError,
    /// `test-assumption-failure`
    TestAssumptionFailure,
}

impl EventType {
    /// All event types.
    pub const ALL: &'static [Self] = &[
        Self::Bye,
        Self::StopOnNextTest,
        Self::NextTest,
        Self::ConsoleInfoLog,
        Self::ConsoleDebugLog,
        Self::ConsoleWarningLog,
        Self::ConsoleErrorLog,
        Self::JvmExitError,
        Self::StdOutStream,
        Self::StdOutStreamNewLine,
        Self::StdErrStream,
        Self::StdErrStreamNewLine,
        Self::SystemProperty,
        Self::TestSetStarting,
        Self::TestSetCompleted,
        Self::TestStarting,
        Self::TestSucceeded,
        Self::TestFailed,
        Self::TestSkipped,
        Self::TestError,
        Self::TestAssumptionFailure,
    ];

    /// Returns the opcode written on the wire.
    pub fn opcode(self) -> &'static str {
        match self {
            Self::Bye => "bye",
            Self::StopOnNextTest => "stop-on-next-test",
            Self::NextTest => "next-test",
            Self::ConsoleInfoLog => "console-info-log",
            Self::ConsoleDebugLog => "console-debug-log",
            Self::ConsoleWarningLog => "console-warning-log",
            Self::ConsoleErrorLog => "console-error-log",
            Self::JvmExitError => "jvm-exit-error",
            Self::StdOutStream => "std-out-stream",
            Self::StdOutStreamNewLine => "std-out-stream-new-line",
            Self::StdErrStream => "std-err-stream",
            Self::StdErrStreamNewLine => "std-err-stream-new-line",
            Self::SystemProperty => "sys-prop",
            Self::TestSetStarting => "testset-starting",
            Self::TestSetCompleted => "testset-completed",
            Self::TestStarting => "test-starting",
            Self::TestSucceeded => "test-succeeded",
            Self::TestFailed => "test-failed",
            Self::TestSkipped => "test-skipped",
            Self::TestError => "test-error",
            Self::TestAssumptionFailure => "test-assumption-failure",
        }
    }

    pub(crate) fn from_opcode(opcode: &[u8]) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|event_type| event_type.opcode().as_bytes() == opcode)
    }

    /// Returns the kind of report this event carries, if it is a test lifecycle event.
    pub fn report_kind(self) -> Option<ReportKind> {
        let kind = match self {
            Self::TestSetStarting => ReportKind::TestSetStarting,
            Self::TestSetCompleted => ReportKind::TestSetCompleted,
            Self::TestStarting => ReportKind::TestStarting,
            Self::TestSucceeded => ReportKind::TestSucceeded,
            Self::TestFailed => ReportKind::TestFailed,
            Self::TestSkipped => ReportKind::TestSkipped,
            Self::TestError => ReportKind::TestError,
            Self::TestAssumptionFailure => ReportKind::TestAssumptionFailure,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.opcode())
    }
}

/// The test lifecycle stage a [`ReportEntry`] describes.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum ReportKind {
    /// A test class is about to run.
    TestSetStarting,
    /// A test class has finished.
    TestSetCompleted,
    /// A test is about to run.
    TestStarting,
    /// A test passed.
    TestSucceeded,
    /// A test failed an assertion.
    TestFailed,
    /// A test was skipped.
    TestSkipped,
    /// A test ended with an unexpected error.
    TestError,
    /// A test's assumptions did not hold, so it was skipped.
    TestAssumptionFailure,
}

impl ReportKind {
    /// Returns the corresponding event type.
    pub fn event_type(self) -> EventType {
        match self {
            Self::TestSetStarting => EventType::TestSetStarting,
            Self::TestSetCompleted => EventType::TestSetCompleted,
            Self::TestStarting => EventType::TestStarting,
            Self::TestSucceeded => EventType::TestSucceeded,
            Self::TestFailed => EventType::TestFailed,
            Self::TestSkipped => EventType::TestSkipped,
            Self::TestError => EventType::TestError,
            Self::TestAssumptionFailure => EventType::TestAssumptionFailure,
        }
    }
}

/// The level of a console log event.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum ConsoleLevel {
    /// `console-debug-log`
    Debug,
    /// `console-info-log`
    Info,
    /// `console-warning-log`
    Warning,
}

/// Which standard stream an output event was written to.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum StandardStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// A stack trace, in three forms. Any of them may be absent.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StackTrace {
    /// The exception message.
    pub message: Option<String>,

    /// A trimmed stack trace, pointing at the test.
    pub smart_trimmed: Option<String>,

    /// The full stack trace.
    pub stack_trace: Option<String>,
}

impl StackTrace {
    /// Returns a stack trace, or `None` if all three parts are absent.
    pub fn from_parts(
        message: Option<String>,
        smart_trimmed: Option<String>,
        stack_trace: Option<String>,
    ) -> Option<Self> {
        if message.is_none() && smart_trimmed.is_none() && stack_trace.is_none() {
            None
        } else {
            Some(Self {
                message,
                smart_trimmed,
                stack_trace,
            })
        }
    }
}

/// Information about a test or test class, carried by test lifecycle events.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReportEntry {
    /// The run mode.
    pub run_mode: RunMode,

    /// The test run id, if any.
    pub test_run_id: Option<TestRunId>,

    /// The source: usually a fully qualified class name.
    pub source: Option<String>,

    /// A human readable form of the source.
    pub source_text: Option<String>,

    /// The name: usually a method name.
    pub name: Option<String>,

    /// A human readable form of the name.
    pub name_text: Option<String>,

    /// The test group.
    pub group: Option<String>,

    /// A message, e.g. the reason a test was skipped.
    pub message: Option<String>,

    /// Elapsed time in milliseconds.
    pub elapsed_ms: Option<i32>,

    /// The stack trace of a failure or error.
    pub stack_trace: Option<StackTrace>,
}

/// An event sent from a fork to the controller.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Event {
    /// The fork is about to exit.
    Bye,

    /// The fork wants remaining tests to be skipped in all forks.
    StopOnNextTest,

    /// The fork is ready for another test class.
    NextTest,

    /// A log message from the fork's test framework.
    Console {
        /// The level.
        level: ConsoleLevel,
        /// The message.
        message: Option<String>,
    },

    /// An error logged by the fork's test framework.
    ConsoleError(StackTrace),

    /// The fork hit a fatal error and is about to exit.
    JvmExitError(StackTrace),

    /// Output written by a test.
    Output {
        /// The stream written to.
        stream: StandardStream,
        /// Whether the output ended with a new line.
        new_line: bool,
        /// The run mode.
        run_mode: RunMode,
        /// The test run id, if any.
        test_run_id: Option<TestRunId>,
        /// The output.
        data: Option<String>,
    },

    /// A system property in the fork.
    SystemProperty {
        /// The run mode.
        run_mode: RunMode,
        /// The test run id, if any.
        test_run_id: Option<TestRunId>,
        /// The property key.
        key: Option<String>,
        /// The property value.
        value: Option<String>,
    },

    /// A test lifecycle event.
    Report {
        /// The lifecycle stage.
        kind: ReportKind,
        /// Information about the test.
        entry: ReportEntry,
    },
}

impl Event {
    /// Returns the opcode of this event.
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Bye => EventType::Bye,
            Self::StopOnNextTest => EventType::StopOnNextTest,
            Self::NextTest => EventType::NextTest,
            Self::Console { level, .. } => match level {
                ConsoleLevel::Debug => EventType::ConsoleDebugLog,
                ConsoleLevel::Info => EventType::ConsoleInfoLog,
                ConsoleLevel::Warning => EventType::ConsoleWarningLog,
            },
            Self::ConsoleError(_) => EventType::ConsoleErrorLog,
            Self::JvmExitError(_) => EventType::JvmExitError,
            Self::Output {
                stream, new_line, ..
            } => match (stream, new_line) {
                (StandardStream::Stdout, false) => EventType::StdOutStream,
                (StandardStream::Stdout, true) => EventType::StdOutStreamNewLine,
                (StandardStream::Stderr, false) => EventType::StdErrStream,
                (StandardStream::Stderr, true) => EventType::StdErrStreamNewLine,
            },
            Self::SystemProperty { .. } => EventType::SystemProperty,
            Self::Report { kind, .. } => kind.event_type(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_halves() {
        let id = TestRunId::new(Some(3), Some(7));
        assert_eq!(id.raw(), (3 << 32) | 7);
        assert_eq!(id.source_id(), Some(3));
        assert_eq!(id.name_id(), Some(7));

        let class_only = TestRunId::new(Some(3), None);
        assert_eq!(class_only.name_id(), None);
        assert_eq!(TestRunId::from_raw(7).source_id(), None);
        assert_eq!(TestRunId::from_raw(7).name_id(), Some(7));
    }

    #[test]
    fn opcodes_are_unique() {
        for (i, a) in EventType::ALL.iter().enumerate() {
            assert_eq!(EventType::from_opcode(a.opcode().as_bytes()), Some(*a));
            for b in &EventType::ALL[i + 1..] {
                assert_ne!(a.opcode(), b.opcode());
            }
        }
    }

    #[test]
    fn shutdown_params() {
        for shutdown in [Shutdown::Default, Shutdown::Exit, Shutdown::Kill] {
            assert_eq!(Shutdown::from_param(shutdown.param()), shutdown);
        }
        assert_eq!(Shutdown::from_param("bogus"), Shutdown::Default);
    }
}

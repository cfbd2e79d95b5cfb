// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A fork that fakes running tests, for exercising forkrun without a real test framework.
//!
//! Every test class has two test methods, `testOne` and `testTwo`. What they do depends on
//! markers in the class's simple name, see [`StubBehavior`].

use crate::{
    errors::ChannelError,
    protocol::{
        Command, CommandDecoder, ConsoleLevel, DumpStream, Event, EventEncoder, ReportEntry,
        ReportKind, RunMode, StackTrace, StandardStream,
    },
};
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use std::{
    cell::RefCell,
    collections::VecDeque,
    io::{self, Read, Write},
    rc::Rc,
    time::Duration,
};

const TEST_METHODS: [&str; 2] = ["testOne", "testTwo"];
const BYE_ACK_TIMEOUT: Duration = Duration::from_secs(30);
const HANG_DURATION: Duration = Duration::from_secs(600);

/// What a stub fork does with a test class.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StubBehavior {
    /// Both tests pass.
    Pass,

    /// `testTwo` fails an assertion. Marker: `Failing`.
    Fail,

    /// `testTwo` throws an unexpected exception. Marker: `Error`.
    Error,

    /// Both tests are skipped. Marker: `Skipped`.
    Skip,

    /// `testTwo` fails, then passes when rerun. Marker: `Flaky`.
    Flaky,

    /// After `testOne`, the fork asks for remaining tests to be skipped. Marker: `Stop`.
    Stop,

    /// The fork writes junk to stdout outside of frames. Marker: `Noisy`.
    Noisy,

    /// The fork exits in the middle of the class without saying goodbye. Marker: `Crash`.
    Crash,

    /// The fork stops responding. Marker: `Hang`.
    Hang,
}

impl StubBehavior {
    const MARKERS: &'static [(&'static str, Self)] = &[
        ("Crash", Self::Crash),
        ("Hang", Self::Hang),
        ("Failing", Self::Fail),
        ("Error", Self::Error),
        ("Skipped", Self::Skip),
        ("Flaky", Self::Flaky),
        ("Stop", Self::Stop),
        ("Noisy", Self::Noisy),
    ];

    /// Returns the behavior for a fully qualified class name.
    pub fn for_class(class_name: &str) -> Self {
        let simple_name = class_name.rsplit('.').next().unwrap_or(class_name);
        Self::MARKERS
            .iter()
            .find(|(marker, _)| simple_name.contains(marker))
            .map_or(Self::Pass, |&(_, behavior)| behavior)
    }
}

/// Runs a stub fork, reading commands from `input` and writing events to `output`.
///
/// Returns the exit code the process should exit with.
pub fn run_stub_fork<R, W>(input: R, output: W, fork_number: u32) -> Result<i32, ChannelError>
where
    R: Read + Send + 'static,
    W: Write,
{
    let (sender, receiver) = crossbeam_channel::unbounded();
    // This thread exits once stdin is closed, so it is never joined.
    std::thread::spawn(move || {
        let mut decoder = CommandDecoder::new(input, fork_number, DumpStream::disabled());
        loop {
            match decoder.decode() {
                Ok(Some(command)) => {
                    if sender.send(command).is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(_) => break,
            }
        }
    });

    let output = SharedOutput::new(output);
    let mut stub = StubFork {
        encoder: EventEncoder::new(output.clone()),
        raw: output,
        commands: receiver,
        pending: VecDeque::new(),
        skipping: false,
    };
    stub.run(fork_number)
}

/// Lets the stub write raw bytes to the same stream as its encoder.
#[derive(Debug)]
struct SharedOutput<W>(Rc<RefCell<W>>);

impl<W> SharedOutput<W> {
    fn new(writer: W) -> Self {
        Self(Rc::new(RefCell::new(writer)))
    }
}

impl<W> Clone for SharedOutput<W> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<W: Write> Write for SharedOutput<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.borrow_mut().flush()
    }
}

struct StubFork<W: Write> {
    encoder: EventEncoder<SharedOutput<W>>,
    raw: SharedOutput<W>,
    commands: Receiver<Command>,
    pending: VecDeque<Command>,
    skipping: bool,
}

enum ClassOutcome {
    Finished,
    Crashed,
}

impl<W: Write> StubFork<W> {
    fn run(&mut self, fork_number: u32) -> Result<i32, ChannelError> {
        self.encoder.send(&Event::SystemProperty {
            run_mode: RunMode::NormalRun,
            test_run_id: None,
            key: Some("forkrun.fork.number".to_owned()),
            value: Some(fork_number.to_string()),
        })?;

        loop {
            self.encoder.send(&Event::NextTest)?;
            match self.next_command() {
                Some(Command::RunClass(class)) => {
                    if let ClassOutcome::Crashed = self.run_class(&class)? {
                        return Ok(1);
                    }
                }
                Some(Command::TestSetFinished | Command::Shutdown(_)) | None => break,
                Some(_) => {}
            }
        }

        self.encoder.send(&Event::Bye)?;
        while !self.pending.contains(&Command::ByeAck) {
            match self.commands.recv_timeout(BYE_ACK_TIMEOUT) {
                Ok(Command::ByeAck) => break,
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => break,
            }
        }
        Ok(0)
    }

    /// Waits for the next command, recording skip requests along the way.
    fn next_command(&mut self) -> Option<Command> {
        loop {
            let command = match self.pending.pop_front() {
                Some(command) => command,
                None => self.commands.recv().ok()?,
            };
            match command {
                Command::SkipSinceNextTest => self.skipping = true,
                Command::Noop | Command::ByeAck => {}
                other => return Some(other),
            }
        }
    }

    /// Picks up skip requests that arrived while running tests.
    fn poll_commands(&mut self) {
        loop {
            match self.commands.try_recv() {
                Ok(Command::SkipSinceNextTest) => self.skipping = true,
                Ok(command) => self.pending.push_back(command),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
    }

    fn run_class(&mut self, class: &str) -> Result<ClassOutcome, ChannelError> {
        let behavior = StubBehavior::for_class(class);
        self.send_console(format!("running {class} as {behavior:?}"))?;
        self.report(ReportKind::TestSetStarting, class, None, |_| {})?;

        match behavior {
            StubBehavior::Crash => {
                eprintln!("Exception in thread \"main\" java.lang.OutOfMemoryError: {class}");
                return Ok(ClassOutcome::Crashed);
            }
            StubBehavior::Hang => {
                std::thread::sleep(HANG_DURATION);
            }
            _ => {}
        }

        for method in TEST_METHODS {
            self.poll_commands();
            if self.skipping {
                self.report(ReportKind::TestSkipped, class, Some(method), |entry| {
                    entry.message = Some("skipped after a stop request".to_owned());
                })?;
                continue;
            }

            self.report(ReportKind::TestStarting, class, Some(method), |_| {})?;
            self.encoder.send(&Event::Output {
                stream: StandardStream::Stdout,
                new_line: true,
                run_mode: RunMode::NormalRun,
                test_run_id: None,
                data: Some(format!("running {class}.{method}")),
            })?;
            if behavior == StubBehavior::Noisy {
                self.encoder.flush()?;
                // Errors surface on the next frame written.
                let _ = writeln!(self.raw, "junk written by {class}.{method}");
            }

            let second = method == TEST_METHODS[1];
            match behavior {
                StubBehavior::Fail | StubBehavior::Flaky if second => {
                    self.report(ReportKind::TestFailed, class, Some(method), |entry| {
                        entry.stack_trace = Some(StackTrace {
                            message: Some("expected:<1> but was:<2>".to_owned()),
                            smart_trimmed: Some(format!("{class}.{method}:42 expected")),
                            stack_trace: None,
                        });
                    })?;
                    if behavior == StubBehavior::Flaky {
                        self.report(ReportKind::TestSucceeded, class, Some(method), |entry| {
                            entry.run_mode = RunMode::RerunTestAfterFailure;
                        })?;
                    }
                }
                StubBehavior::Error if second => {
                    self.report(ReportKind::TestError, class, Some(method), |entry| {
                        entry.stack_trace = Some(StackTrace {
                            message: Some("java.lang.IllegalStateException: boom".to_owned()),
                            smart_trimmed: None,
                            stack_trace: Some(format!("\tat {class}.{method}({class}.java:7)")),
                        });
                    })?;
                }
                StubBehavior::Skip => {
                    self.report(ReportKind::TestSkipped, class, Some(method), |entry| {
                        entry.message = Some("ignored".to_owned());
                    })?;
                }
                _ => {
                    self.report(ReportKind::TestSucceeded, class, Some(method), |_| {})?;
                }
            }

            if behavior == StubBehavior::Stop && !second {
                self.encoder.send(&Event::StopOnNextTest)?;
            }
        }

        self.report(ReportKind::TestSetCompleted, class, None, |entry| {
            entry.elapsed_ms = Some(2);
        })?;
        Ok(ClassOutcome::Finished)
    }

    fn report(
        &mut self,
        kind: ReportKind,
        class: &str,
        method: Option<&str>,
        customize: impl FnOnce(&mut ReportEntry),
    ) -> Result<(), ChannelError> {
        let mut entry = ReportEntry {
            source: Some(class.to_owned()),
            name: method.map(ToOwned::to_owned),
            elapsed_ms: method.map(|_| 1),
            ..Default::default()
        };
        customize(&mut entry);
        self.encoder.send(&Event::Report { kind, entry })
    }

    fn send_console(&mut self, message: String) -> Result<(), ChannelError> {
        self.encoder.send(&Event::Console {
            level: ConsoleLevel::Debug,
            message: Some(message),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CommandEncoder, EventDecoder};
    // Textually scoped so that test_case-generated modules (which `use super::*`)
    // do not see an ambiguous glob-imported `assert_eq` alongside the prelude one.
    macro_rules! assert_eq {
        ($($tt:tt)*) => { pretty_assertions::assert_eq!($($tt)*) };
    }
    use test_case::test_case;

    #[test_case("org.example.AppTest" => StubBehavior::Pass; "no marker")]
    #[test_case("org.example.FailingTest" => StubBehavior::Fail; "failing")]
    #[test_case("org.example.CrashOnFailingTest" => StubBehavior::Crash; "first marker wins")]
    #[test_case("org.Hang.AppTest" => StubBehavior::Pass; "package is ignored")]
    fn behavior(class_name: &str) -> StubBehavior {
        StubBehavior::for_class(class_name)
    }

    fn commands(commands: &[Command]) -> Vec<u8> {
        let mut encoder = CommandEncoder::new(Vec::new());
        for command in commands {
            encoder.send(command).expect("writing to a Vec succeeds");
        }
        encoder.into_inner().expect("writing to a Vec succeeds")
    }

    fn events(output: Vec<u8>) -> Vec<Event> {
        let mut decoder = EventDecoder::new(&output[..], 1, DumpStream::disabled());
        let mut events = Vec::new();
        loop {
            match decoder.decode() {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(error) => {
                    assert!(error.is_eof(), "unexpected error: {error}");
                    break;
                }
            }
        }
        assert_eq!(decoder.corrupted_lines(), 0);
        events
    }

    #[test]
    fn runs_classes_until_test_set_finished() {
        let input = commands(&[
            Command::RunClass("a.OneTest".to_owned()),
            Command::RunClass("a.FailingTest".to_owned()),
            Command::TestSetFinished,
            Command::ByeAck,
        ]);
        let mut output = Vec::new();
        let code = run_stub_fork(io::Cursor::new(input), &mut output, 1).expect("stub ran");
        assert_eq!(code, 0);

        let events = events(output);
        let next_tests = events.iter().filter(|e| **e == Event::NextTest).count();
        assert_eq!(next_tests, 3);
        assert_eq!(events.last(), Some(&Event::Bye));

        let kinds: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                Event::Report {
                    kind: kind @ (ReportKind::TestSucceeded | ReportKind::TestFailed),
                    entry,
                } => Some((*kind, entry.source.clone().unwrap_or_default())),
                _ => None,
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                (ReportKind::TestSucceeded, "a.OneTest".to_owned()),
                (ReportKind::TestSucceeded, "a.OneTest".to_owned()),
                (ReportKind::TestSucceeded, "a.FailingTest".to_owned()),
                (ReportKind::TestFailed, "a.FailingTest".to_owned()),
            ]
        );
    }

    #[test]
    fn skip_since_next_test() {
        let input = commands(&[
            Command::SkipSinceNextTest,
            Command::RunClass("a.OneTest".to_owned()),
            Command::TestSetFinished,
        ]);
        let mut output = Vec::new();
        run_stub_fork(io::Cursor::new(input), &mut output, 1).expect("stub ran");

        let skipped = events(output)
            .into_iter()
            .filter(|event| {
                matches!(
                    event,
                    Event::Report {
                        kind: ReportKind::TestSkipped,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(skipped, 2);
    }

    #[test]
    fn crash_exits_without_goodbye() {
        let input = commands(&[Command::RunClass("a.CrashTest".to_owned())]);
        let mut output = Vec::new();
        let code = run_stub_fork(io::Cursor::new(input), &mut output, 1).expect("stub ran");
        assert_eq!(code, 1);
        assert!(!events(output).contains(&Event::Bye));
    }
}

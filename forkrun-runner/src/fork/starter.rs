// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    client::{ClientAction, ForkClient, ForkExit, ForkOutcome, TestFailure},
    command::ForkCommand,
    queue::{CommandQueue, TestQueue},
};
use crate::{
    config::ForkrunProfile,
    errors::{DecodeError, ForkError},
    protocol::{Command, DebugSink, DumpStream, Event, EventDecoder},
    result::RunResult,
    run_order::TestsToRun,
    statistics::RunEntryStatisticsMap,
    stopwatch::stopwatch,
};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Local};
use crossbeam_channel::Sender;
use forkrun_metadata::{RunSummary, TestSetSummary};
use std::{
    io::{BufRead, BufReader, Write},
    process::{ChildStderr, ChildStdout},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

/// How long to wait for a killed fork's output to be closed.
const LEAK_TIMEOUT: Duration = Duration::from_millis(200);

/// Settings for starting and supervising forks.
#[derive(Clone, Debug)]
pub struct ForkConfiguration {
    /// The command that starts a fork.
    pub command: ForkCommand,

    /// The maximum number of forks running at once.
    pub fork_count: usize,

    /// If true, each fork runs test classes until none remain. Otherwise every class gets a
    /// fresh fork.
    pub reuse_forks: bool,

    /// Forks running longer than this are killed.
    pub timeout: Option<Duration>,

    /// Once this many tests have failed, remaining tests are skipped.
    pub skip_after_failure_count: Option<usize>,

    /// The directory dump files are written to.
    pub dump_dir: Option<Utf8PathBuf>,

    /// If set, every byte read from forks is copied to this file, suffixed with the fork number.
    pub debug_stream_file: Option<Utf8PathBuf>,

    /// The run statistics file to update after the run.
    pub statistics_file: Option<Utf8PathBuf>,
}

impl ForkConfiguration {
    /// Creates a configuration running a single reusable fork, without a timeout.
    pub fn new(command: ForkCommand) -> Self {
        Self {
            command,
            fork_count: 1,
            reuse_forks: true,
            timeout: None,
            skip_after_failure_count: None,
            dump_dir: None,
            debug_stream_file: None,
            statistics_file: None,
        }
    }

    /// Creates a configuration from a profile.
    pub fn from_profile(profile: &ForkrunProfile<'_>, command: ForkCommand) -> Self {
        Self {
            command,
            fork_count: profile.fork_count().compute(),
            reuse_forks: profile.reuse_forks(),
            timeout: profile.forked_process_timeout(),
            skip_after_failure_count: profile.skip_after_failure_count(),
            dump_dir: Some(profile.dump_dir()),
            debug_stream_file: profile.debug_stream_file(),
            statistics_file: Some(profile.statistics_file()),
        }
    }
}

/// An event produced while forks run.
#[derive(Debug)]
#[non_exhaustive]
pub enum RunEvent<'a> {
    /// The run is starting.
    RunStarted {
        /// The number of test classes to run.
        test_count: usize,

        /// The number of forks that will run at once.
        fork_count: usize,
    },

    /// A fork process was started.
    ForkStarted {
        /// The fork number, starting from 1.
        fork_number: u32,

        /// The command line.
        command: &'a str,
    },

    /// A test class finished.
    TestSetFinished(&'a TestSetSummary),

    /// A test failed or errored.
    TestFailed(&'a TestFailure),

    /// Remaining tests will be skipped.
    SkippingRemaining {
        /// Why tests are being skipped.
        reason: &'a str,
    },

    /// A fork process exited.
    ForkFinished(&'a ForkOutcome),
}

/// The results of a run.
#[derive(Clone, Debug)]
pub struct RunReport {
    /// Aggregated counts over all forks.
    pub result: RunResult,

    /// Per-class results, in completion order.
    pub test_sets: Vec<TestSetSummary>,

    /// Failed and errored tests, in completion order.
    pub failures: Vec<TestFailure>,

    /// Per-fork outcomes, in the order forks exited.
    pub forks: Vec<ForkOutcome>,

    /// The number of test classes that were never started because remaining tests were
    /// skipped.
    pub unstarted_classes: usize,

    /// When the run started.
    pub start_time: DateTime<Local>,

    /// How long the run took.
    pub elapsed: Duration,
}

impl RunReport {
    /// Returns the machine-readable summary of this run.
    pub fn to_summary(&self) -> RunSummary {
        self.result.to_summary(self.test_sets.clone())
    }
}

/// Starts forks, hands them test classes and collects their results.
#[derive(Clone, Debug)]
pub struct ForkStarter {
    config: ForkConfiguration,
}

impl ForkStarter {
    /// Creates a new starter.
    pub fn new(config: ForkConfiguration) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ForkConfiguration {
        &self.config
    }

    /// Runs the given test classes, in order, and returns the results.
    ///
    /// `callback` is called on the current thread for every [`RunEvent`]. Test failures and
    /// crashed forks are reported through the returned [`RunReport`]: an error is only returned
    /// if a fork could not be started at all.
    pub fn run<F>(&self, tests: TestsToRun, mut callback: F) -> Result<RunReport, ForkError>
    where
        F: FnMut(RunEvent<'_>),
    {
        let stopwatch = stopwatch();
        let run_start = stopwatch.start_time();
        let test_count = tests.len();
        let fork_count = self.config.fork_count.max(1).min(test_count);

        let test_queue = TestQueue::new(tests);
        let shared = SharedState::new(self.config.skip_after_failure_count);
        let (sender, receiver) = crossbeam_channel::unbounded::<ForkMessage>();

        callback(RunEvent::RunStarted {
            test_count,
            fork_count,
        });

        let mut report = RunReport {
            result: RunResult::default(),
            test_sets: Vec::new(),
            failures: Vec::new(),
            forks: Vec::new(),
            unstarted_classes: 0,
            start_time: run_start,
            elapsed: Duration::ZERO,
        };
        let mut first_error = None;

        std::thread::scope(|scope| {
            for fork_number in (1..=fork_count).map(|n| u32::try_from(n).unwrap_or(u32::MAX)) {
                let sender = sender.clone();
                let worker = Worker {
                    config: &self.config,
                    run_start,
                    test_queue: &test_queue,
                    shared: &shared,
                };
                let spawned = std::thread::Builder::new()
                    .name(format!("forkrun-fork-{fork_number}"))
                    .spawn_scoped(scope, move || worker.run(fork_number, &sender));
                if let Err(error) = spawned {
                    first_error.get_or_insert(ForkError::SpawnThread { fork_number, error });
                    shared.skip_all();
                    break;
                }
            }
            // Drop the original sender so the loop below ends once every worker is done.
            drop(sender);

            for message in receiver.iter() {
                match message {
                    ForkMessage::Started {
                        fork_number,
                        command,
                    } => callback(RunEvent::ForkStarted {
                        fork_number,
                        command: &command,
                    }),
                    ForkMessage::TestSetFinished(summary) => {
                        callback(RunEvent::TestSetFinished(&summary));
                        report.test_sets.push(summary);
                    }
                    ForkMessage::TestFailed(failure) => {
                        callback(RunEvent::TestFailed(&failure));
                        report.failures.push(failure);
                    }
                    ForkMessage::Skipping(reason) => {
                        callback(RunEvent::SkippingRemaining { reason: &reason });
                    }
                    ForkMessage::Finished(outcome) => {
                        report.result = report.result.aggregate(&outcome.result);
                        callback(RunEvent::ForkFinished(&outcome));
                        report.forks.push(*outcome);
                    }
                    ForkMessage::Error(error) => {
                        first_error.get_or_insert(error);
                    }
                }
            }
        });

        report.unstarted_classes = test_queue.clear();
        report.elapsed = stopwatch.snapshot().duration;
        if let Some(error) = first_error {
            return Err(error);
        }

        if let Some(path) = &self.config.statistics_file {
            update_statistics(path, &report.forks);
        }
        Ok(report)
    }
}

fn update_statistics(path: &Utf8Path, forks: &[ForkOutcome]) {
    let mut statistics = RunEntryStatisticsMap::from_file(path).unwrap_or_else(|error| {
        warn!("discarding unreadable run statistics: {error}");
        RunEntryStatisticsMap::new()
    });
    for record in forks.iter().flat_map(|fork| &fork.records) {
        if record.passed {
            statistics.record_success(record.test.clone(), record.run_time_ms);
        } else {
            statistics.record_failure(record.test.clone(), record.run_time_ms);
        }
    }
    if let Err(error) = statistics.serialize(path) {
        warn!("{error}");
    }
}

/// Sent from fork workers to the thread driving the run.
#[derive(Debug)]
enum ForkMessage {
    Started { fork_number: u32, command: String },
    TestSetFinished(TestSetSummary),
    TestFailed(TestFailure),
    Skipping(String),
    Finished(Box<ForkOutcome>),
    Error(ForkError),
}

/// Sent from the reader threads of a fork to its supervisor.
#[derive(Debug)]
enum ForkInput {
    Event(Event),
    Stderr(String),
    EventsClosed {
        error: Option<String>,
        corrupted_lines: usize,
    },
}

/// State shared by every fork in a run.
#[derive(Debug)]
struct SharedState {
    skipping: AtomicBool,
    failure_count: AtomicUsize,
    skip_after_failure_count: Option<usize>,
    queues: Mutex<Vec<Arc<CommandQueue>>>,
}

impl SharedState {
    fn new(skip_after_failure_count: Option<usize>) -> Self {
        Self {
            skipping: AtomicBool::new(false),
            failure_count: AtomicUsize::new(0),
            skip_after_failure_count,
            queues: Mutex::new(Vec::new()),
        }
    }

    fn register(&self, queue: &Arc<CommandQueue>) {
        let mut queues = self.lock();
        if self.is_skipping() {
            queue.push(Command::SkipSinceNextTest);
        }
        queues.push(queue.clone());
    }

    fn unregister(&self, queue: &Arc<CommandQueue>) {
        self.lock().retain(|q| !Arc::ptr_eq(q, queue));
    }

    fn is_skipping(&self) -> bool {
        self.skipping.load(Ordering::SeqCst)
    }

    /// Asks every running fork to skip remaining tests. Returns true the first time.
    fn skip_all(&self) -> bool {
        if self.skipping.swap(true, Ordering::SeqCst) {
            return false;
        }
        for queue in self.lock().iter() {
            queue.push(Command::SkipSinceNextTest);
        }
        true
    }

    /// Counts a failure. Returns true once the failure limit is reached.
    fn record_failure(&self) -> bool {
        let count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.skip_after_failure_count
            .is_some_and(|limit| count >= limit)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<CommandQueue>>> {
        self.queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Which test classes a fork runs.
#[derive(Debug)]
enum ForkMode<'a> {
    /// The fork runs one class and exits.
    SingleClass(String),

    /// The fork asks for classes until the queue is empty.
    Reuse(&'a TestQueue),
}

/// Runs forks on a single thread, one at a time.
#[derive(Clone, Copy, Debug)]
struct Worker<'a> {
    config: &'a ForkConfiguration,
    run_start: DateTime<Local>,
    test_queue: &'a TestQueue,
    shared: &'a SharedState,
}

impl Worker<'_> {
    fn run(self, fork_number: u32, sender: &Sender<ForkMessage>) {
        let res = if self.config.reuse_forks {
            self.run_fork(fork_number, ForkMode::Reuse(self.test_queue), sender)
        } else {
            self.run_single_class_forks(fork_number, sender)
        };
        if let Err(error) = res {
            self.skip_remaining(sender, format!("{error}"));
            let _ = sender.send(ForkMessage::Error(error));
        }
    }

    fn run_single_class_forks(
        self,
        fork_number: u32,
        sender: &Sender<ForkMessage>,
    ) -> Result<(), ForkError> {
        while !self.shared.is_skipping() {
            let Some(class) = self.test_queue.next_class() else {
                break;
            };
            self.run_fork(fork_number, ForkMode::SingleClass(class), sender)?;
        }
        Ok(())
    }

    fn run_fork(
        self,
        fork_number: u32,
        mode: ForkMode<'_>,
        sender: &Sender<ForkMessage>,
    ) -> Result<(), ForkError> {
        let command_line = self.config.command.display_for(fork_number);
        let mut child = self
            .config
            .command
            .to_command(fork_number)
            .spawn()
            .map_err(|error| ForkError::Spawn {
                fork_number,
                command: command_line.clone(),
                error,
            })?;
        debug!("started fork {fork_number} (pid {}): {command_line}", child.id());
        let _ = sender.send(ForkMessage::Started {
            fork_number,
            command: command_line.clone(),
        });

        let stdin = child.stdin.take().expect("stdin is piped");
        let stdout = child.stdout.take().expect("stdout is piped");
        let stderr = child.stderr.take().expect("stderr is piped");

        let queue = Arc::new(CommandQueue::new());
        if let ForkMode::SingleClass(class) = &mode {
            queue.push(Command::RunClass(class.clone()));
            queue.push(Command::TestSetFinished);
        }
        self.shared.register(&queue);

        let dump = DumpStream::new(self.config.dump_dir.as_deref(), self.run_start, fork_number);
        let mut exit = ForkExit {
            dump_file: dump.path().map(ToOwned::to_owned),
            ..Default::default()
        };
        let mut decoder = EventDecoder::new(stdout, fork_number, dump);
        if let Some(path) = &self.config.debug_stream_file {
            let path = debug_stream_path(path, fork_number);
            match DebugSink::create(&path) {
                Ok(sink) => decoder = decoder.with_debug_sink(sink),
                Err(error) => warn!("failed to create debug stream file {path}: {error}"),
            }
        }

        let mut client = ForkClient::new(fork_number, command_line);
        let (input_sender, input_receiver) = crossbeam_channel::unbounded();

        // These threads are not scoped: a fork's own children can keep its pipes open after the
        // fork is killed, and the readers are then left behind.
        let io_threads = [
            spawn_io_thread("input", fork_number, {
                let queue = Arc::clone(&queue);
                move || feed_commands(fork_number, stdin, &queue)
            }),
            spawn_io_thread("events", fork_number, {
                let sender = input_sender.clone();
                move || read_events(decoder, &sender)
            }),
            spawn_io_thread("stderr", fork_number, move || read_stderr(stderr, &input_sender)),
        ];
        let io_threads = match io_threads.into_iter().collect::<Result<Vec<_>, _>>() {
            Ok(handles) => handles,
            Err(error) => {
                queue.close();
                self.shared.unregister(&queue);
                let _ = child.kill();
                let _ = child.wait();
                return Err(ForkError::SpawnThread { fork_number, error });
            }
        };

        let deadline = self.config.timeout.map(|timeout| Instant::now() + timeout);
        let mut leak_deadline = None;
        let mut leaked = false;
        loop {
            let timeout = match (leak_deadline, deadline) {
                (Some(at), _) | (None, Some(at)) => crossbeam_channel::at(at),
                (None, None) => crossbeam_channel::never(),
            };
            crossbeam_channel::select! {
                recv(input_receiver) -> input => {
                    match input {
                        Ok(ForkInput::Event(event)) => {
                            let action = client.handle_event(event);
                            self.dispatch(action, fork_number, &mode, &queue, sender);
                        }
                        Ok(ForkInput::Stderr(line)) => client.stderr_line(line),
                        Ok(ForkInput::EventsClosed { error, corrupted_lines }) => {
                            exit.stream_error = error;
                            exit.corrupted_lines = corrupted_lines;
                        }
                        // Both reader threads have exited.
                        Err(_) => break,
                    }
                }
                recv(timeout) -> _ => {
                    if leak_deadline.is_some() {
                        warn!(
                            "fork {fork_number} was killed, but its output is still open after \
                             {}ms: not waiting for it",
                            LEAK_TIMEOUT.as_millis()
                        );
                        leaked = true;
                        break;
                    }
                    warn!("fork {fork_number} timed out, killing it");
                    exit.timed_out = self.config.timeout;
                    if let Err(error) = child.kill() {
                        warn!("failed to kill fork {fork_number}: {error}");
                    }
                    queue.close();
                    leak_deadline = Some(Instant::now() + LEAK_TIMEOUT);
                }
            }
        }
        queue.close();
        if !leaked {
            for handle in io_threads {
                let _ = handle.join();
            }
        }

        self.shared.unregister(&queue);
        exit.status = match child.wait() {
            Ok(status) => Some(status),
            Err(error) => {
                warn!("failed to wait for fork {fork_number}: {error}");
                None
            }
        };
        let outcome = client.finish(exit);
        debug!(
            "fork {fork_number} finished: {:?}",
            outcome.exit_status
        );
        let _ = sender.send(ForkMessage::Finished(Box::new(outcome)));
        Ok(())
    }

    fn dispatch(
        self,
        action: ClientAction,
        fork_number: u32,
        mode: &ForkMode<'_>,
        queue: &CommandQueue,
        sender: &Sender<ForkMessage>,
    ) {
        match action {
            ClientAction::None => {}
            ClientAction::AcknowledgeBye => {
                queue.push(Command::ByeAck);
            }
            ClientAction::SendNextTest => {
                // Single-class forks already have their commands queued.
                if let ForkMode::Reuse(test_queue) = mode {
                    let next = if self.shared.is_skipping() {
                        None
                    } else {
                        test_queue.next_class()
                    };
                    match next {
                        Some(class) => {
                            debug!("fork {fork_number}: running {class}");
                            queue.push(Command::RunClass(class));
                        }
                        None => {
                            queue.push(Command::TestSetFinished);
                        }
                    }
                }
            }
            ClientAction::StopOnNextTest => {
                self.skip_remaining(
                    sender,
                    format!("fork {fork_number} asked to stop on the next test"),
                );
            }
            ClientAction::TestSetCompleted(summary) => {
                let _ = sender.send(ForkMessage::TestSetFinished(summary));
            }
            ClientAction::TestFailed(failure) => {
                let _ = sender.send(ForkMessage::TestFailed(failure));
                if self.shared.record_failure() {
                    let limit = self.config.skip_after_failure_count.unwrap_or_default();
                    self.skip_remaining(
                        sender,
                        format!("{limit} tests failed, skipping remaining tests"),
                    );
                }
            }
        }
    }

    fn skip_remaining(self, sender: &Sender<ForkMessage>, reason: String) {
        if self.shared.skip_all() {
            let _ = sender.send(ForkMessage::Skipping(reason));
        }
    }
}

fn debug_stream_path(path: &Utf8Path, fork_number: u32) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{path}.{fork_number}"))
}

fn spawn_io_thread(
    name: &str,
    fork_number: u32,
    f: impl FnOnce() + Send + 'static,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("forkrun-fork-{fork_number}-{name}"))
        .spawn(f)
}

fn feed_commands(fork_number: u32, stdin: impl Write, queue: &CommandQueue) {
    let mut encoder = crate::protocol::CommandEncoder::new(stdin);
    while let Some(command) = queue.next_command() {
        if let Err(error) = encoder.send(&command) {
            // The fork has exited or closed its stdin. Events will tell us why.
            debug!("fork {fork_number}: failed to send {}: {error}", command.opcode());
            break;
        }
    }
    let _ = encoder.close();
}

fn read_events(mut decoder: EventDecoder<ChildStdout>, sender: &Sender<ForkInput>) {
    let error = loop {
        match decoder.decode() {
            Ok(Some(event)) => {
                let _ = sender.send(ForkInput::Event(event));
            }
            Ok(None) => {}
            Err(DecodeError::Eof) => break None,
            Err(error) => {
                let message = match std::error::Error::source(&error) {
                    Some(source) => format!("{error}: {source}"),
                    None => error.to_string(),
                };
                break Some(message);
            }
        }
    };
    let _ = sender.send(ForkInput::EventsClosed {
        error,
        corrupted_lines: decoder.corrupted_lines(),
    });
}

fn read_stderr(stderr: ChildStderr, sender: &Sender<ForkInput>) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end_matches(['\n', '\r']);
                let _ = sender.send(ForkInput::Stderr(text.to_owned()));
            }
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {}
            Err(error) => {
                debug!("error reading fork stderr: {error}");
                break;
            }
        }
    }
}

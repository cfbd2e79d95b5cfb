// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Prints the progress and results of test runs and test lists.
//!
//! The main structure in this module is [`Reporter`], which is built with a [`ReporterBuilder`].
//! In the human format, events are printed as they arrive. In the JSON format, a single
//! machine-readable summary from [`forkrun_metadata`] is printed at the end.

use crate::{
    errors::{MessageFormatParseError, WriteEventError},
    fork::{FailureKind, ForkOutcome, RunEvent, RunReport, TestFailure},
};
use forkrun_metadata::{TestListSummary, TestSetSummary};
use owo_colors::{OwoColorize, Style};
use std::{fmt, io::Write, str::FromStr, time::Duration};

/// The format of reporter output.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum MessageFormat {
    /// Human-readable output, printed as tests run.
    #[default]
    Human,

    /// A single JSON document, printed at the end.
    Json,
}

impl MessageFormat {
    /// Returns the names of all message formats.
    pub fn variants() -> &'static [&'static str] {
        &["human", "json"]
    }
}

impl FromStr for MessageFormat {
    type Err = MessageFormatParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "human" => Ok(Self::Human),
            "json" => Ok(Self::Json),
            other => Err(MessageFormatParseError::new(other)),
        }
    }
}

impl fmt::Display for MessageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Human => write!(f, "human"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Builds a [`Reporter`].
#[derive(Debug, Default)]
pub struct ReporterBuilder {
    message_format: MessageFormat,
    should_colorize: bool,
    verbose: bool,
}

impl ReporterBuilder {
    /// Sets the output format.
    pub fn set_message_format(&mut self, message_format: MessageFormat) -> &mut Self {
        self.message_format = message_format;
        self
    }

    /// Set to true if the reporter should colorize output.
    pub fn set_colorize(&mut self, should_colorize: bool) -> &mut Self {
        self.should_colorize = should_colorize;
        self
    }

    /// Sets verbose output.
    pub fn set_verbose(&mut self, verbose: bool) -> &mut Self {
        self.verbose = verbose;
        self
    }

    /// Creates a reporter writing to the given writer.
    pub fn build<'a>(&self, writer: impl Write + 'a) -> Reporter<'a> {
        let mut styles = Box::<Styles>::default();
        if self.should_colorize {
            styles.colorize();
        }
        Reporter {
            message_format: self.message_format,
            verbose: self.verbose,
            styles,
            writer: Box::new(writer),
        }
    }
}

/// Writes run events and summaries.
pub struct Reporter<'a> {
    message_format: MessageFormat,
    verbose: bool,
    styles: Box<Styles>,
    writer: Box<dyn Write + 'a>,
}

impl fmt::Debug for Reporter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reporter")
            .field("message_format", &self.message_format)
            .field("verbose", &self.verbose)
            .finish_non_exhaustive()
    }
}

impl Reporter<'_> {
    /// Reports an event that occurred while forks ran.
    pub fn report_event(&mut self, event: RunEvent<'_>) -> Result<(), WriteEventError> {
        match self.message_format {
            MessageFormat::Human => self.write_event(event).map_err(WriteEventError::Io),
            MessageFormat::Json => Ok(()),
        }
    }

    /// Reports the results of a finished run.
    pub fn report_run(&mut self, report: &RunReport) -> Result<(), WriteEventError> {
        match self.message_format {
            MessageFormat::Human => self.write_run_summary(report).map_err(WriteEventError::Io),
            MessageFormat::Json => self.write_json(&report.to_summary()),
        }
    }

    /// Reports the test classes that would run, in order.
    pub fn report_list(&mut self, list: &TestListSummary) -> Result<(), WriteEventError> {
        match self.message_format {
            MessageFormat::Human => self.write_list(list).map_err(WriteEventError::Io),
            MessageFormat::Json => self.write_json(list),
        }
    }

    fn write_json(&mut self, value: &impl serde::Serialize) -> Result<(), WriteEventError> {
        serde_json::to_writer(&mut self.writer, value).map_err(WriteEventError::Json)?;
        writeln!(self.writer)
            .and_then(|()| self.writer.flush())
            .map_err(WriteEventError::Io)
    }

    fn write_list(&mut self, list: &TestListSummary) -> std::io::Result<()> {
        if self.verbose {
            write!(
                self.writer,
                "{} {}",
                "run order:".style(self.styles.header),
                list.run_order
            )?;
            if let Some(seed) = list.random_seed {
                write!(self.writer, " (seed {})", seed.style(self.styles.count))?;
            }
            writeln!(self.writer)?;
        }
        for class in &list.classes {
            writeln!(self.writer, "{}", class.style(self.styles.class))?;
        }
        self.writer.flush()
    }

    fn write_event(&mut self, event: RunEvent<'_>) -> std::io::Result<()> {
        match event {
            RunEvent::RunStarted {
                test_count,
                fork_count,
            } => {
                writeln!(
                    self.writer,
                    "{:>12} {} test {} across {} {}",
                    "Starting".style(self.styles.pass),
                    test_count.style(self.styles.count),
                    plural(test_count, "class", "classes"),
                    fork_count.style(self.styles.count),
                    plural(fork_count, "fork", "forks"),
                )?;
            }
            RunEvent::ForkStarted {
                fork_number,
                command,
            } => {
                if self.verbose {
                    writeln!(
                        self.writer,
                        "{:>12} fork {}: {command}",
                        "FORK".style(self.styles.pass),
                        fork_number.style(self.styles.count),
                    )?;
                }
            }
            RunEvent::TestSetFinished(summary) => self.write_test_set(summary)?,
            RunEvent::TestFailed(failure) => self.write_failure(failure)?,
            RunEvent::SkippingRemaining { reason } => {
                writeln!(
                    self.writer,
                    "{:>12} {reason}",
                    "Skipping".style(self.styles.skip)
                )?;
            }
            RunEvent::ForkFinished(outcome) => self.write_fork_outcome(outcome)?,
        }
        self.writer.flush()
    }

    fn write_test_set(&mut self, summary: &TestSetSummary) -> std::io::Result<()> {
        if summary.failed > 0 {
            write!(self.writer, "{:>12} ", "FAIL".style(self.styles.fail))?;
        } else if summary.passed == 0 && summary.skipped > 0 {
            write!(self.writer, "{:>12} ", "SKIP".style(self.styles.skip))?;
        } else {
            write!(self.writer, "{:>12} ", "PASS".style(self.styles.pass))?;
        }
        let elapsed = Duration::from_millis(summary.elapsed_ms.unwrap_or(0));
        write_duration(elapsed, &mut self.writer)?;
        write!(self.writer, "{}", summary.class_name.style(self.styles.class))?;
        if self.verbose {
            write!(
                self.writer,
                " (fork {}: {} passed, {} failed, {} skipped)",
                summary.fork_number, summary.passed, summary.failed, summary.skipped
            )?;
        }
        writeln!(self.writer)
    }

    fn write_failure(&mut self, failure: &TestFailure) -> std::io::Result<()> {
        let status = match failure.kind {
            FailureKind::Failure => "FAILED",
            FailureKind::Error => "ERROR",
        };
        let name = match &failure.method_name {
            Some(method) => format!("{}#{method}", failure.class_name),
            None => failure.class_name.clone(),
        };
        writeln!(
            self.writer,
            "{:>12} {}",
            status.style(self.styles.fail),
            name.style(self.styles.class)
        )?;

        if let Some(message) = &failure.message {
            for line in message.lines() {
                writeln!(self.writer, "    {line}")?;
            }
        }
        let trace = failure.stack_trace.as_ref().and_then(|trace| {
            trace
                .smart_trimmed
                .as_deref()
                .or(trace.stack_trace.as_deref())
        });
        if let Some(trace) = trace {
            for line in trace.lines() {
                writeln!(self.writer, "    {line}")?;
            }
        }

        for (header, output) in [("STDOUT", &failure.stdout), ("STDERR", &failure.stderr)] {
            if output.is_empty() {
                continue;
            }
            writeln!(
                self.writer,
                "\n{}",
                format!("--- {header}: {name} ---").style(self.styles.fail_output)
            )?;
            write!(self.writer, "{output}")?;
            if !output.ends_with('\n') {
                writeln!(self.writer)?;
            }
        }
        Ok(())
    }

    fn write_fork_outcome(&mut self, outcome: &ForkOutcome) -> std::io::Result<()> {
        if outcome.corrupted_lines > 0 {
            write!(
                self.writer,
                "{:>12} fork {} wrote {} {} outside of the protocol",
                "WARNING".style(self.styles.skip),
                outcome.fork_number,
                outcome.corrupted_lines.style(self.styles.count),
                plural(outcome.corrupted_lines, "line", "lines"),
            )?;
            match &outcome.dump_file {
                Some(path) => writeln!(self.writer, " (see {path})")?,
                None => writeln!(self.writer)?,
            }
        }

        let Some(failure) = &outcome.result.fork_failure else {
            return Ok(());
        };
        let status = if outcome.result.timed_out {
            "TIMEOUT"
        } else {
            "CRASH"
        };
        writeln!(
            self.writer,
            "{:>12} fork {}",
            status.style(self.styles.fail),
            outcome.fork_number.style(self.styles.count),
        )?;
        for line in failure.lines() {
            writeln!(self.writer, "    {line}")?;
        }
        if !outcome.stderr_tail.is_empty() {
            writeln!(
                self.writer,
                "{}",
                format!("--- STDERR: fork {} ---", outcome.fork_number)
                    .style(self.styles.fail_output)
            )?;
            for line in &outcome.stderr_tail {
                writeln!(self.writer, "{line}")?;
            }
        }
        Ok(())
    }

    fn write_run_summary(&mut self, report: &RunReport) -> std::io::Result<()> {
        let result = &report.result;
        let passed = result
            .completed
            .saturating_sub(result.failures)
            .saturating_sub(result.errors)
            .saturating_sub(result.skipped);

        writeln!(self.writer, "------------")?;
        write!(self.writer, "{:>12} ", "Summary".style(self.styles.pass))?;
        write_duration(report.elapsed, &mut self.writer)?;
        write!(
            self.writer,
            "{} {} run: {} {}",
            result.completed.style(self.styles.count),
            plural(result.completed as usize, "test", "tests"),
            passed.style(self.styles.count),
            "passed".style(self.styles.pass),
        )?;
        if result.flakes > 0 {
            write!(
                self.writer,
                " ({} {})",
                result.flakes.style(self.styles.count),
                "flaky".style(self.styles.skip),
            )?;
        }
        if result.failures > 0 {
            write!(
                self.writer,
                ", {} {}",
                result.failures.style(self.styles.count),
                "failed".style(self.styles.fail),
            )?;
        }
        if result.errors > 0 {
            write!(
                self.writer,
                ", {} {}",
                result.errors.style(self.styles.count),
                "errored".style(self.styles.fail),
            )?;
        }
        writeln!(
            self.writer,
            ", {} {}",
            result.skipped.style(self.styles.count),
            "skipped".style(self.styles.skip),
        )?;

        if report.unstarted_classes > 0 {
            writeln!(
                self.writer,
                "{:>12} {} test {} not started",
                "Skipped".style(self.styles.skip),
                report.unstarted_classes.style(self.styles.count),
                plural(report.unstarted_classes, "class", "classes"),
            )?;
        }
        if result.has_fork_failure() {
            let forks = report
                .forks
                .iter()
                .filter(|fork| fork.result.fork_failure.is_some())
                .count();
            writeln!(
                self.writer,
                "{:>12} {} {} did not exit cleanly",
                "Error".style(self.styles.fail),
                forks.style(self.styles.count),
                plural(forks, "fork", "forks"),
            )?;
        }
        self.writer.flush()
    }
}

fn write_duration(duration: Duration, writer: &mut dyn Write) -> std::io::Result<()> {
    // Right-align to 8 characters, with three digits after the decimal point.
    write!(writer, "[{:>8.3?}s] ", duration.as_secs_f64())
}

fn plural(count: usize, singular: &'static str, plural: &'static str) -> &'static str {
    if count == 1 { singular } else { plural }
}

#[derive(Debug, Default)]
struct Styles {
    count: Style,
    pass: Style,
    fail: Style,
    fail_output: Style,
    skip: Style,
    class: Style,
    header: Style,
}

impl Styles {
    fn colorize(&mut self) {
        self.count = Style::new().bold();
        self.pass = Style::new().green().bold();
        self.fail = Style::new().red().bold();
        self.fail_output = Style::new().magenta();
        self.skip = Style::new().yellow().bold();
        self.class = Style::new().blue().bold();
        self.header = Style::new().bold();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{protocol::StackTrace, result::RunResult};
    use chrono::Local;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    fn human_output(verbose: bool, f: impl FnOnce(&mut Reporter<'_>)) -> String {
        let mut out = Vec::new();
        {
            let mut reporter = ReporterBuilder::default()
                .set_verbose(verbose)
                .build(&mut out);
            f(&mut reporter);
        }
        String::from_utf8(out).expect("output is UTF-8")
    }

    fn test_set(class_name: &str, passed: u32, failed: u32, skipped: u32) -> TestSetSummary {
        let mut summary = TestSetSummary::new(class_name, 1);
        summary.passed = passed;
        summary.failed = failed;
        summary.skipped = skipped;
        summary.elapsed_ms = Some(2);
        summary
    }

    fn report(result: RunResult) -> RunReport {
        RunReport {
            result,
            test_sets: vec![test_set("a.OneTest", 2, 0, 0)],
            failures: Vec::new(),
            forks: Vec::new(),
            unstarted_classes: 0,
            start_time: Local::now(),
            elapsed: Duration::from_millis(1234),
        }
    }

    #[test]
    fn message_format_from_str() {
        assert_eq!("json".parse::<MessageFormat>().ok(), Some(MessageFormat::Json));
        let error = "xml".parse::<MessageFormat>().expect_err("unknown format");
        assert_eq!(
            error.to_string(),
            "unrecognized value for message-format: xml\n(known values: human, json)"
        );
    }

    #[test]
    fn human_events() {
        let failure = TestFailure {
            fork_number: 1,
            class_name: "a.FailingTest".to_owned(),
            method_name: Some("testTwo".to_owned()),
            kind: FailureKind::Failure,
            message: Some("expected:<1> but was:<2>".to_owned()),
            stack_trace: Some(StackTrace {
                smart_trimmed: Some("FailingTest.java:42".to_owned()),
                ..Default::default()
            }),
            stdout: "running testTwo\n".to_owned(),
            stderr: String::new(),
        };
        let output = human_output(false, |reporter| {
            reporter
                .report_event(RunEvent::RunStarted {
                    test_count: 2,
                    fork_count: 1,
                })
                .unwrap();
            reporter
                .report_event(RunEvent::ForkStarted {
                    fork_number: 1,
                    command: "runner",
                })
                .unwrap();
            reporter
                .report_event(RunEvent::TestSetFinished(&test_set("a.OneTest", 2, 0, 0)))
                .unwrap();
            reporter.report_event(RunEvent::TestFailed(&failure)).unwrap();
            reporter
                .report_event(RunEvent::TestSetFinished(&test_set(
                    "a.FailingTest",
                    1,
                    1,
                    0,
                )))
                .unwrap();
        });

        assert_eq!(
            output,
            indoc! {"
                    Starting 2 test classes across 1 fork
                        PASS [   0.002s] a.OneTest
                      FAILED a.FailingTest#testTwo
                    expected:<1> but was:<2>
                    FailingTest.java:42

                --- STDOUT: a.FailingTest#testTwo ---
                running testTwo
                        FAIL [   0.002s] a.FailingTest
            "}
        );
    }

    #[test]
    fn human_summary() {
        let result = RunResult {
            completed: 5,
            failures: 1,
            skipped: 1,
            flakes: 1,
            ..Default::default()
        };
        let output = human_output(false, |reporter| {
            reporter.report_run(&report(result)).unwrap();
        });
        assert_eq!(
            output,
            indoc! {"
                ------------
                     Summary [   1.234s] 5 tests run: 3 passed (1 flaky), 1 failed, 1 skipped
            "}
        );
    }

    #[test]
    fn json_summary() {
        let mut out = Vec::new();
        {
            let mut reporter = ReporterBuilder::default()
                .set_message_format(MessageFormat::Json)
                .build(&mut out);
            let result = RunResult {
                completed: 2,
                ..Default::default()
            };
            reporter
                .report_event(RunEvent::RunStarted {
                    test_count: 1,
                    fork_count: 1,
                })
                .unwrap();
            reporter.report_run(&report(result)).unwrap();
        }
        let output = String::from_utf8(out).expect("output is UTF-8");
        insta::assert_snapshot!(
            output.trim_end(),
            @r#"{"completed":2,"errors":0,"failures":0,"skipped":0,"flakes":0,"timed-out":false,"test-sets":[{"class-name":"a.OneTest","fork-number":1,"passed":2,"failed":0,"skipped":0,"elapsed-ms":2}]}"#
        );
    }

    #[test]
    fn list() {
        let list = TestListSummary::new(
            "random",
            Some(42),
            vec!["a.TwoTest".to_owned(), "a.OneTest".to_owned()],
        );
        let output = human_output(true, |reporter| reporter.report_list(&list).unwrap());
        assert_eq!(
            output,
            indoc! {"
                run order: random (seed 42)
                a.TwoTest
                a.OneTest
            "}
        );

        let mut out = Vec::new();
        ReporterBuilder::default()
            .set_message_format(MessageFormat::Json)
            .build(&mut out)
            .report_list(&list)
            .unwrap();
        let output = String::from_utf8(out).expect("output is UTF-8");
        insta::assert_snapshot!(
            output.trim_end(),
            @r#"{"run-order":"random","random-seed":42,"classes":["a.TwoTest","a.OneTest"]}"#
        );
    }
}

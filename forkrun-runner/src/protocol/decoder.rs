// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    COMMAND_MAGIC, Command, ConsoleLevel, EVENT_MAGIC, Event, EventType, ReportEntry, RunMode,
    Shutdown, StackTrace, StandardStream,
    diagnostics::{DebugSink, DumpStream, NativeStreamLines},
    frame::{ParseError, SegmentReader, frame_start},
};
use crate::{channel::ReadableChannel, errors::DecodeError};
use bytes::{Buf, BytesMut};
use std::{io::Read, marker::PhantomData};
use tracing::debug;

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// A kind of frame a [`FrameDecoder`] can decode.
pub trait FrameFormat {
    /// The decoded message.
    type Item;

    /// The magic string that starts every frame.
    const MAGIC: &'static str;

    /// Parses everything after the frame header.
    #[doc(hidden)]
    fn parse_body(opcode: &[u8], reader: &mut SegmentReader<'_>) -> Result<Self::Item, ParseError>;
}

/// Frames sent from forks to the controller.
#[derive(Debug)]
pub enum EventFormat {}

/// Frames sent from the controller to forks.
#[derive(Debug)]
pub enum CommandFormat {}

/// Decodes events sent by a fork.
pub type EventDecoder<R> = FrameDecoder<R, EventFormat>;

/// Decodes commands sent by the controller.
pub type CommandDecoder<R> = FrameDecoder<R, CommandFormat>;

/// Reads frames from a channel, recovering from corrupt input.
///
/// Bytes that are not part of a frame (for example, output written directly to a fork's stdout)
/// are collected into lines and reported, and decoding resumes at the next frame header.
#[derive(Debug)]
pub struct FrameDecoder<R: Read, F> {
    channel: ReadableChannel<R>,
    buf: BytesMut,
    eof: bool,
    frame_start: Vec<u8>,
    lines: NativeStreamLines,
    debug_sink: Option<DebugSink>,
    _format: PhantomData<fn() -> F>,
}

impl<R: Read, F: FrameFormat> FrameDecoder<R, F> {
    /// Creates a new decoder for the given fork.
    pub fn new(reader: R, fork_number: u32, dump: DumpStream) -> Self {
        Self {
            channel: ReadableChannel::new(reader),
            buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            eof: false,
            frame_start: frame_start(F::MAGIC),
            lines: NativeStreamLines::new(fork_number, dump),
            debug_sink: None,
            _format: PhantomData,
        }
    }

    /// Sends every raw byte read to the given sink.
    pub fn with_debug_sink(mut self, sink: DebugSink) -> Self {
        self.debug_sink = Some(sink);
        self
    }

    /// Returns the debug sink, if any.
    pub fn debug_sink(&self) -> Option<&DebugSink> {
        self.debug_sink.as_ref()
    }

    /// Returns the number of lines written outside of frames and reported as corruption.
    pub fn corrupted_lines(&self) -> usize {
        self.lines.corrupted_lines()
    }

    /// Decodes the next frame.
    ///
    /// Returns:
    /// * `Ok(Some(item))` for a well-formed frame.
    /// * `Ok(None)` if a corrupt frame was skipped, or if a frame could not be turned into a
    ///   message. The caller should call `decode` again.
    /// * `Err` at the end of the stream or on an I/O error. Unconsumed bytes are reported first.
    pub fn decode(&mut self) -> Result<Option<F::Item>, DecodeError> {
        loop {
            let Some(start) = find(&self.buf, &self.frame_start) else {
                // Keep a tail that might be the beginning of a frame header.
                let keep = if self.eof {
                    0
                } else {
                    self.buf.len().min(self.frame_start.len() - 1)
                };
                let junk = self.buf.split_to(self.buf.len() - keep);
                self.lines.write(&junk);
                self.fill()?;
                continue;
            };
            if start > 0 {
                let junk = self.buf.split_to(start);
                self.lines.write(&junk);
            }

            let mut reader = SegmentReader::new(&self.buf);
            let res = reader
                .header(&self.frame_start)
                .and_then(|opcode| F::parse_body(opcode, &mut reader));
            let consumed = reader.position();
            // A frame cut short before its final delimiter borrows the next frame's leading `:`.
            let borrows_next = matches!(res, Ok(_) | Err(ParseError::Invalid(_)))
                && self.buf[consumed - 1..].starts_with(&self.frame_start);
            if borrows_next {
                return Ok(self.skip_malformed(consumed - 1));
            }
            match res {
                Ok(item) => {
                    self.buf.advance(consumed);
                    return Ok(Some(item));
                }
                // A frame still incomplete at the end of the stream was truncated.
                Err(ParseError::Incomplete) if self.eof => {
                    return Ok(self.skip_malformed(consumed));
                }
                Err(ParseError::Incomplete) => {
                    self.fill()?;
                }
                Err(ParseError::Malformed(at)) => {
                    return Ok(self.skip_malformed(at));
                }
                Err(ParseError::Invalid(message)) => {
                    self.buf.advance(consumed);
                    self.lines.dump().dump_text(&message);
                    debug!("{message}");
                    return Ok(None);
                }
            }
        }
    }

    /// Skips the corrupt frame at the start of the buffer.
    ///
    /// Only the bytes before the next frame header are dropped, since a frame that was cut short
    /// may be followed by a good frame starting anywhere inside it.
    fn skip_malformed(&mut self, at: usize) -> Option<F::Item> {
        let end = find(&self.buf[1..], &self.frame_start).map_or(1, |next| next + 1);
        let corrupt = self.buf.split_to(end);
        debug!(
            "skipping {} bytes of a {} frame corrupt at byte {at}",
            corrupt.len(),
            F::MAGIC,
        );
        self.lines.write(&corrupt);
        None
    }

    /// Reads more bytes into the buffer. At the end of the stream, reports whatever is left and
    /// returns an error.
    fn fill(&mut self) -> Result<(), DecodeError> {
        if self.eof {
            self.dump_remaining();
            return Err(DecodeError::Eof);
        }

        let len = self.buf.len();
        self.buf.resize(len + READ_CHUNK_SIZE, 0);
        match self.channel.read(&mut self.buf[len..]) {
            Ok(n) => {
                self.buf.truncate(len + n);
                if let Some(sink) = &mut self.debug_sink {
                    sink.write(&self.buf[len..]);
                }
                if n == 0 {
                    self.eof = true;
                }
                Ok(())
            }
            Err(error) => {
                self.buf.truncate(len);
                self.dump_remaining();
                Err(DecodeError::Channel(error))
            }
        }
    }

    fn dump_remaining(&mut self) {
        let rest = self.buf.split();
        self.lines.write(&rest);
        self.lines.flush();
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn run_mode(reader: &mut SegmentReader<'_>) -> Result<Result<RunMode, String>, ParseError> {
    let name = reader.run_mode()?;
    Ok(RunMode::from_name(name)
        .ok_or_else(|| format!("unknown run mode `{}`", String::from_utf8_lossy(name))))
}

fn stack_trace(reader: &mut SegmentReader<'_>) -> Result<StackTrace, ParseError> {
    reader.charset()?;
    let message = reader.string()?;
    let smart_trimmed = reader.string()?;
    let stack_trace = reader.string()?;
    Ok(StackTrace {
        message,
        smart_trimmed,
        stack_trace,
    })
}

fn report_entry(reader: &mut SegmentReader<'_>) -> Result<Result<ReportEntry, String>, ParseError> {
    let run_mode = run_mode(reader)?;
    let test_run_id = reader.test_run_id()?;
    reader.charset()?;
    let source = reader.string()?;
    let source_text = reader.string()?;
    let name = reader.string()?;
    let name_text = reader.string()?;
    let group = reader.string()?;
    let message = reader.string()?;
    let elapsed_ms = reader.integer()?;
    let trace_message = reader.string()?;
    let smart_trimmed = reader.string()?;
    let stack_trace = reader.string()?;
    Ok(run_mode.map(|run_mode| ReportEntry {
        run_mode,
        test_run_id,
        source,
        source_text,
        name,
        name_text,
        group,
        message,
        elapsed_ms,
        stack_trace: StackTrace::from_parts(trace_message, smart_trimmed, stack_trace),
    }))
}

impl FrameFormat for EventFormat {
    type Item = Event;
    const MAGIC: &'static str = EVENT_MAGIC;

    fn parse_body(opcode: &[u8], reader: &mut SegmentReader<'_>) -> Result<Event, ParseError> {
        let at = reader.position();
        let event_type = EventType::from_opcode(opcode).ok_or(ParseError::Malformed(at))?;
        let invalid = |message: String| ParseError::Invalid(format!("{event_type}: {message}"));

        let event = match event_type {
            EventType::Bye => Event::Bye,
            EventType::StopOnNextTest => Event::StopOnNextTest,
            EventType::NextTest => Event::NextTest,
            EventType::ConsoleErrorLog => Event::ConsoleError(stack_trace(reader)?),
            EventType::JvmExitError => Event::JvmExitError(stack_trace(reader)?),
            EventType::ConsoleInfoLog
            | EventType::ConsoleDebugLog
            | EventType::ConsoleWarningLog => {
                let level = match event_type {
                    EventType::ConsoleInfoLog => ConsoleLevel::Info,
                    EventType::ConsoleDebugLog => ConsoleLevel::Debug,
                    _ => ConsoleLevel::Warning,
                };
                reader.charset()?;
                Event::Console {
                    level,
                    message: reader.string()?,
                }
            }
            EventType::StdOutStream
            | EventType::StdOutStreamNewLine
            | EventType::StdErrStream
            | EventType::StdErrStreamNewLine => {
                let run_mode = run_mode(reader)?;
                let test_run_id = reader.test_run_id()?;
                reader.charset()?;
                let data = reader.string()?;
                let (stream, new_line) = match event_type {
                    EventType::StdOutStream => (StandardStream::Stdout, false),
                    EventType::StdOutStreamNewLine => (StandardStream::Stdout, true),
                    EventType::StdErrStream => (StandardStream::Stderr, false),
                    _ => (StandardStream::Stderr, true),
                };
                Event::Output {
                    stream,
                    new_line,
                    run_mode: run_mode.map_err(invalid)?,
                    test_run_id,
                    data,
                }
            }
            EventType::SystemProperty => {
                let run_mode = run_mode(reader)?;
                let test_run_id = reader.test_run_id()?;
                reader.charset()?;
                let key = reader.string()?;
                let value = reader.string()?;
                Event::SystemProperty {
                    run_mode: run_mode.map_err(invalid)?,
                    test_run_id,
                    key,
                    value,
                }
            }
            EventType::TestSetStarting
            | EventType::TestSetCompleted
            | EventType::TestStarting
            | EventType::TestSucceeded
            | EventType::TestFailed
            | EventType::TestSkipped
            | EventType::TestError
            | EventType::TestAssumptionFailure => {
                let entry = report_entry(reader)?.map_err(invalid)?;
                let kind = event_type
                    .report_kind()
                    .expect("test lifecycle events have a report kind");
                Event::Report { kind, entry }
            }
        };
        Ok(event)
    }
}

impl FrameFormat for CommandFormat {
    type Item = Command;
    const MAGIC: &'static str = COMMAND_MAGIC;

    fn parse_body(opcode: &[u8], reader: &mut SegmentReader<'_>) -> Result<Command, ParseError> {
        let at = reader.position();
        let command = match opcode {
            b"run-testclass" => {
                reader.charset()?;
                match reader.string()? {
                    Some(class) => Command::RunClass(class),
                    None => {
                        return Err(ParseError::Invalid(
                            "run-testclass: missing class name".to_owned(),
                        ));
                    }
                }
            }
            b"shutdown" => {
                reader.charset()?;
                let param = reader.string()?;
                Command::Shutdown(Shutdown::from_param(param.as_deref().unwrap_or_default()))
            }
            b"testset-finished" => Command::TestSetFinished,
            b"skip-since-next-test" => Command::SkipSinceNextTest,
            b"noop" => Command::Noop,
            b"bye-ack" => Command::ByeAck,
            _ => return Err(ParseError::Malformed(at)),
        };
        Ok(command)
    }
}

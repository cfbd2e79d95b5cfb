// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    COMMAND_MAGIC, Charset, Command, EVENT_MAGIC, Event, ReportEntry, Shutdown, StackTrace,
    frame::{Segment, encode_frame},
};
use crate::{channel::WritableBufferedChannel, errors::ChannelError};
use std::io::Write;

/// Sends commands to a fork.
///
/// Every method writes one complete frame and flushes it.
#[derive(Debug)]
pub struct CommandEncoder<W: Write> {
    channel: WritableBufferedChannel<W>,
    charset: Charset,
}

impl<W: Write> CommandEncoder<W> {
    /// Creates a new encoder writing to the given writer (typically a fork's stdin).
    pub fn new(writer: W) -> Self {
        Self {
            channel: WritableBufferedChannel::new(writer),
            charset: Charset::default(),
        }
    }

    /// Sets the charset used for string payloads.
    pub fn with_charset(mut self, charset: Charset) -> Self {
        self.charset = charset;
        self
    }

    /// Sends any command.
    pub fn send(&mut self, command: &Command) -> Result<(), ChannelError> {
        let frame = match command {
            Command::RunClass(class) => self.frame_with_string(command.opcode(), class),
            Command::Shutdown(shutdown) => {
                self.frame_with_string(command.opcode(), shutdown.param())
            }
            Command::TestSetFinished
            | Command::SkipSinceNextTest
            | Command::Noop
            | Command::ByeAck => encode_frame(COMMAND_MAGIC, command.opcode(), &[]),
        };
        self.channel.write(&frame).map(|_| ())
    }

    fn frame_with_string(&self, opcode: &str, data: &str) -> Vec<u8> {
        encode_frame(
            COMMAND_MAGIC,
            opcode,
            &[Segment::Charset(self.charset), Segment::String(Some(data))],
        )
    }

    /// Asks the fork to run a test class.
    pub fn send_run_class(&mut self, class: &str) -> Result<(), ChannelError> {
        self.send(&Command::RunClass(class.to_owned()))
    }

    /// Tells the fork that no more test classes will be sent.
    pub fn send_test_set_finished(&mut self) -> Result<(), ChannelError> {
        self.send(&Command::TestSetFinished)
    }

    /// Asks the fork to skip every test from the next one onwards.
    pub fn send_skip_since_next_test(&mut self) -> Result<(), ChannelError> {
        self.send(&Command::SkipSinceNextTest)
    }

    /// Asks the fork to shut down.
    pub fn send_shutdown(&mut self, shutdown: Shutdown) -> Result<(), ChannelError> {
        self.send(&Command::Shutdown(shutdown))
    }

    /// Sends a command that does nothing.
    pub fn send_noop(&mut self) -> Result<(), ChannelError> {
        self.send(&Command::Noop)
    }

    /// Acknowledges the fork's goodbye.
    pub fn send_bye_ack(&mut self) -> Result<(), ChannelError> {
        self.send(&Command::ByeAck)
    }

    /// Closes the channel. The fork sees end of stream.
    pub fn close(&mut self) -> Result<(), ChannelError> {
        self.channel.close()
    }

    /// Flushes the channel and returns the underlying writer.
    pub fn into_inner(self) -> Result<W, ChannelError> {
        self.channel.into_inner()
    }
}

/// Sends events to the controller. Used on the fork side of the protocol.
#[derive(Debug)]
pub struct EventEncoder<W: Write> {
    channel: WritableBufferedChannel<W>,
    charset: Charset,
}

impl<W: Write> EventEncoder<W> {
    /// Creates a new encoder writing to the given writer (typically the fork's stdout).
    pub fn new(writer: W) -> Self {
        Self {
            channel: WritableBufferedChannel::new(writer),
            charset: Charset::default(),
        }
    }

    /// Sets the charset used for string payloads.
    pub fn with_charset(mut self, charset: Charset) -> Self {
        self.charset = charset;
        self
    }

    /// Encodes and sends an event.
    ///
    /// Test output is buffered; every other event flushes the channel, along with any buffered
    /// output.
    pub fn send(&mut self, event: &Event) -> Result<(), ChannelError> {
        let frame = self.encode(event);
        match event {
            Event::Output { .. } => self.channel.write_buffered(&frame).map(|_| ()),
            _ => self.channel.write(&frame).map(|_| ()),
        }
    }

    /// Flushes buffered output.
    pub fn flush(&mut self) -> Result<(), ChannelError> {
        self.channel.flush()
    }

    /// Flushes the channel and returns the underlying writer.
    pub fn into_inner(self) -> Result<W, ChannelError> {
        self.channel.into_inner()
    }

    fn encode(&self, event: &Event) -> Vec<u8> {
        let opcode = event.event_type().opcode();
        let charset = Segment::Charset(self.charset);
        match event {
            Event::Bye | Event::StopOnNextTest | Event::NextTest => {
                encode_frame(EVENT_MAGIC, opcode, &[])
            }
            Event::Console { message, .. } => encode_frame(
                EVENT_MAGIC,
                opcode,
                &[charset, Segment::String(message.as_deref())],
            ),
            Event::ConsoleError(trace) | Event::JvmExitError(trace) => {
                let [a, b, c] = trace_segments(Some(trace));
                encode_frame(EVENT_MAGIC, opcode, &[charset, a, b, c])
            }
            Event::Output {
                run_mode,
                test_run_id,
                data,
                ..
            } => encode_frame(
                EVENT_MAGIC,
                opcode,
                &[
                    Segment::RunMode(*run_mode),
                    Segment::TestRunId(*test_run_id),
                    charset,
                    Segment::String(data.as_deref()),
                ],
            ),
            Event::SystemProperty {
                run_mode,
                test_run_id,
                key,
                value,
            } => encode_frame(
                EVENT_MAGIC,
                opcode,
                &[
                    Segment::RunMode(*run_mode),
                    Segment::TestRunId(*test_run_id),
                    charset,
                    Segment::String(key.as_deref()),
                    Segment::String(value.as_deref()),
                ],
            ),
            Event::Report { entry, .. } => {
                encode_frame(EVENT_MAGIC, opcode, &report_segments(charset, entry))
            }
        }
    }
}

fn trace_segments(trace: Option<&StackTrace>) -> [Segment<'_>; 3] {
    match trace {
        Some(trace) => [
            Segment::String(trace.message.as_deref()),
            Segment::String(trace.smart_trimmed.as_deref()),
            Segment::String(trace.stack_trace.as_deref()),
        ],
        None => [Segment::String(None); 3],
    }
}

fn report_segments<'a>(charset: Segment<'a>, entry: &'a ReportEntry) -> [Segment<'a>; 13] {
    let [trace_message, smart_trimmed, stack_trace] = trace_segments(entry.stack_trace.as_ref());
    [
        Segment::RunMode(entry.run_mode),
        Segment::TestRunId(entry.test_run_id),
        charset,
        Segment::String(entry.source.as_deref()),
        Segment::String(entry.source_text.as_deref()),
        Segment::String(entry.name.as_deref()),
        Segment::String(entry.name_text.as_deref()),
        Segment::String(entry.group.as_deref()),
        Segment::String(entry.message.as_deref()),
        Segment::Integer(entry.elapsed_ms),
        trace_message,
        smart_trimmed,
        stack_trace,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CommandDecoder, DumpStream, RunMode, StandardStream};
    use test_case::test_case;

    #[test]
    fn run_class_frame() {
        let mut encoder = CommandEncoder::new(Vec::new());
        encoder.send_run_class("a.B").unwrap();
        assert_eq!(
            encoder.into_inner().unwrap(),
            b":forkrun-command:\x0d:run-testclass:\x05:UTF-8:\x00\x00\x00\x03:a.B:"
        );
    }

    #[test_case(Charset::Utf8, "pkg.Ünïcødé€Test", "pkg.Ünïcødé€Test"; "utf-8")]
    #[test_case(Charset::Utf16Be, "pkg.Ünïcødé€Test", "pkg.Ünïcødé€Test"; "utf-16be")]
    #[test_case(Charset::Utf16Le, "pkg.Ünïcødé€Test", "pkg.Ünïcødé€Test"; "utf-16le")]
    #[test_case(Charset::Iso8859_1, "pkg.ÜnïcødéTest", "pkg.ÜnïcødéTest"; "latin-1")]
    #[test_case(Charset::Iso8859_1, "pkg.€Test", "pkg.?Test"; "latin-1 unmappable")]
    #[test_case(Charset::UsAscii, "pkg.Ünïcødé€Test", "pkg.?n?c?d??Test"; "ascii unmappable")]
    fn run_class_charsets(charset: Charset, class: &str, expected: &str) {
        let mut encoder = CommandEncoder::new(Vec::new()).with_charset(charset);
        encoder.send_run_class(class).unwrap();
        encoder.send_noop().unwrap();

        let frames = encoder.into_inner().unwrap();
        let mut decoder =
            CommandDecoder::new(std::io::Cursor::new(frames), 1, DumpStream::disabled());
        assert_eq!(
            decoder.decode().unwrap(),
            Some(Command::RunClass(expected.to_owned()))
        );
        assert_eq!(decoder.decode().unwrap(), Some(Command::Noop));
    }

    #[test]
    fn commands_without_data() {
        let mut encoder = CommandEncoder::new(Vec::new());
        encoder.send_noop().unwrap();
        encoder.send_bye_ack().unwrap();
        assert_eq!(
            encoder.into_inner().unwrap(),
            b":forkrun-command:\x04:noop::forkrun-command:\x07:bye-ack:"
        );
    }

    #[test]
    fn output_is_buffered() {
        let mut encoder = EventEncoder::new(Vec::new());
        encoder
            .send(&Event::Output {
                stream: StandardStream::Stdout,
                new_line: true,
                run_mode: RunMode::NormalRun,
                test_run_id: None,
                data: Some("hello".to_owned()),
            })
            .unwrap();
        assert_eq!(encoder.channel.buffered_len(), Some(75));
        encoder.send(&Event::Bye).unwrap();
        assert_eq!(encoder.channel.buffered_len(), Some(0));
    }
}

// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Byte channels bound to a fork's standard streams.
//!
//! Unlike a bare reader or writer, these channels:
//!
//! * retry operations that fail with [`io::ErrorKind::Interrupted`] instead of giving up, so an
//!   interrupted thread never severs a pipe to a live fork;
//! * can be closed explicitly, after which every operation fails with [`ChannelError::Closed`].

use crate::errors::ChannelError;
use std::io::{self, BufWriter, Read, Write};

/// The capacity of the buffer used by [`WritableBufferedChannel`].
pub const CHANNEL_BUFFER_SIZE: usize = 64 * 1024;

fn retry_interrupted<T>(mut f: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match f() {
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            res => return res,
        }
    }
}

/// A writable channel with an explicitly flushed buffer.
#[derive(Debug)]
pub struct WritableBufferedChannel<W: Write> {
    writer: Option<BufWriter<W>>,
    buffer_overflows: u64,
}

impl<W: Write> WritableBufferedChannel<W> {
    /// Creates a new channel over the given writer.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Some(BufWriter::with_capacity(CHANNEL_BUFFER_SIZE, writer)),
            buffer_overflows: 0,
        }
    }

    fn writer(&mut self) -> Result<&mut BufWriter<W>, ChannelError> {
        self.writer.as_mut().ok_or(ChannelError::Closed)
    }

    /// Writes all of `buf` and flushes the channel. Returns the number of bytes written.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, ChannelError> {
        let writer = self.writer()?;
        if buf.is_empty() {
            return Ok(0);
        }
        writer.write_all(buf).map_err(ChannelError::Io)?;
        retry_interrupted(|| writer.flush()).map_err(ChannelError::Io)?;
        Ok(buf.len())
    }

    /// Writes all of `buf` into the buffer without flushing it.
    ///
    /// If `buf` doesn't fit in the remaining buffer space, buffered bytes are written out first
    /// and an overflow is counted.
    pub fn write_buffered(&mut self, buf: &[u8]) -> Result<usize, ChannelError> {
        let writer = self.writer()?;
        if buf.is_empty() {
            return Ok(0);
        }
        let overflow = buf.len() > writer.capacity() - writer.buffer().len();
        writer.write_all(buf).map_err(ChannelError::Io)?;
        if overflow {
            self.buffer_overflows += 1;
        }
        Ok(buf.len())
    }

    /// Flushes buffered bytes.
    pub fn flush(&mut self) -> Result<(), ChannelError> {
        let writer = self.writer()?;
        retry_interrupted(|| writer.flush()).map_err(ChannelError::Io)
    }

    /// Returns the number of bytes waiting in the buffer, or `None` if the channel is closed.
    pub fn buffered_len(&self) -> Option<usize> {
        self.writer.as_ref().map(|writer| writer.buffer().len())
    }

    /// Flushes the channel and returns the underlying writer.
    pub fn into_inner(self) -> Result<W, ChannelError> {
        let writer = self.writer.ok_or(ChannelError::Closed)?;
        writer
            .into_inner()
            .map_err(|error| ChannelError::Io(error.into_error()))
    }

    /// Returns the number of times buffered writes did not fit in the buffer.
    pub fn count_buffer_overflows(&self) -> u64 {
        self.buffer_overflows
    }

    /// Returns true if the channel has not been closed.
    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    /// Flushes and closes the channel, dropping the underlying writer.
    ///
    /// Closing a closed channel does nothing.
    pub fn close(&mut self) -> Result<(), ChannelError> {
        match self.writer.take() {
            Some(mut writer) => retry_interrupted(|| writer.flush()).map_err(ChannelError::Io),
            None => Ok(()),
        }
    }
}

/// A readable channel.
#[derive(Debug)]
pub struct ReadableChannel<R: Read> {
    reader: Option<R>,
}

impl<R: Read> ReadableChannel<R> {
    /// Creates a new channel over the given reader.
    pub fn new(reader: R) -> Self {
        Self {
            reader: Some(reader),
        }
    }

    /// Reads into `buf`, returning the number of bytes read. Returns 0 at end of stream.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        let reader = self.reader.as_mut().ok_or(ChannelError::Closed)?;
        if buf.is_empty() {
            return Ok(0);
        }
        retry_interrupted(|| reader.read(buf)).map_err(ChannelError::Io)
    }

    /// Returns true if the channel has not been closed.
    pub fn is_open(&self) -> bool {
        self.reader.is_some()
    }

    /// Closes the channel, dropping the underlying reader.
    pub fn close(&mut self) {
        self.reader = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fails with `Interrupted` every other call.
    struct Flaky<T> {
        inner: T,
        interrupt: bool,
    }

    impl<T> Flaky<T> {
        fn new(inner: T) -> Self {
            Self {
                inner,
                interrupt: true,
            }
        }

        fn interrupt(&mut self) -> io::Result<()> {
            self.interrupt = !self.interrupt;
            if self.interrupt {
                Ok(())
            } else {
                Err(io::ErrorKind::Interrupted.into())
            }
        }
    }

    impl<T: Read> Read for Flaky<T> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.interrupt()?;
            self.inner.read(buf)
        }
    }

    impl Write for Flaky<Vec<u8>> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.interrupt()?;
            self.inner.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.interrupt()
        }
    }

    #[test]
    fn write_survives_interrupts() {
        let mut channel = WritableBufferedChannel::new(Flaky::new(Vec::new()));
        assert_eq!(channel.write(b"hello").unwrap(), 5);
        assert_eq!(channel.write(b"").unwrap(), 0);
        assert_eq!(channel.write(b" world").unwrap(), 6);
        assert!(channel.is_open());
        assert_eq!(
            channel.writer.as_ref().unwrap().get_ref().inner,
            b"hello world"
        );

        channel.close().unwrap();
        assert!(!channel.is_open());
        assert!(matches!(channel.write(b"x"), Err(ChannelError::Closed)));
        assert!(matches!(channel.write(b""), Err(ChannelError::Closed)));
        channel.close().unwrap();
    }

    #[test]
    fn buffered_writes() {
        let mut channel = WritableBufferedChannel::new(Vec::new());
        channel.write_buffered(b"abc").unwrap();
        assert!(channel.writer.as_ref().unwrap().get_ref().is_empty());
        assert_eq!(channel.count_buffer_overflows(), 0);

        let big = vec![b'x'; CHANNEL_BUFFER_SIZE];
        channel.write_buffered(&big).unwrap();
        assert_eq!(channel.count_buffer_overflows(), 1);

        channel.flush().unwrap();
        assert_eq!(
            channel.writer.as_ref().unwrap().get_ref().len(),
            CHANNEL_BUFFER_SIZE + 3
        );
    }

    #[test]
    fn read_survives_interrupts() {
        let mut channel = ReadableChannel::new(Flaky::new(&b"abc"[..]));
        let mut buf = [0u8; 8];
        assert_eq!(channel.read(&mut []).unwrap(), 0);
        assert_eq!(channel.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(channel.read(&mut buf).unwrap(), 0);

        channel.close();
        assert!(!channel.is_open());
        assert!(matches!(channel.read(&mut buf), Err(ChannelError::Closed)));
    }
}

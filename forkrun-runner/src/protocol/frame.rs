// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Segment-level reading and writing of frames.
//!
//! A frame looks like:
//!
//! ```text
//! :<magic>:<opcode length>:<opcode>:<segment>*
//! ```
//!
//! Every segment is terminated by a `:` delimiter. See [`Segment`] for the segment encodings.

use super::{Charset, RunMode, TestRunId};

pub(crate) const DELIMITER: u8 = b':';

/// Strings with a declared length above this are treated as corrupt.
pub(crate) const MAX_STRING_LENGTH: usize = 64 * 1024 * 1024;

const NON_NULL: u8 = 0xff;
const NULL: u8 = 0x00;

/// Returns the bytes every frame with this magic string starts with.
pub(crate) fn frame_start(magic: &str) -> Vec<u8> {
    let mut start = Vec::with_capacity(magic.len() + 2);
    start.push(DELIMITER);
    start.extend_from_slice(magic.as_bytes());
    start.push(DELIMITER);
    start
}

/// A single segment to encode.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Segment<'a> {
    /// `<len>:<run mode>:`
    RunMode(RunMode),

    /// `0x00:` or `0x01<8 bytes BE>:`
    TestRunId(Option<TestRunId>),

    /// `<len>:<charset name>:`. Strings following this segment are encoded with the charset.
    Charset(Charset),

    /// `<4 bytes BE len>:<bytes>:`. `None` is encoded as the single byte `0x00`.
    ///
    /// Forks write absent strings the same way, so the wire has no separate null marker: the
    /// one-character string `"\0"` decodes as `None`.
    String(Option<&'a str>),

    /// `0x00:` or `0xff<4 bytes BE>:`
    Integer(Option<i32>),
}

impl Segment<'_> {
    fn encoded_len(&self, charset: Charset) -> usize {
        match self {
            Self::RunMode(mode) => 1 + 1 + mode.name().len() + 1,
            Self::TestRunId(None) => 1 + 1,
            Self::TestRunId(Some(_)) => 1 + 8 + 1,
            Self::Charset(charset) => 1 + 1 + charset.name().len() + 1,
            Self::String(None) => 4 + 1 + 1 + 1,
            Self::String(Some(s)) => 4 + 1 + charset.encoded_len(s) + 1,
            Self::Integer(None) => 1 + 1,
            Self::Integer(Some(_)) => 1 + 4 + 1,
        }
    }

    fn write(&self, charset: Charset, out: &mut Vec<u8>) {
        match self {
            Self::RunMode(mode) => write_short(mode.name().as_bytes(), out),
            Self::TestRunId(None) => out.push(0),
            Self::TestRunId(Some(id)) => {
                out.push(1);
                out.extend_from_slice(&id.raw().to_be_bytes());
            }
            Self::Charset(charset) => write_short(charset.name().as_bytes(), out),
            Self::String(None) => {
                out.extend_from_slice(&1u32.to_be_bytes());
                out.push(DELIMITER);
                out.push(0);
            }
            Self::String(Some(s)) => {
                let bytes = charset.encode(s);
                out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                out.push(DELIMITER);
                out.extend_from_slice(&bytes);
            }
            Self::Integer(None) => out.push(NULL),
            Self::Integer(Some(i)) => {
                out.push(NON_NULL);
                out.extend_from_slice(&i.to_be_bytes());
            }
        }
        out.push(DELIMITER);
    }
}

fn write_short(bytes: &[u8], out: &mut Vec<u8>) {
    // Opcodes, run modes and charset names are all short ASCII strings.
    debug_assert!(bytes.len() <= u8::MAX as usize);
    out.push(bytes.len() as u8);
    out.push(DELIMITER);
    out.extend_from_slice(bytes);
}

/// Encodes a complete frame into a buffer allocated once with the exact frame length.
pub(crate) fn encode_frame(magic: &str, opcode: &str, segments: &[Segment<'_>]) -> Vec<u8> {
    let header_len = 1 + magic.len() + 1 + 1 + 1 + opcode.len() + 1;
    let mut charset = Charset::default();
    let mut len = header_len;
    for segment in segments {
        len += segment.encoded_len(charset);
        if let Segment::Charset(c) = segment {
            charset = *c;
        }
    }

    let mut out = Vec::with_capacity(len);
    out.extend_from_slice(&frame_start(magic));
    write_short(opcode.as_bytes(), &mut out);
    out.push(DELIMITER);

    let mut charset = Charset::default();
    for segment in segments {
        segment.write(charset, &mut out);
        if let Segment::Charset(c) = segment {
            charset = *c;
        }
    }
    debug_assert_eq!(out.len(), len, "frame length computed exactly");
    out
}

/// Why a frame could not be parsed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ParseError {
    /// More bytes are needed.
    Incomplete,

    /// The frame is corrupt at this offset.
    Malformed(usize),

    /// The frame is well-formed, but its contents can't be turned into a message.
    Invalid(String),
}

/// Reads segments out of a byte slice that starts at a frame header.
pub struct SegmentReader<'a> {
    buf: &'a [u8],
    pos: usize,
    charset: Charset,
}

impl<'a> SegmentReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            charset: Charset::default(),
        }
    }

    /// The number of bytes consumed so far.
    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        let end = self.pos.checked_add(n).ok_or(ParseError::Malformed(self.pos))?;
        let bytes = self.buf.get(self.pos..end).ok_or(ParseError::Incomplete)?;
        self.pos = end;
        Ok(bytes)
    }

    fn byte(&mut self) -> Result<u8, ParseError> {
        Ok(self.take(1)?[0])
    }

    fn delimiter(&mut self) -> Result<(), ParseError> {
        let at = self.pos;
        if self.byte()? == DELIMITER {
            Ok(())
        } else {
            Err(ParseError::Malformed(at + 1))
        }
    }

    fn short(&mut self) -> Result<&'a [u8], ParseError> {
        let len = self.byte()? as usize;
        self.delimiter()?;
        let bytes = self.take(len)?;
        self.delimiter()?;
        Ok(bytes)
    }

    /// Reads `:<magic>:<len>:<opcode>:` and returns the opcode.
    pub(crate) fn header(&mut self, start: &[u8]) -> Result<&'a [u8], ParseError> {
        let at = self.pos;
        let actual = self.take(start.len())?;
        if actual != start {
            return Err(ParseError::Malformed(at + 1));
        }
        self.short()
    }

    pub(crate) fn run_mode(&mut self) -> Result<&'a [u8], ParseError> {
        self.short()
    }

    pub(crate) fn test_run_id(&mut self) -> Result<Option<TestRunId>, ParseError> {
        let at = self.pos;
        let id = match self.byte()? {
            0 => None,
            1 => {
                let bytes = self.take(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                Some(TestRunId::from_raw(u64::from_be_bytes(raw)))
            }
            _ => return Err(ParseError::Malformed(at + 1)),
        };
        self.delimiter()?;
        Ok(id)
    }

    /// Reads a charset name. Strings read afterwards are decoded with it.
    pub(crate) fn charset(&mut self) -> Result<Charset, ParseError> {
        let name = self.short()?;
        let charset = Charset::from_name(name).ok_or(ParseError::Malformed(self.pos))?;
        self.charset = charset;
        Ok(charset)
    }

    fn int(&mut self) -> Result<[u8; 4], ParseError> {
        let bytes = self.take(4)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(bytes);
        self.delimiter()?;
        Ok(raw)
    }

    /// Reads a string. A payload of the single byte `0x00` is `None`.
    pub(crate) fn string(&mut self) -> Result<Option<String>, ParseError> {
        let at = self.pos;
        let len = u32::from_be_bytes(self.int()?) as usize;
        if len > MAX_STRING_LENGTH {
            return Err(ParseError::Malformed(at + 1));
        }
        let bytes = self.take(len)?;
        self.delimiter()?;
        let s = match bytes {
            [] => Some(String::new()),
            [0] => None,
            bytes => Some(self.charset.decode(bytes)),
        };
        Ok(s)
    }

    pub(crate) fn integer(&mut self) -> Result<Option<i32>, ParseError> {
        let at = self.pos;
        match self.byte()? {
            NULL => {
                self.delimiter()?;
                Ok(None)
            }
            NON_NULL => Ok(Some(i32::from_be_bytes(self.int()?))),
            _ => Err(ParseError::Malformed(at + 1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_header_and_segments() {
        let frame = encode_frame(
            "magic",
            "op",
            &[
                Segment::RunMode(RunMode::NormalRun),
                Segment::TestRunId(None),
                Segment::Charset(Charset::Utf8),
                Segment::String(Some("hi")),
                Segment::String(None),
                Segment::Integer(Some(258)),
            ],
        );
        let mut expected = b":magic:\x02:op:\x0a:normal-run:\x00:\x05:UTF-8:".to_vec();
        expected.extend_from_slice(b"\x00\x00\x00\x02:hi:");
        expected.extend_from_slice(b"\x00\x00\x00\x01:\x00:");
        expected.extend_from_slice(b"\xff\x00\x00\x01\x02:");
        assert_eq!(frame, expected);
    }

    #[test]
    fn read_segments() {
        let frame = encode_frame(
            "magic",
            "op",
            &[
                Segment::RunMode(RunMode::RerunTestAfterFailure),
                Segment::TestRunId(Some(TestRunId::new(Some(1), Some(2)))),
                Segment::Charset(Charset::Utf16Le),
                Segment::String(Some("héllo")),
                Segment::String(Some("")),
                Segment::String(None),
                Segment::Integer(None),
                Segment::Integer(Some(-5)),
            ],
        );
        let mut reader = SegmentReader::new(&frame);
        assert_eq!(reader.header(&frame_start("magic")), Ok(&b"op"[..]));
        assert_eq!(reader.run_mode(), Ok(&b"rerun-test-after-failure"[..]));
        assert_eq!(
            reader.test_run_id(),
            Ok(Some(TestRunId::new(Some(1), Some(2))))
        );
        assert_eq!(reader.charset(), Ok(Charset::Utf16Le));
        assert_eq!(reader.string(), Ok(Some("héllo".to_owned())));
        assert_eq!(reader.string(), Ok(Some(String::new())));
        assert_eq!(reader.string(), Ok(None));
        assert_eq!(reader.integer(), Ok(None));
        assert_eq!(reader.integer(), Ok(Some(-5)));
        assert_eq!(reader.position(), frame.len());
    }

    #[test]
    fn truncated_and_corrupt() {
        let frame = encode_frame(
            "magic",
            "op",
            &[Segment::Charset(Charset::Utf8), Segment::String(Some("abc"))],
        );
        let start = frame_start("magic");

        for end in 0..frame.len() {
            let mut reader = SegmentReader::new(&frame[..end]);
            let res = reader
                .header(&start)
                .and_then(|_| reader.charset())
                .and_then(|_| reader.string());
            assert_eq!(res, Err(ParseError::Incomplete), "truncated at {end}");
        }

        let mut corrupt = frame.clone();
        // Replace the delimiter after the opcode.
        corrupt[start.len() + 4] = b'x';
        let mut reader = SegmentReader::new(&corrupt);
        assert_eq!(
            reader.header(&start),
            Err(ParseError::Malformed(start.len() + 5))
        );

        let mut reader = SegmentReader::new(b":other:\x02:op:");
        assert_eq!(reader.header(&start), Err(ParseError::Malformed(1)));
    }

    #[test]
    fn nul_string_reads_as_absent() {
        let frame = encode_frame(
            "magic",
            "op",
            &[
                Segment::Charset(Charset::Utf8),
                Segment::String(Some("\0")),
                Segment::String(Some("\0\0")),
            ],
        );
        let mut reader = SegmentReader::new(&frame);
        reader.header(&frame_start("magic")).unwrap();
        reader.charset().unwrap();
        assert_eq!(reader.string(), Ok(None));
        assert_eq!(reader.string(), Ok(Some("\0\0".to_owned())));
    }

    #[test]
    fn unknown_charset_is_malformed() {
        let frame = b"\x07:EBCDIC!:";
        let mut reader = SegmentReader::new(frame);
        assert!(matches!(reader.charset(), Err(ParseError::Malformed(_))));
    }
}

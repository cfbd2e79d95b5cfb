// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;

/// A character set that string payloads in a frame may be encoded with.
///
/// Every frame carrying strings declares its charset first, so forks can pick an encoding per
/// message.
#[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
pub enum Charset {
    /// UTF-8.
    #[default]
    Utf8,

    /// 7-bit ASCII. Bytes above 0x7f decode to U+FFFD.
    UsAscii,

    /// Latin-1: every byte is the code point of the same value.
    Iso8859_1,

    /// Big-endian UTF-16 without a byte order mark.
    Utf16Be,

    /// Little-endian UTF-16 without a byte order mark.
    Utf16Le,
}

impl Charset {
    /// All supported charsets.
    pub const ALL: &'static [Self] = &[
        Self::Utf8,
        Self::UsAscii,
        Self::Iso8859_1,
        Self::Utf16Be,
        Self::Utf16Le,
    ];

    /// Returns the canonical name written on the wire.
    pub fn name(self) -> &'static str {
        match self {
            Self::Utf8 => "UTF-8",
            Self::UsAscii => "US-ASCII",
            Self::Iso8859_1 => "ISO-8859-1",
            Self::Utf16Be => "UTF-16BE",
            Self::Utf16Le => "UTF-16LE",
        }
    }

    /// Looks up a charset by name, ignoring ASCII case.
    pub fn from_name(name: &[u8]) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|charset| charset.name().as_bytes().eq_ignore_ascii_case(name))
    }

    /// Decodes bytes, replacing anything that cannot be decoded with U+FFFD.
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            Self::Utf8 => encoding_rs::UTF_8
                .decode_without_bom_handling(bytes)
                .0
                .into_owned(),
            Self::Utf16Be => encoding_rs::UTF_16BE
                .decode_without_bom_handling(bytes)
                .0
                .into_owned(),
            Self::Utf16Le => encoding_rs::UTF_16LE
                .decode_without_bom_handling(bytes)
                .0
                .into_owned(),
            // encoding_rs maps both of these labels to windows-1252, which differs in 0x80..0xa0.
            Self::UsAscii => bytes
                .iter()
                .map(|&b| if b.is_ascii() { b as char } else { '\u{fffd}' })
                .collect(),
            Self::Iso8859_1 => bytes.iter().map(|&b| b as char).collect(),
        }
    }

    /// Encodes a string, replacing characters this charset cannot represent with `?`.
    pub fn encode(self, s: &str) -> Vec<u8> {
        match self {
            Self::Utf8 => s.as_bytes().to_vec(),
            Self::UsAscii => s
                .chars()
                .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
                .collect(),
            Self::Iso8859_1 => s
                .chars()
                .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                .collect(),
            Self::Utf16Be => s.encode_utf16().flat_map(u16::to_be_bytes).collect(),
            Self::Utf16Le => s.encode_utf16().flat_map(u16::to_le_bytes).collect(),
        }
    }

    /// Returns the number of bytes [`Self::encode`] produces for `s`.
    pub fn encoded_len(self, s: &str) -> usize {
        match self {
            Self::Utf8 => s.len(),
            Self::UsAscii | Self::Iso8859_1 => s.chars().count(),
            Self::Utf16Be | Self::Utf16Le => s.encode_utf16().count() * 2,
        }
    }
}

impl fmt::Display for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(b"UTF-8" => Some(Charset::Utf8))]
    #[test_case(b"utf-16le" => Some(Charset::Utf16Le))]
    #[test_case(b"ISO-8859-1" => Some(Charset::Iso8859_1))]
    #[test_case(b"windows-1252" => None)]
    fn from_name(name: &[u8]) -> Option<Charset> {
        Charset::from_name(name)
    }

    #[test]
    fn encode_decode() {
        let text = "Tést✓";
        for &charset in Charset::ALL {
            let encoded = charset.encode(text);
            assert_eq!(encoded.len(), charset.encoded_len(text), "{charset}");
            let decoded = charset.decode(&encoded);
            match charset {
                Charset::Utf8 | Charset::Utf16Be | Charset::Utf16Le => assert_eq!(decoded, text),
                Charset::Iso8859_1 => assert_eq!(decoded, "Tést?"),
                Charset::UsAscii => assert_eq!(decoded, "T?st?"),
            }
        }
    }

    #[test]
    fn invalid_bytes_are_replaced() {
        assert_eq!(Charset::Utf8.decode(b"a\xffb"), "a\u{fffd}b");
        assert_eq!(Charset::UsAscii.decode(b"a\xe9"), "a\u{fffd}");
        assert_eq!(Charset::Iso8859_1.decode(b"a\xe9"), "a\u{e9}");
        // A dangling byte at the end of UTF-16 input.
        assert_eq!(Charset::Utf16Be.decode(b"\x00a\x00"), "a\u{fffd}");
    }
}

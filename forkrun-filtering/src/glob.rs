// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! ANT-style glob matching.

use crate::errors::GlobConstructError;
use std::fmt;

/// An ANT-style glob pattern.
///
/// * `*` matches zero or more characters within a path segment.
/// * `?` matches exactly one character within a path segment.
/// * `**` as a whole segment matches zero or more directories.
///
/// Every other character, including `[`, `]`, `{` and `}`, is matched literally.
///
/// We do not use `globset::GlobMatcher` directly because it matches against OS paths, so the
/// glob is translated to a regex and matched against bytes.
#[derive(Clone, Debug)]
pub struct AntGlob {
    /// The glob string, as given.
    glob_str: String,

    /// The regex to match against.
    regex: regex::bytes::Regex,
}

impl AntGlob {
    /// Creates a new ANT-style glob.
    pub fn new(glob_str: impl Into<String>) -> Result<Self, GlobConstructError> {
        let glob_str = glob_str.into();
        let translated = translate(&glob_str);
        let glob = globset::GlobBuilder::new(&translated)
            // `*` and `?` never cross a `/`.
            .literal_separator(true)
            // Only allow escapes via [].
            .backslash_escape(false)
            .build()
            .map_err(GlobConstructError::InvalidGlob)?;

        // globset produces regexes with Unicode mode disabled, so use a bytes regex.
        let regex = regex::bytes::Regex::new(glob.regex())
            .map_err(|error| GlobConstructError::RegexError(error.to_string()))?;

        Ok(Self { glob_str, regex })
    }

    /// Returns the glob string.
    pub fn as_str(&self) -> &str {
        &self.glob_str
    }

    /// Returns true if this glob matches the given path or name.
    ///
    /// Backslashes in the input are treated as path separators.
    pub fn is_match(&self, input: &str) -> bool {
        if input.contains('\\') {
            self.regex.is_match(input.replace('\\', "/").as_bytes())
        } else {
            self.regex.is_match(input.as_bytes())
        }
    }
}

impl fmt::Display for AntGlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.glob_str)
    }
}

/// Translates an ANT glob into globset syntax.
fn translate(glob: &str) -> String {
    let normalized = glob.replace('\\', "/");
    let mut out = String::with_capacity(normalized.len() + 8);
    for (index, segment) in normalized.split('/').enumerate() {
        if index > 0 {
            out.push('/');
        }
        if segment == "**" {
            out.push_str("**");
            continue;
        }

        let mut prev_star = false;
        for c in segment.chars() {
            match c {
                // A `**` inside a segment behaves like `*`.
                '*' if prev_star => continue,
                '*' => out.push('*'),
                '[' => out.push_str("[[]"),
                ']' => out.push_str("[]]"),
                '{' => out.push_str("[{]"),
                '}' => out.push_str("[}]"),
                c => out.push(c),
            }
            prev_star = c == '*';
        }
    }
    out
}

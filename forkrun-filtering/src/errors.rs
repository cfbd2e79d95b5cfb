// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced while parsing test patterns.

use miette::{Diagnostic, SourceSpan};
use thiserror::Error;

/// An error that occurred while parsing a test pattern or a list of them.
///
/// All of these are configuration errors: they are reported while the pattern is constructed,
/// never while it is being matched.
#[derive(Clone, Debug, Error, Diagnostic, PartialEq)]
#[non_exhaustive]
pub enum PatternError {
    /// A `%regex[...]` token was not well-formed.
    #[error(
        "Illegal test|includes|excludes regex '{token}'. Expected %regex[class#method] or \
         !%regex[class#method] with optional class or #method."
    )]
    IllegalRegexToken {
        /// The offending token.
        token: String,
    },

    /// A regex half contained a `#`.
    #[error(
        "%regex[] usage rule violation, valid regex rules:\n \
         * <classNameRegex>#<methodNameRegex> - where both regex can be individually evaluated as a regex\n \
         * you may use at most 1 '#' to in one regex filter. Extra '#' in regex: {expression}"
    )]
    RegexUsageViolation {
        /// The regex expression, including its `%regex[]` wrapper.
        expression: String,
    },

    /// A non-regex pattern contained more than one `#`.
    #[error("test pattern '{pattern}' contains more than one '#' method separator")]
    ExtraMethodSeparator {
        /// The pattern.
        #[source_code]
        pattern: String,

        /// The location of the second separator.
        #[label("unexpected '#'")]
        span: SourceSpan,
    },

    /// A regex failed to compile.
    #[error("invalid regex in test pattern")]
    InvalidRegex {
        /// The regex body.
        #[source_code]
        regex: String,

        /// The location of the error within the regex body.
        #[label("{message}")]
        span: SourceSpan,

        /// The message produced by the regex parser.
        message: String,
    },

    /// A glob failed to compile.
    #[error("invalid glob in test pattern: `{glob}`")]
    InvalidGlob {
        /// The glob string.
        glob: String,

        /// The underlying error.
        #[source]
        error: GlobConstructError,
    },

    /// An exclusion passed separately from the inclusions started with `!`.
    #[error("Exclamation mark not expected in 'exclusion': {exclusion}")]
    ExclamationInExclusion {
        /// The exclusion.
        exclusion: String,
    },
}

impl PatternError {
    pub(crate) fn extra_method_separator(pattern: &str) -> Self {
        let mut separators = pattern.match_indices('#').map(|(index, _)| index);
        let first = separators.next().unwrap_or(0);
        let offending = separators.next().unwrap_or(first);
        Self::ExtraMethodSeparator {
            pattern: pattern.to_owned(),
            span: (offending, 1).into(),
        }
    }

    pub(crate) fn invalid_regex(regex: &str, error: &regex::Error) -> Self {
        // Use regex-syntax to parse the input so that we get better error messages.
        match regex_syntax::Parser::new().parse(regex) {
            Ok(_) => Self::InvalidRegex {
                regex: regex.to_owned(),
                span: (0, regex.len()).into(),
                message: error.to_string(),
            },
            Err(err) => {
                let (message, span) = match &err {
                    regex_syntax::Error::Parse(err) => (format!("{}", err.kind()), *err.span()),
                    regex_syntax::Error::Translate(err) => {
                        (format!("{}", err.kind()), *err.span())
                    }
                    _ => {
                        return Self::InvalidRegex {
                            regex: regex.to_owned(),
                            span: (0, regex.len()).into(),
                            message: err.to_string(),
                        };
                    }
                };
                let start = span.start.offset;
                let end = span.end.offset;
                Self::InvalidRegex {
                    regex: regex.to_owned(),
                    span: (start, end.saturating_sub(start)).into(),
                    message,
                }
            }
        }
    }
}

/// An error that occurred while constructing a glob.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum GlobConstructError {
    /// An error occurred while parsing the glob.
    #[error("{}", .0.kind())]
    InvalidGlob(globset::Error),

    /// An error occurred while constructing the regex for the glob.
    #[error("{}", .0)]
    RegexError(String),
}

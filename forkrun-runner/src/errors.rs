// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by forkrun.

use crate::run_order::RunOrder;
use camino::{Utf8Path, Utf8PathBuf};
use config::ConfigError;
use itertools::Itertools;
use std::{io, num::ParseIntError};
use thiserror::Error;

/// An error that occurred while parsing the config.
#[derive(Debug, Error)]
#[error("failed to parse forkrun config at `{config_file}`")]
#[non_exhaustive]
pub struct ConfigParseError {
    config_file: Utf8PathBuf,
    #[source]
    kind: ConfigParseErrorKind,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: impl Into<Utf8PathBuf>, kind: ConfigParseErrorKind) -> Self {
        Self {
            config_file: config_file.into(),
            kind,
        }
    }

    /// Returns the config file that failed to parse.
    pub fn config_file(&self) -> &Utf8Path {
        &self.config_file
    }

    /// Returns the kind of error.
    pub fn kind(&self) -> &ConfigParseErrorKind {
        &self.kind
    }
}

/// The kind of [`ConfigParseError`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigParseErrorKind {
    /// The config sources could not be merged.
    #[error(transparent)]
    BuildError(Box<ConfigError>),

    /// The merged config could not be deserialized.
    #[error(transparent)]
    DeserializeError(Box<serde_path_to_error::Error<ConfigError>>),
}

/// An error which indicates that a profile was requested but not known to forkrun.
#[derive(Clone, Debug, Error)]
#[error("profile `{profile}` not found (known profiles: {})", .all_profiles.join(", "))]
pub struct ProfileNotFound {
    profile: String,
    all_profiles: Vec<String>,
}

impl ProfileNotFound {
    pub(crate) fn new(
        profile: impl Into<String>,
        all_profiles: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let mut all_profiles: Vec<_> = all_profiles.into_iter().map(|s| s.into()).collect();
        all_profiles.sort_unstable();
        Self {
            profile: profile.into(),
            all_profiles,
        }
    }
}

/// An error returned while parsing [`RunOrders`](crate::run_order::RunOrders).
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum RunOrderParseError {
    /// The name of a run order was not recognized.
    #[error(
        "There's no RunOrder with the name {name}. Please use one of the following RunOrders: {}.",
        RunOrder::variants().join(", ")
    )]
    UnknownName {
        /// The name that was passed in.
        name: String,
    },

    /// `testorder` was combined with other run orders.
    #[error("run order `testorder` cannot be combined with other run orders: {input}")]
    TestOrderNotAlone {
        /// The full run order string.
        input: String,
    },

    /// The seed passed to `random` is not a number.
    #[error("invalid seed for run order `random`: {seed}")]
    InvalidRandomSeed {
        /// The seed that was passed in.
        seed: String,

        /// The underlying error.
        #[source]
        error: ParseIntError,
    },
}

/// An error on a [`WritableBufferedChannel`](crate::channel::WritableBufferedChannel) or a
/// [`ReadableChannel`](crate::channel::ReadableChannel).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChannelError {
    /// The channel was closed.
    #[error("channel is closed")]
    Closed,

    /// An I/O error other than an interrupt occurred.
    #[error("I/O error on channel")]
    Io(#[source] io::Error),
}

/// A fatal error while decoding frames.
///
/// Malformed frames are not errors: the decoder skips them.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DecodeError {
    /// The stream ended.
    #[error("end of stream")]
    Eof,

    /// Reading from the stream failed.
    #[error("failed to read from stream")]
    Channel(#[source] ChannelError),
}

impl DecodeError {
    /// Returns true if this is the end of the stream rather than a failure.
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Eof)
    }
}

/// An error that occurred while reading the run statistics file.
#[derive(Debug, Error)]
#[error("failed to read run statistics from `{path}`")]
pub struct StatisticsReadError {
    path: Utf8PathBuf,
    #[source]
    kind: StatisticsReadErrorKind,
}

impl StatisticsReadError {
    pub(crate) fn new(path: impl Into<Utf8PathBuf>, kind: StatisticsReadErrorKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }

    /// Returns the path to the statistics file.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Returns the kind of error.
    pub fn kind(&self) -> &StatisticsReadErrorKind {
        &self.kind
    }
}

/// The kind of [`StatisticsReadError`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StatisticsReadErrorKind {
    /// The file could not be read.
    #[error("I/O error")]
    Io(#[source] io::Error),

    /// A line could not be parsed.
    #[error("invalid entry on line {line_number}: `{line}`")]
    Parse {
        /// The line number, starting from 1.
        line_number: usize,

        /// The contents of the line.
        line: String,
    },
}

impl StatisticsReadErrorKind {
    pub(crate) fn parse(line_index: usize, line: &str) -> Self {
        Self::Parse {
            line_number: line_index + 1,
            line: line.to_owned(),
        }
    }
}

/// An error that occurred while writing the run statistics file.
#[derive(Debug, Error)]
#[error("failed to write run statistics to `{path}`")]
pub struct StatisticsWriteError {
    path: Utf8PathBuf,
    #[source]
    error: io::Error,
}

impl StatisticsWriteError {
    pub(crate) fn new(path: impl Into<Utf8PathBuf>, error: io::Error) -> Self {
        Self {
            path: path.into(),
            error,
        }
    }
}

/// An error that occurred while discovering test classes.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DiscoveryError {
    /// The classes directory does not exist.
    #[error("classes directory `{dir}` does not exist")]
    DirNotFound {
        /// The directory.
        dir: Utf8PathBuf,
    },

    /// An include or exclude pattern is invalid.
    #[error("invalid class pattern `{pattern}`")]
    InvalidPattern {
        /// The pattern.
        pattern: String,

        /// The underlying error.
        #[source]
        error: forkrun_filtering::errors::PatternError,
    },

    /// Walking the directory failed.
    #[error("error walking classes directory `{dir}`")]
    Walk {
        /// The directory.
        dir: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: walkdir::Error,
    },

    /// A discovered path is not valid UTF-8.
    #[error("path in classes directory `{dir}` is not valid UTF-8: {}", .path.display())]
    NonUtf8Path {
        /// The directory.
        dir: Utf8PathBuf,

        /// The path.
        path: std::path::PathBuf,
    },
}

/// An error that occurred while parsing a fork command.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ForkCommandError {
    /// No program was specified.
    #[error("fork command is empty")]
    Empty,
}

/// An error that prevented forks from running.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ForkError {
    /// A fork could not be started.
    #[error("failed to start fork {fork_number} with `{command}`")]
    Spawn {
        /// The fork number, starting from 1.
        fork_number: u32,

        /// The command line.
        command: String,

        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// A thread for a fork could not be started.
    #[error("failed to start thread for fork {fork_number}")]
    SpawnThread {
        /// The fork number, starting from 1.
        fork_number: u32,

        /// The underlying error.
        #[source]
        error: io::Error,
    },
}

/// An error that occurs while writing reporter output.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WriteEventError {
    /// An error occurred while writing the event to the provided output.
    #[error("error writing to output")]
    Io(#[source] io::Error),

    /// An error occurred while serializing JSON output.
    #[error("error serializing JSON output")]
    Json(#[source] serde_json::Error),
}

/// An error returned while parsing a [`MessageFormat`](crate::reporter::MessageFormat).
#[derive(Clone, Debug, Error)]
#[error(
    "unrecognized value for message-format: {input}\n(known values: {})",
    crate::reporter::MessageFormat::variants().join(", "),
)]
pub struct MessageFormatParseError {
    input: String,
}

impl MessageFormatParseError {
    pub(crate) fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

/// An error returned while parsing a [`ForkCount`](crate::config::ForkCount) value.
#[derive(Clone, Debug, Error)]
#[error(
    "unrecognized value for fork-count: {input}\n\
     (expected a positive integer, \"num-cpus\", or a CPU multiple such as \"1.5C\")"
)]
pub struct ForkCountParseError {
    input: String,
}

impl ForkCountParseError {
    pub(crate) fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

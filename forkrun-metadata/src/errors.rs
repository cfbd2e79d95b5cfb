// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{error, fmt, string::FromUtf8Error};

/// An error that occurs while running a `forkrun` subcommand through [`ForkrunCommand`].
///
/// [`ForkrunCommand`]: crate::ForkrunCommand
#[derive(Debug)]
pub enum CommandError {
    /// Executing the process resulted in an error.
    Exec {
        /// The subcommand that was run.
        subcommand: &'static str,

        /// The underlying error.
        err: std::io::Error,
    },

    /// The command exited with a code that doesn't carry a summary.
    CommandFailed {
        /// The subcommand that was run.
        subcommand: &'static str,

        /// The exit code for the process. Exit codes can be cross-referenced against
        /// [`ForkrunExitCode`](crate::ForkrunExitCode).
        exit_code: Option<i32>,

        /// Standard error for the process.
        stderr: Vec<u8>,
    },

    /// Standard output was not valid UTF-8.
    NonUtf8Output {
        /// The subcommand that was run.
        subcommand: &'static str,

        /// The underlying error.
        err: FromUtf8Error,
    },

    /// Error parsing JSON output.
    Json {
        /// The subcommand that was run.
        subcommand: &'static str,

        /// The underlying error.
        err: serde_json::Error,
    },
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Exec { subcommand, .. } => {
                write!(f, "executing `forkrun {subcommand}` failed")
            }
            Self::CommandFailed {
                subcommand,
                exit_code,
                stderr,
            } => {
                let exit_code_str =
                    exit_code.map_or(String::new(), |code| format!(" with exit code {code}"));
                let stderr = String::from_utf8_lossy(stderr);
                write!(
                    f,
                    "`forkrun {subcommand}` failed{exit_code_str}, stderr:\n{stderr}\n"
                )
            }
            Self::NonUtf8Output { subcommand, .. } => {
                write!(f, "`forkrun {subcommand}` produced non-UTF-8 output")
            }
            Self::Json { subcommand, .. } => {
                write!(f, "parsing `forkrun {subcommand}` JSON output failed")
            }
        }
    }
}

impl error::Error for CommandError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Exec { err, .. } => Some(err),
            Self::CommandFailed { .. } => None,
            Self::NonUtf8Output { err, .. } => Some(err),
            Self::Json { err, .. } => Some(err),
        }
    }
}

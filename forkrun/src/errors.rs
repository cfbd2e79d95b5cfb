// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::output::{NO_HEADING_TARGET, StderrStyles};
use forkrun_filtering::errors::PatternError;
use forkrun_metadata::ForkrunExitCode;
use forkrun_runner::errors::*;
use owo_colors::OwoColorize;
use std::{error::Error, path::PathBuf};
use thiserror::Error;
use tracing::error;

pub(crate) type Result<T, E = ExpectedError> = std::result::Result<T, E>;

// Note that the #[error()] strings are mostly placeholder messages -- the expected way to print out
// errors is with the display_to_stderr method, which colorizes errors.

/// An error that forkrun knows how to report, along with its exit code.
#[derive(Debug, Error)]
#[doc(hidden)]
pub enum ExpectedError {
    #[error("could not determine the current directory")]
    CurrentDirFailed {
        #[source]
        err: std::io::Error,
    },
    #[error("workspace root is not valid UTF-8")]
    WorkspaceRootInvalidUtf8 { path: PathBuf },
    #[error("config parse error")]
    ConfigParseError {
        #[from]
        err: ConfigParseError,
    },
    #[error("profile not found")]
    ProfileNotFound {
        #[from]
        err: ProfileNotFound,
    },
    #[error("test pattern parse error")]
    TestPatternError {
        pattern: String,
        #[source]
        err: PatternError,
    },
    #[error("run order parse error")]
    RunOrderParseError {
        input: String,
        #[source]
        err: RunOrderParseError,
    },
    #[error("test discovery error")]
    DiscoveryError {
        #[from]
        err: DiscoveryError,
    },
    #[error("fork command error")]
    ForkCommandError {
        #[from]
        err: ForkCommandError,
    },
    #[error("fork error")]
    ForkError {
        #[from]
        err: ForkError,
    },
    #[error("write event error")]
    WriteEventError {
        #[from]
        err: WriteEventError,
    },
    #[error("show config error")]
    ShowConfigError {
        #[source]
        err: toml::ser::Error,
    },
    #[error("fork stub error")]
    ForkStubError {
        #[source]
        err: ChannelError,
    },
}

impl ExpectedError {
    pub(crate) fn test_pattern_error(pattern: impl Into<String>, err: PatternError) -> Self {
        Self::TestPatternError {
            pattern: pattern.into(),
            err,
        }
    }

    pub(crate) fn run_order_parse_error(input: impl Into<String>, err: RunOrderParseError) -> Self {
        Self::RunOrderParseError {
            input: input.into(),
            err,
        }
    }

    /// Returns the exit code for the process.
    pub fn process_exit_code(&self) -> i32 {
        match self {
            Self::CurrentDirFailed { .. }
            | Self::WorkspaceRootInvalidUtf8 { .. }
            | Self::ConfigParseError { .. }
            | Self::ProfileNotFound { .. }
            | Self::ForkCommandError { .. }
            | Self::ShowConfigError { .. } => ForkrunExitCode::SETUP_ERROR,
            Self::DiscoveryError { err } => match err {
                DiscoveryError::InvalidPattern { .. } => ForkrunExitCode::INVALID_TEST_PATTERN,
                _ => ForkrunExitCode::SETUP_ERROR,
            },
            Self::TestPatternError { .. } => ForkrunExitCode::INVALID_TEST_PATTERN,
            Self::RunOrderParseError { .. } => ForkrunExitCode::INVALID_RUN_ORDER,
            Self::ForkError { .. } | Self::ForkStubError { .. } => ForkrunExitCode::FORK_FAILED,
            Self::WriteEventError { .. } => ForkrunExitCode::WRITE_OUTPUT_ERROR,
        }
    }

    /// Displays this error to stderr.
    pub fn display_to_stderr(&self, styles: &StderrStyles) {
        let mut next_error = match &self {
            Self::CurrentDirFailed { err } => {
                error!("could not determine the current directory");
                Some(err as &dyn Error)
            }
            Self::WorkspaceRootInvalidUtf8 { path } => {
                error!(
                    "workspace root `{}` is not valid UTF-8",
                    path.display().style(styles.bold)
                );
                None
            }
            Self::ConfigParseError { err } => {
                error!(
                    "failed to parse forkrun config at `{}`",
                    err.config_file().style(styles.bold)
                );
                Some(err.kind() as &dyn Error)
            }
            Self::ProfileNotFound { err } => {
                error!("{err}");
                err.source()
            }
            Self::TestPatternError { pattern, err } => {
                error!(
                    "failed to parse test pattern `{}`",
                    pattern.style(styles.bold)
                );
                // Pattern errors carry source spans, so print them out using miette.
                error!(
                    target: NO_HEADING_TARGET,
                    "{:?}",
                    miette::Report::new(err.clone())
                );
                None
            }
            Self::RunOrderParseError { input, err } => {
                error!("invalid run order `{}`", input.style(styles.bold));
                Some(err as &dyn Error)
            }
            Self::DiscoveryError { err } => {
                error!("{err}");
                err.source()
            }
            Self::ForkCommandError { err } => {
                error!("{err}");
                error!(
                    target: NO_HEADING_TARGET,
                    "{}",
                    "(hint: pass a command after `--`, or set `fork-command` in the profile)"
                        .style(styles.warning_text)
                );
                None
            }
            Self::ForkError { err } => {
                error!("{err}");
                err.source()
            }
            Self::WriteEventError { err } => {
                error!("failed to write event to output");
                Some(err as &dyn Error)
            }
            Self::ShowConfigError { err } => {
                error!("failed to serialize config");
                Some(err as &dyn Error)
            }
            Self::ForkStubError { err } => {
                error!("fork stub failed to communicate with the runner");
                Some(err as &dyn Error)
            }
        };

        while let Some(err) = next_error {
            error!(target: NO_HEADING_TARGET, "\nCaused by:\n  {}", err);
            next_error = err.source();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    #[test]
    fn exit_codes() {
        let err = ExpectedError::test_pattern_error(
            "a#b#c",
            forkrun_filtering::TestListResolver::new("a#b#c").unwrap_err(),
        );
        assert_eq!(err.process_exit_code(), ForkrunExitCode::INVALID_TEST_PATTERN);

        let err = ExpectedError::run_order_parse_error(
            "sideways",
            "sideways"
                .parse::<forkrun_runner::run_order::RunOrders>()
                .unwrap_err(),
        );
        assert_eq!(err.process_exit_code(), ForkrunExitCode::INVALID_RUN_ORDER);

        let err = ExpectedError::from(ForkCommandError::Empty);
        assert_eq!(err.process_exit_code(), ForkrunExitCode::SETUP_ERROR);

        let err = ExpectedError::from(DiscoveryError::DirNotFound {
            dir: Utf8PathBuf::from("target/test-classes"),
        });
        assert_eq!(err.process_exit_code(), ForkrunExitCode::SETUP_ERROR);
    }
}

// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{CommandError, ForkrunExitCode, RunSummary, TestListSummary};
use camino::Utf8PathBuf;
use std::{ffi::OsString, process::Command};

/// A builder for invoking `forkrun` and parsing its JSON output.
#[derive(Clone, Debug)]
pub struct ForkrunCommand {
    program: Utf8PathBuf,
    args: Vec<OsString>,
    current_dir: Option<Utf8PathBuf>,
}

impl ForkrunCommand {
    /// Creates a new command that runs the given `forkrun` executable.
    pub fn new(program: impl Into<Utf8PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
        }
    }

    /// Adds an argument, passed after the subcommand.
    pub fn arg(&mut self, arg: impl Into<OsString>) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    /// Adds several arguments, passed after the subcommand.
    pub fn args(&mut self, args: impl IntoIterator<Item = impl Into<OsString>>) -> &mut Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory.
    pub fn current_dir(&mut self, dir: impl Into<Utf8PathBuf>) -> &mut Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Runs `forkrun list --message-format json` and parses its output.
    pub fn exec_list(&self) -> Result<TestListSummary, CommandError> {
        let stdout = self.exec_json("list", &[ForkrunExitCode::OK])?;
        TestListSummary::parse(&stdout).map_err(|err| CommandError::Json {
            subcommand: "list",
            err,
        })
    }

    /// Runs `forkrun run --message-format json` and parses its output.
    ///
    /// Failing tests, empty runs and fork failures all produce a summary, so they are returned
    /// as `Ok`. Use [`RunSummary::exit_code`] to tell them apart.
    pub fn exec_run(&self) -> Result<RunSummary, CommandError> {
        let stdout = self.exec_json(
            "run",
            &[
                ForkrunExitCode::OK,
                ForkrunExitCode::NO_TESTS_RUN,
                ForkrunExitCode::TEST_RUN_FAILED,
                ForkrunExitCode::FORK_FAILED,
            ],
        )?;
        RunSummary::parse(&stdout).map_err(|err| CommandError::Json {
            subcommand: "run",
            err,
        })
    }

    fn exec_json(
        &self,
        subcommand: &'static str,
        expected_codes: &[i32],
    ) -> Result<String, CommandError> {
        let mut command = Command::new(&self.program);
        command
            .arg(subcommand)
            .args(["--message-format", "json"])
            .args(&self.args);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }

        let output = command
            .output()
            .map_err(|err| CommandError::Exec { subcommand, err })?;
        let code = output.status.code();
        if !code.is_some_and(|code| expected_codes.contains(&code)) {
            return Err(CommandError::CommandFailed {
                subcommand,
                exit_code: code,
                stderr: output.stderr,
            });
        }

        String::from_utf8(output.stdout)
            .map_err(|err| CommandError::NonUtf8Output { subcommand, err })
    }
}

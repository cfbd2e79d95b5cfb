// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::ForkCommandError;
use camino::{Utf8Path, Utf8PathBuf};
use itertools::Itertools;
use std::{
    fmt,
    process::{Command, Stdio},
};

/// The command line used to start a fork.
///
/// Occurrences of [`FORK_NUMBER_PLACEHOLDER`](Self::FORK_NUMBER_PLACEHOLDER) in arguments are
/// replaced with the fork number, and the fork number is also passed in through the
/// [`FORK_NUMBER_ENV`](Self::FORK_NUMBER_ENV) environment variable.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ForkCommand {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    current_dir: Option<Utf8PathBuf>,
}

impl ForkCommand {
    /// Replaced with the fork number in arguments.
    pub const FORK_NUMBER_PLACEHOLDER: &'static str = "{fork_number}";

    /// The environment variable holding the fork number.
    pub const FORK_NUMBER_ENV: &'static str = "FORKRUN_FORK_NUMBER";

    /// Creates a new command from a program and its arguments.
    pub fn new(
        program: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            envs: Vec::new(),
            current_dir: None,
        }
    }

    /// Creates a new command from an argv, where the first element is the program.
    pub fn from_argv(argv: &[String]) -> Result<Self, ForkCommandError> {
        match argv.split_first() {
            Some((program, args)) if !program.is_empty() => Ok(Self::new(program, args)),
            _ => Err(ForkCommandError::Empty),
        }
    }

    /// Sets an environment variable for every fork.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Sets the working directory for every fork.
    pub fn current_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Returns the program.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Returns the arguments, with placeholders left in place.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Returns the working directory, if set.
    pub fn dir(&self) -> Option<&Utf8Path> {
        self.current_dir.as_deref()
    }

    /// Returns the arguments for the given fork.
    pub fn args_for(&self, fork_number: u32) -> Vec<String> {
        let fork_number = fork_number.to_string();
        self.args
            .iter()
            .map(|arg| arg.replace(Self::FORK_NUMBER_PLACEHOLDER, &fork_number))
            .collect()
    }

    /// Returns the command line for the given fork, for display.
    pub fn display_for(&self, fork_number: u32) -> String {
        std::iter::once(self.program.clone())
            .chain(self.args_for(fork_number))
            .map(|arg| quote_arg(&arg))
            .join(" ")
    }

    /// Builds a [`Command`] for the given fork, with all standard streams piped.
    pub(crate) fn to_command(&self, fork_number: u32) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args_for(fork_number))
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .env(Self::FORK_NUMBER_ENV, fork_number.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

impl fmt::Display for ForkCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let line = std::iter::once(&self.program)
            .chain(&self.args)
            .map(|arg| quote_arg(arg))
            .join(" ");
        f.write_str(&line)
    }
}

fn quote_arg(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains(|c: char| c.is_whitespace() || c == '\'' || c == '"') {
        arg.to_owned()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

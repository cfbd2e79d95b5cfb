// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The binary protocol spoken between the controller and forks.
//!
//! Forks read commands from their standard input and write events to their standard output.
//! Both directions use the same framing, distinguished by a magic string:
//!
//! * [`EVENT_MAGIC`] for events sent by forks, decoded by an [`EventDecoder`];
//! * [`COMMAND_MAGIC`] for commands sent by the controller, encoded by a [`CommandEncoder`].
//!
//! Every frame carrying strings declares a [`Charset`] before them. Bytes that a fork writes to
//! its standard output outside of frames are collected into lines, reported and dumped to a
//! per-fork [`DumpStream`], and decoding resumes at the next frame.

mod charset;
mod decoder;
mod diagnostics;
mod encoder;
mod frame;
mod types;

pub use charset::*;
pub use decoder::*;
pub use diagnostics::{DebugSink, DumpStream};
pub use encoder::*;
pub use types::*;

/// The magic string at the start of every event frame.
pub const EVENT_MAGIC: &str = "forkrun-event";

/// The magic string at the start of every command frame.
pub const COMMAND_MAGIC: &str = "forkrun-command";

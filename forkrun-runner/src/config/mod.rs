// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration support for forkrun.
//!
//! Configuration is read from an embedded default, with `.config/forkrun.toml` (or a file passed
//! in explicitly) layered on top. Settings are grouped into profiles: `[profile.default]` holds
//! every setting, and other profiles override it key by key.

mod fork_count;
mod imp;

pub use fork_count::*;
pub use imp::*;

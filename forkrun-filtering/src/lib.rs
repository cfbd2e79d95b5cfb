// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Include and exclude patterns for selecting test classes and methods.
//!
//! A pattern list such as `pkg.*Test#test*, !**/Slow*` is parsed into a [`TestListResolver`],
//! which holds one [`ResolvedTest`] per pattern and answers whether a given class file and
//! method should run.

pub mod errors;
mod glob;
mod test_list;

pub use glob::AntGlob;
pub use resolved_test::{PatternKind, ResolvedTest};
pub use test_list::{
    AndFilter, OrFilter, TestFilter, TestListResolver, TestOrderComparator, to_class_file_name,
};

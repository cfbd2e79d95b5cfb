// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Finding test classes in a directory of compiled classes.

use crate::{errors::DiscoveryError, run_order::TestsToRun};
use camino::{Utf8Path, Utf8PathBuf};
use forkrun_filtering::{TestListResolver, errors::PatternError};
use tracing::debug;
use walkdir::WalkDir;

/// Class files scanned when no includes are configured.
pub const DEFAULT_INCLUDES: &[&str] = &[
    "**/Test*.java",
    "**/*Test.java",
    "**/*Tests.java",
    "**/*TestCase.java",
];

/// Class files skipped when no excludes are configured. Matches nested classes.
pub const DEFAULT_EXCLUDES: &[&str] = &["**/*$*"];

/// Scans a classes directory for test classes.
#[derive(Clone, Debug)]
pub struct DirectoryScanner {
    classes_dir: Utf8PathBuf,
    resolver: TestListResolver,
}

impl DirectoryScanner {
    /// Creates a scanner with the default includes and excludes.
    pub fn new(classes_dir: impl Into<Utf8PathBuf>) -> Self {
        let resolver = TestListResolver::with_excludes(DEFAULT_INCLUDES, DEFAULT_EXCLUDES)
            .expect("default patterns are valid");
        Self {
            classes_dir: classes_dir.into(),
            resolver,
        }
    }

    /// Creates a scanner with custom includes and excludes. Empty lists fall back to the
    /// defaults.
    pub fn with_patterns(
        classes_dir: impl Into<Utf8PathBuf>,
        includes: &[String],
        excludes: &[String],
    ) -> Result<Self, DiscoveryError> {
        let includes: Vec<&str> = if includes.is_empty() {
            DEFAULT_INCLUDES.to_vec()
        } else {
            includes.iter().map(String::as_str).collect()
        };
        let excludes: Vec<&str> = if excludes.is_empty() {
            DEFAULT_EXCLUDES.to_vec()
        } else {
            excludes.iter().map(String::as_str).collect()
        };
        let resolver = TestListResolver::with_excludes(&includes, &excludes).map_err(
            |error: PatternError| DiscoveryError::InvalidPattern {
                pattern: includes.iter().chain(&excludes).copied().collect::<Vec<_>>().join(", "),
                error,
            },
        )?;
        Ok(Self {
            classes_dir: classes_dir.into(),
            resolver,
        })
    }

    /// Returns the classes directory.
    pub fn classes_dir(&self) -> &Utf8Path {
        &self.classes_dir
    }

    /// Scans the directory and returns the classes that match the includes and excludes, and
    /// that `filter` accepts.
    ///
    /// Classes are returned in sorted walk order, which is the `filesystem` run order.
    pub fn scan(&self, filter: &TestListResolver) -> Result<TestsToRun, DiscoveryError> {
        if !self.classes_dir.is_dir() {
            return Err(DiscoveryError::DirNotFound {
                dir: self.classes_dir.clone(),
            });
        }

        let mut classes = Vec::new();
        for entry in WalkDir::new(&self.classes_dir).sort_by_file_name() {
            let entry = entry.map_err(|error| DiscoveryError::Walk {
                dir: self.classes_dir.clone(),
                error,
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&self.classes_dir)
                .unwrap_or(entry.path());
            let relative = Utf8Path::from_path(relative).ok_or_else(|| {
                DiscoveryError::NonUtf8Path {
                    dir: self.classes_dir.clone(),
                    path: entry.path().to_owned(),
                }
            })?;
            let class_file = relative.as_str().replace('\\', "/");
            let Some(class_name) = class_file.strip_suffix(".class") else {
                continue;
            };
            if !self.resolver.should_run(Some(&class_file), None) {
                continue;
            }
            let class_name = class_name.replace('/', ".");
            if filter.should_run_class(&class_name) {
                classes.push(class_name);
            } else {
                debug!("class {class_name} filtered out");
            }
        }

        debug!(
            "discovered {} test classes in {}",
            classes.len(),
            self.classes_dir
        );
        Ok(TestsToRun::new(classes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;

    fn classes_dir(files: &[&str]) -> Utf8TempDir {
        let dir = Utf8TempDir::new().unwrap();
        for file in files {
            let path = dir.path().join(file);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, b"").unwrap();
        }
        dir
    }

    #[test]
    fn default_patterns() {
        let dir = classes_dir(&[
            "pkg/FooTest.class",
            "pkg/FooTest$Inner.class",
            "pkg/TestBar.class",
            "pkg/sub/BazTests.class",
            "pkg/Helper.class",
            "pkg/QuxTestCase.class",
            "pkg/FooTest.java",
            "AbcTest.class",
        ]);
        let scanner = DirectoryScanner::new(dir.path());
        let classes = scanner.scan(&TestListResolver::empty()).unwrap();
        assert_eq!(
            classes.into_vec(),
            [
                "AbcTest",
                "pkg.FooTest",
                "pkg.QuxTestCase",
                "pkg.TestBar",
                "pkg.sub.BazTests"
            ]
        );
    }

    #[test]
    fn custom_patterns_and_filter() {
        let dir = classes_dir(&["a/OneIT.class", "a/TwoIT.class", "a/OneTest.class"]);
        let scanner = DirectoryScanner::with_patterns(
            dir.path(),
            &["**/*IT.java".to_owned()],
            &["**/Two*".to_owned()],
        )
        .unwrap();
        let classes = scanner.scan(&TestListResolver::empty()).unwrap();
        assert_eq!(classes.into_vec(), ["a.OneIT"]);

        let scanner = DirectoryScanner::new(dir.path());
        let filter = TestListResolver::new("!a.One*").unwrap();
        assert!(scanner.scan(&filter).unwrap().is_empty());
        let filter = TestListResolver::new("OneTest#testSomething").unwrap();
        assert_eq!(scanner.scan(&filter).unwrap().into_vec(), ["a.OneTest"]);
    }

    #[test]
    fn missing_dir() {
        let dir = Utf8TempDir::new().unwrap();
        let scanner = DirectoryScanner::new(dir.path().join("missing"));
        assert!(matches!(
            scanner.scan(&TestListResolver::empty()),
            Err(DiscoveryError::DirNotFound { .. })
        ));
    }
}

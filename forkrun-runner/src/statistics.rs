// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-test run history, used to order test classes.
//!
//! The history is a flat text file with one entry per line:
//!
//! ```text
//! successfulBuilds,runTimeMs,className,methodName
//! ```
//!
//! `successfulBuilds` counts consecutive passing runs, so 0 means the test failed the last time
//! it ran. Entries without a method leave out the last field, so an empty method name and no
//! method stay distinct. Line breaks inside a method name are written as a new line starting with
//! a space. Lines starting with `#` are comments.

use crate::errors::{StatisticsReadError, StatisticsReadErrorKind, StatisticsWriteError};
use camino::Utf8Path;
use indexmap::IndexMap;
use std::{fmt::Write as _, io::Write as _};

/// Identifies a test in the statistics file.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ClassMethod {
    /// The fully qualified class name.
    pub class_name: String,

    /// The method name, if the entry is for a single method.
    pub method_name: Option<String>,
}

impl ClassMethod {
    /// Creates a new identifier.
    pub fn new(class_name: impl Into<String>, method_name: Option<impl Into<String>>) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.map(Into::into),
        }
    }
}

/// The history of a single test.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunEntryStatistics {
    /// The number of consecutive runs in which the test passed.
    pub successful_builds: u32,

    /// The run time of the most recent run, in milliseconds.
    pub run_time_ms: u32,

    /// The test.
    pub test: ClassMethod,
}

impl RunEntryStatistics {
    fn has_failed(&self) -> bool {
        self.successful_builds == 0
    }

    fn write_line(&self, out: &mut String) {
        _ = write!(
            out,
            "{},{},{}",
            self.successful_builds, self.run_time_ms, self.test.class_name
        );
        let Some(method) = &self.test.method_name else {
            out.push('\n');
            return;
        };
        out.push(',');
        for (i, line) in method.split('\n').enumerate() {
            if i > 0 {
                out.push_str("\n ");
            }
            out.push_str(line);
        }
        out.push('\n');
    }
}

/// Returns the class name from a `method(Class)` description. Other strings are returned as is.
///
/// ```
/// use forkrun_runner::statistics::extract_class_name;
///
/// assert_eq!(extract_class_name("testFoo(org.example.FooTest)"), "org.example.FooTest");
/// assert_eq!(extract_class_name("org.example.FooTest"), "org.example.FooTest");
/// ```
pub fn extract_class_name(description: &str) -> &str {
    split_description(description).map_or(description, |(_, class)| class)
}

fn split_description(description: &str) -> Option<(&str, &str)> {
    let inner = description.strip_suffix(')')?;
    let (method, class) = inner.split_once('(')?;
    let no_parens = |s: &str| !s.is_empty() && !s.contains(['(', ')']);
    (no_parens(method) && no_parens(class)).then_some((method, class))
}

/// Run history for a set of tests, keyed by class and method.
#[derive(Clone, Debug, Default)]
pub struct RunEntryStatisticsMap {
    entries: IndexMap<ClassMethod, RunEntryStatistics>,
}

impl RunEntryStatisticsMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the map from a file. A missing file produces an empty map.
    pub fn from_file(path: &Utf8Path) -> Result<Self, StatisticsReadError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents).map_err(|kind| StatisticsReadError::new(path, kind)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(error) => Err(StatisticsReadError::new(
                path,
                StatisticsReadErrorKind::Io(error),
            )),
        }
    }

    /// Parses the contents of a statistics file.
    pub fn parse(contents: &str) -> Result<Self, StatisticsReadErrorKind> {
        let mut map = Self::new();
        let mut last: Option<ClassMethod> = None;

        for (line_number, line) in contents.lines().enumerate() {
            if line.starts_with('#') || line.is_empty() {
                continue;
            }
            if let Some(continuation) = line.strip_prefix(' ') {
                let mut entry = last
                    .as_ref()
                    .and_then(|key| map.entries.shift_remove(key))
                    .ok_or_else(|| StatisticsReadErrorKind::parse(line_number, line))?;
                let method = entry.test.method_name.get_or_insert_with(String::new);
                method.push('\n');
                method.push_str(continuation);
                last = Some(entry.test.clone());
                map.add(entry);
                continue;
            }

            let entry = parse_line(line)
                .ok_or_else(|| StatisticsReadErrorKind::parse(line_number, line))?;
            last = Some(entry.test.clone());
            map.add(entry);
        }

        Ok(map)
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the entry for a test, if any.
    pub fn get(&self, test: &ClassMethod) -> Option<&RunEntryStatistics> {
        self.entries.get(test)
    }

    /// Adds an entry, replacing any existing entry for the same test.
    pub fn add(&mut self, entry: RunEntryStatistics) {
        self.entries.insert(entry.test.clone(), entry);
    }

    /// Records a passing run of a test.
    pub fn record_success(&mut self, test: ClassMethod, run_time_ms: u32) {
        let successful_builds = self
            .entries
            .get(&test)
            .map_or(0, |entry| entry.successful_builds);
        self.add(RunEntryStatistics {
            successful_builds: successful_builds.saturating_add(1),
            run_time_ms,
            test,
        });
    }

    /// Records a failing run of a test.
    pub fn record_failure(&mut self, test: ClassMethod, run_time_ms: u32) {
        self.add(RunEntryStatistics {
            successful_builds: 0,
            run_time_ms,
            test,
        });
    }

    /// Merges entries from another map. Entries in `other` win.
    pub fn merge(&mut self, other: RunEntryStatisticsMap) {
        for (_, entry) in other.entries {
            self.add(entry);
        }
    }

    /// Writes the map to a file, replacing it atomically.
    ///
    /// Entries are sorted by successful builds, then run time, then name.
    pub fn serialize(&self, path: &Utf8Path) -> Result<(), StatisticsWriteError> {
        let contents = self.to_file_contents();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|error| StatisticsWriteError::new(path, error))?;
        }
        atomicwrites::AtomicFile::new(path, atomicwrites::AllowOverwrite)
            .write(|file| file.write_all(contents.as_bytes()))
            .map_err(|error| {
                let error = match error {
                    atomicwrites::Error::Internal(error) | atomicwrites::Error::User(error) => {
                        error
                    }
                };
                StatisticsWriteError::new(path, error)
            })
    }

    /// Returns the contents [`Self::serialize`] writes.
    pub fn to_file_contents(&self) -> String {
        let mut entries: Vec<_> = self.entries.values().collect();
        entries.sort_by(|a, b| {
            (a.successful_builds, a.run_time_ms, &a.test).cmp(&(
                b.successful_builds,
                b.run_time_ms,
                &b.test,
            ))
        });
        let mut out = String::new();
        for entry in entries {
            entry.write_line(&mut out);
        }
        out
    }

    fn class_priorities(&self) -> IndexMap<&str, ClassPriority> {
        let mut priorities: IndexMap<&str, ClassPriority> = IndexMap::new();
        for entry in self.entries.values() {
            let priority = priorities.entry(&entry.test.class_name).or_default();
            priority.total_run_time_ms += u64::from(entry.run_time_ms);
            priority.has_failure |= entry.has_failed();
        }
        priorities
    }

    /// Reorders classes so that classes which failed last time come first. Relative order is
    /// otherwise preserved. Classes without history count as passing.
    pub fn prioritized_tests_by_failure_first<S: AsRef<str>>(&self, classes: &[S]) -> Vec<S>
    where
        S: Clone,
    {
        let priorities = self.class_priorities();
        let failed = |class: &S| {
            priorities
                .get(class.as_ref())
                .is_some_and(|priority| priority.has_failure)
        };
        let (mut first, rest): (Vec<S>, Vec<S>) = classes.iter().cloned().partition(failed);
        first.extend(rest);
        first
    }

    /// Reorders classes so that `thread_count` workers running them in order finish at about the
    /// same time.
    ///
    /// Classes are sorted by total run time, longest first, and each is assigned to the least
    /// busy worker. The result takes one class from each worker in turn.
    pub fn prioritized_tests_class_run_time<S: AsRef<str>>(
        &self,
        classes: &[S],
        thread_count: usize,
    ) -> Vec<S>
    where
        S: Clone,
    {
        let priorities = self.class_priorities();
        let run_time = |class: &S| {
            priorities
                .get(class.as_ref())
                .map_or(0, |priority| priority.total_run_time_ms)
        };

        let mut sorted: Vec<&S> = classes.iter().collect();
        // sort_by_key is stable, so classes with equal run time keep their order.
        sorted.sort_by_key(|class| std::cmp::Reverse(run_time(class)));

        let mut buckets: Vec<(u64, Vec<&S>)> = vec![(0, Vec::new()); thread_count.max(1)];
        for class in sorted {
            let (total, bucket) = buckets
                .iter_mut()
                .min_by_key(|(total, _)| *total)
                .expect("at least one bucket");
            *total += run_time(class);
            bucket.push(class);
        }

        let rounds = buckets.iter().map(|(_, bucket)| bucket.len()).max().unwrap_or(0);
        (0..rounds)
            .flat_map(|round| {
                buckets
                    .iter()
                    .filter_map(move |(_, bucket)| bucket.get(round).copied().cloned())
            })
            .collect()
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct ClassPriority {
    total_run_time_ms: u64,
    has_failure: bool,
}

fn parse_line(line: &str) -> Option<RunEntryStatistics> {
    let mut parts = line.splitn(4, ',');
    let successful_builds = parts.next()?.parse().ok()?;
    let run_time_ms = parts.next()?.parse().ok()?;
    let name = parts.next()?;
    let test = match parts.next() {
        Some(method) => ClassMethod {
            class_name: name.to_owned(),
            method_name: Some(method.to_owned()),
        },
        // Three-field lines hold a `method(Class)` description or a bare class name.
        None => match split_description(name) {
            Some((method, class)) => ClassMethod::new(class, Some(method)),
            None => ClassMethod::new(name, None::<String>),
        },
    };
    Some(RunEntryStatistics {
        successful_builds,
        run_time_ms,
        test,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    const HISTORY: &str = indoc! {"
        # forkrun run statistics
        0,17,pkg.A,testA
        2,42,pkg.B,testB
        1,100,pkg.C,testC
    "};

    #[test]
    fn class_run_time() {
        let map = RunEntryStatisticsMap::parse(HISTORY).unwrap();
        assert_eq!(map.len(), 3);
        let classes = ["pkg.A", "pkg.B", "pkg.C"];
        assert_eq!(
            map.prioritized_tests_class_run_time(&classes, 2),
            ["pkg.C", "pkg.B", "pkg.A"]
        );
        assert_eq!(
            map.prioritized_tests_class_run_time(&classes, 1),
            ["pkg.C", "pkg.B", "pkg.A"]
        );
    }

    #[test]
    fn class_run_time_balances_buckets() {
        let map = RunEntryStatisticsMap::parse(indoc! {"
            1,50,W,a
            1,40,X,a
            1,30,Y,a
            1,20,Z,a
            1,15,Z,b
        "})
        .unwrap();
        // Totals: W 50, X 40, Z 35, Y 30. Buckets: [W, Y] and [X, Z].
        assert_eq!(
            map.prioritized_tests_class_run_time(&["Y", "Z", "X", "W"], 2),
            ["W", "X", "Y", "Z"]
        );
    }

    #[test]
    fn no_history_keeps_order() {
        let map = RunEntryStatisticsMap::new();
        let classes = ["X", "Y", "Z"];
        assert_eq!(map.prioritized_tests_class_run_time(&classes, 1), classes);
        assert_eq!(map.prioritized_tests_class_run_time(&classes, 4), classes);
        assert_eq!(map.prioritized_tests_by_failure_first(&classes), classes);
    }

    #[test]
    fn failure_first() {
        let map = RunEntryStatisticsMap::parse(HISTORY).unwrap();
        assert_eq!(
            map.prioritized_tests_by_failure_first(&["pkg.B", "pkg.New", "pkg.C", "pkg.A"]),
            ["pkg.A", "pkg.B", "pkg.New", "pkg.C"]
        );
    }

    #[test]
    fn next_generation() {
        let mut map = RunEntryStatisticsMap::new();
        map.record_success(ClassMethod::new("abc", Some("method1")), 42);
        map.record_success(ClassMethod::new("abc", Some("willFail")), 17);
        map.record_success(ClassMethod::new("abc", Some("method3")), 100);
        assert_eq!(
            map.to_file_contents(),
            "1,17,abc,willFail\n1,42,abc,method1\n1,100,abc,method3\n"
        );

        map.record_success(ClassMethod::new("abc", Some("method1")), 52);
        map.record_failure(ClassMethod::new("abc", Some("willFail")), 27);
        map.record_success(ClassMethod::new("abc", Some("method3")), 110);
        assert_eq!(
            map.to_file_contents(),
            "0,27,abc,willFail\n2,52,abc,method1\n2,110,abc,method3\n"
        );
    }

    #[test]
    fn class_only_entries() {
        let mut map = RunEntryStatisticsMap::new();
        map.record_success(ClassMethod::new("abc", None::<String>), 42);
        map.record_success(ClassMethod::new("abc", Some("")), 7);
        assert_eq!(map.to_file_contents(), "1,42,abc\n1,7,abc,\n");

        let reloaded = RunEntryStatisticsMap::parse(&map.to_file_contents()).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(
            reloaded.get(&ClassMethod::new("abc", None::<String>)).unwrap().run_time_ms,
            42
        );
        assert_eq!(
            reloaded.get(&ClassMethod::new("abc", Some(""))).unwrap().run_time_ms,
            7
        );

        let map = RunEntryStatisticsMap::parse("1,42,abc\n2,7,testIt(pkg.Foo)").unwrap();
        let entry = map.get(&ClassMethod::new("abc", None::<String>)).unwrap();
        assert_eq!(entry.run_time_ms, 42);
        assert_eq!(entry.successful_builds, 1);
        let entry = map.get(&ClassMethod::new("pkg.Foo", Some("testIt"))).unwrap();
        assert_eq!(entry.successful_builds, 2);
    }

    #[test]
    fn multi_line_method_names() {
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("stats");

        let mut map = RunEntryStatisticsMap::from_file(&path).unwrap();
        assert!(map.is_empty());
        map.record_success(ClassMethod::new("abc", Some("line1\nline2\n line3")), 42);
        map.record_success(ClassMethod::new("abc", Some("test")), 10);
        map.serialize(&path).unwrap();

        let expected = "1,10,abc,test\n1,42,abc,line1\n line2\n  line3\n";
        assert_eq!(std::fs::read_to_string(&path).unwrap(), expected);

        let next_run = RunEntryStatisticsMap::from_file(&path).unwrap();
        assert_eq!(next_run.len(), 2);
        assert_eq!(next_run.to_file_contents(), expected);
    }

    #[test]
    fn parse_errors() {
        let error = RunEntryStatisticsMap::parse("1,42,abc\nnot a number,1,abc").unwrap_err();
        assert_eq!(
            error.to_string(),
            "invalid entry on line 2: `not a number,1,abc`"
        );
        assert!(RunEntryStatisticsMap::parse(" orphan continuation").is_err());
    }

    #[test]
    fn descriptions() {
        assert_eq!(extract_class_name("m(pkg.C)"), "pkg.C");
        assert_eq!(extract_class_name("m(pkg.C"), "m(pkg.C");
        assert_eq!(extract_class_name("(pkg.C)"), "(pkg.C)");
        assert_eq!(extract_class_name("a(b)(c)"), "a(b)(c)");
    }
}

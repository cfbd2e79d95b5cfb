// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resolution of include and exclude pattern lists.

use crate::{
    errors::PatternError,
    resolved_test::{PATTERN_SUFFIX, REGEX_PREFIX, ResolvedTest},
};
use indexmap::IndexSet;
use std::{cmp::Ordering, fmt};

const CLASS_FILE_EXTENSION: &str = ".class";

/// Decides whether a test should run.
pub trait TestFilter {
    /// Returns true if the test identified by a class file path and a method name should run.
    ///
    /// Either input may be absent.
    fn should_run(&self, class_file: Option<&str>, method: Option<&str>) -> bool;
}

/// A list of included and excluded [`ResolvedTest`] patterns.
///
/// Patterns are kept in the order they were supplied, which is the order used by
/// [`TestOrderComparator`]. Equality ignores that order.
#[derive(Clone, Debug, Default)]
pub struct TestListResolver {
    included: IndexSet<ResolvedTest>,
    excluded: IndexSet<ResolvedTest>,
    has_included_method_patterns: bool,
    has_excluded_method_patterns: bool,
}

impl TestListResolver {
    /// Parses a single comma-separated list of patterns.
    ///
    /// Supported tokens:
    ///
    /// * `Class`, `pkg.Class`, `**/pkg/*Test.java`: class globs.
    /// * `#method`, `Class#method`, `Class#m1+m2`: method globs, optionally bound to a class.
    /// * `%regex[class#method]`: either or both halves as regexes.
    /// * a leading `!` turns any of the above into an exclusion.
    pub fn new(csv: &str) -> Result<Self, PatternError> {
        Self::from_patterns([csv])
    }

    /// Parses several comma-separated lists of patterns into one resolver.
    pub fn from_patterns<I, S>(csvs: I) -> Result<Self, PatternError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut resolver = Self::default();
        for csv in csvs {
            for request in csv.as_ref().split(',') {
                let request = request.trim();
                if !request.is_empty() && request != "!" {
                    resolver.resolve_request(request)?;
                }
            }
        }
        Ok(resolver)
    }

    /// Builds a resolver from separate include and exclude lists.
    ///
    /// Exclusions must not carry a `!` of their own.
    pub fn with_excludes<I, E, S, T>(included: I, excluded: E) -> Result<Self, PatternError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        E: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let mut merged: Vec<String> = included
            .into_iter()
            .map(|s| s.as_ref().to_owned())
            .collect();
        for exclusion in excluded {
            let exclusion = exclusion.as_ref().trim();
            if exclusion.is_empty() {
                continue;
            }
            if exclusion.contains('!') {
                return Err(PatternError::ExclamationInExclusion {
                    exclusion: exclusion.to_owned(),
                });
            }
            merged.push(format!("!{}", exclusion.replace(',', ",!")));
        }
        Self::from_patterns(merged)
    }

    /// Returns a resolver that matches every class file.
    pub fn wildcard() -> Self {
        Self::new("*.class").expect("wildcard pattern is valid")
    }

    /// Returns an empty resolver, which matches everything.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns `resolver` if it has method patterns, or the wildcard resolver otherwise.
    pub fn optionally_wildcard_filter(resolver: Self) -> Self {
        if resolver.has_method_patterns() {
            resolver
        } else {
            Self::wildcard()
        }
    }

    /// Returns true if this resolver is equal to [`Self::wildcard`].
    pub fn is_wildcard(&self) -> bool {
        *self == Self::wildcard()
    }

    /// Returns true if this resolver has no patterns.
    pub fn is_empty(&self) -> bool {
        self.included.is_empty() && self.excluded.is_empty()
    }

    /// Returns the included patterns, in the order they were supplied.
    pub fn included_patterns(&self) -> &IndexSet<ResolvedTest> {
        &self.included
    }

    /// Returns the excluded patterns, in the order they were supplied.
    pub fn excluded_patterns(&self) -> &IndexSet<ResolvedTest> {
        &self.excluded
    }

    /// Returns true if any included pattern has a method half.
    pub fn has_included_method_patterns(&self) -> bool {
        self.has_included_method_patterns
    }

    /// Returns true if any excluded pattern has a method half.
    pub fn has_excluded_method_patterns(&self) -> bool {
        self.has_excluded_method_patterns
    }

    /// Returns true if any pattern has a method half.
    pub fn has_method_patterns(&self) -> bool {
        self.has_included_method_patterns || self.has_excluded_method_patterns
    }

    /// Returns true if the given class file and method should run.
    ///
    /// Blank inputs are treated as absent. If both are absent, or the resolver is empty, the
    /// answer is always true.
    pub fn should_run(&self, class_file: Option<&str>, method: Option<&str>) -> bool {
        let is_blank = |s: Option<&str>| s.is_none_or(|s| s.trim().is_empty());
        if self.is_empty() || (is_blank(class_file) && is_blank(method)) {
            return true;
        }

        let included = self.included.is_empty()
            || self
                .included
                .iter()
                .any(|test| test.match_as_inclusive(class_file, method));

        included
            && !self
                .excluded
                .iter()
                .any(|test| test.match_as_exclusive(class_file, method))
    }

    /// Returns true if the given fully qualified class should run.
    pub fn should_run_class(&self, class_name: &str) -> bool {
        self.should_run(Some(&to_class_file_name(class_name)), None)
    }

    /// Returns a filter that accepts tests accepted by both `self` and `other`.
    pub fn and<'a>(&'a self, other: &'a TestListResolver) -> AndFilter<'a> {
        AndFilter { a: self, b: other }
    }

    /// Returns a filter that accepts tests accepted by either `self` or `other`.
    pub fn or<'a>(&'a self, other: &'a TestListResolver) -> OrFilter<'a> {
        OrFilter { a: self, b: other }
    }

    /// Returns the patterns as a single string, e.g. `"a, b, !c"`.
    pub fn plugin_parameter_test(&self) -> String {
        let included = aggregated_test("", &self.included);
        let excluded = aggregated_test("!", &self.excluded);
        match (included.is_empty(), excluded.is_empty()) {
            (_, true) => included,
            (true, false) => excluded,
            (false, false) => format!("{included}, {excluded}"),
        }
    }

    /// Returns a comparator that ranks tests by the position of the first included pattern they
    /// match.
    pub fn test_order_comparator(&self) -> TestOrderComparator<'_> {
        TestOrderComparator { resolver: self }
    }

    fn resolve_request(&mut self, request: &str) -> Result<(), PatternError> {
        let (is_excluded, request) = match request.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, request),
        };

        if is_regex_prefixed_pattern(request)? {
            let body = &request[REGEX_PREFIX.len()..request.len() - PATTERN_SUFFIX.len()];
            let (class, method) = unwrap(body);
            let test = match (class.is_empty(), method.is_empty()) {
                (false, false) => Some(ResolvedTest::new(Some(class), Some(method), true)?),
                (false, true) => Some(ResolvedTest::class_only(class, true)?),
                (true, false) => Some(ResolvedTest::method_only(method, true)?),
                (true, true) => None,
            };
            if let Some(test) = test {
                self.add(is_excluded, test);
            }
        } else {
            if request.matches('#').count() > 1 {
                return Err(PatternError::extra_method_separator(request));
            }
            match request.split_once('#') {
                None => {
                    let test = ResolvedTest::class_only(request, false)?;
                    self.add(is_excluded, test);
                }
                Some((class, methods)) => {
                    for method in methods.split('+') {
                        let test = ResolvedTest::new(Some(class), Some(method), false)?;
                        self.add(is_excluded, test);
                    }
                }
            }
        }
        Ok(())
    }

    fn add(&mut self, is_excluded: bool, test: ResolvedTest) {
        if test.is_empty() {
            return;
        }
        if is_excluded {
            self.has_excluded_method_patterns |= test.has_method_pattern();
            self.excluded.insert(test);
        } else {
            self.has_included_method_patterns |= test.has_method_pattern();
            self.included.insert(test);
        }
    }
}

impl PartialEq for TestListResolver {
    fn eq(&self, other: &Self) -> bool {
        // IndexSet equality does not depend on order.
        self.included == other.included && self.excluded == other.excluded
    }
}

impl Eq for TestListResolver {}

impl fmt::Display for TestListResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.plugin_parameter_test())
    }
}

impl TestFilter for TestListResolver {
    fn should_run(&self, class_file: Option<&str>, method: Option<&str>) -> bool {
        TestListResolver::should_run(self, class_file, method)
    }
}

/// A filter accepting tests accepted by both resolvers. Returned by [`TestListResolver::and`].
#[derive(Clone, Copy, Debug)]
pub struct AndFilter<'a> {
    a: &'a TestListResolver,
    b: &'a TestListResolver,
}

impl TestFilter for AndFilter<'_> {
    fn should_run(&self, class_file: Option<&str>, method: Option<&str>) -> bool {
        self.a.should_run(class_file, method) && self.b.should_run(class_file, method)
    }
}

/// A filter accepting tests accepted by either resolver. Returned by [`TestListResolver::or`].
#[derive(Clone, Copy, Debug)]
pub struct OrFilter<'a> {
    a: &'a TestListResolver,
    b: &'a TestListResolver,
}

impl TestFilter for OrFilter<'_> {
    fn should_run(&self, class_file: Option<&str>, method: Option<&str>) -> bool {
        self.a.should_run(class_file, method) || self.b.should_run(class_file, method)
    }
}

/// Ranks classes and methods by the position of the first included pattern that matches them.
///
/// Entries that match no pattern sort after all entries that do. Sorting with this comparator
/// should use a stable sort so that such entries keep their relative order.
#[derive(Clone, Copy, Debug)]
pub struct TestOrderComparator<'a> {
    resolver: &'a TestListResolver,
}

impl TestOrderComparator<'_> {
    /// Returns the index of the first included class pattern matching a fully qualified class.
    pub fn class_order_index(&self, class_name: &str) -> Option<usize> {
        let class_file = to_class_file_name(class_name);
        self.resolver
            .included
            .iter()
            .position(|test| test.has_class_pattern() && test.match_class(&class_file))
    }

    /// Returns the index of the first included pattern matching a `method(Class)` description.
    pub fn method_order_index(&self, description: &str) -> Option<usize> {
        let (method, class_name) = split_method_description(description)?;
        let class_file = to_class_file_name(class_name);
        self.resolver.included.iter().position(|test| {
            test.has_method_pattern()
                && test.match_class(&class_file)
                && test.match_method(method)
        })
    }

    /// Compares two fully qualified class names.
    pub fn compare_classes(&self, a: &str, b: &str) -> Ordering {
        compare_indexes(self.class_order_index(a), self.class_order_index(b))
    }

    /// Compares two `method(Class)` descriptions.
    pub fn compare_methods(&self, a: &str, b: &str) -> Ordering {
        compare_indexes(self.method_order_index(a), self.method_order_index(b))
    }

    /// Sorts fully qualified class names in place, stably.
    pub fn sort_classes<S: AsRef<str>>(&self, classes: &mut [S]) {
        classes.sort_by_cached_key(|class| {
            self.class_order_index(class.as_ref())
                .unwrap_or(usize::MAX)
        });
    }
}

/// Converts a fully qualified class name into a class file path.
///
/// ```
/// assert_eq!(forkrun_filtering::to_class_file_name("a.b.C"), "a/b/C.class");
/// ```
pub fn to_class_file_name(class_name: &str) -> String {
    format!("{}{CLASS_FILE_EXTENSION}", class_name.replace('.', "/"))
}

fn compare_indexes(a: Option<usize>, b: Option<usize>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Splits `method(pkg.Class)` into the method and the class.
fn split_method_description(description: &str) -> Option<(&str, &str)> {
    let (method, rest) = description.split_once('(')?;
    let class_name = rest.strip_suffix(')')?;
    Some((method, class_name))
}

fn is_regex_prefixed_pattern(pattern: &str) -> Result<bool, PatternError> {
    let Some(index) = pattern.find(REGEX_PREFIX) else {
        return Ok(false);
    };
    let min_len = REGEX_PREFIX.len() + PATTERN_SUFFIX.len() + 1;
    if index != 0
        || !pattern.ends_with(PATTERN_SUFFIX)
        || pattern.len() <= min_len
        || pattern[REGEX_PREFIX.len()..].contains(REGEX_PREFIX)
    {
        return Err(PatternError::IllegalRegexToken {
            token: pattern.to_owned(),
        });
    }
    Ok(true)
}

/// Splits a regex body on its first `#`.
fn unwrap(body: &str) -> (&str, &str) {
    match body.split_once('#') {
        Some((class, method)) => (class.trim(), method.trim()),
        None => (body.trim(), ""),
    }
}

fn aggregated_test(prefix: &str, tests: &IndexSet<ResolvedTest>) -> String {
    tests
        .iter()
        .map(|test| test.to_string())
        .filter(|readable| !readable.is_empty())
        .map(|readable| format!("{prefix}{readable}"))
        .collect::<Vec<_>>()
        .join(", ")
}

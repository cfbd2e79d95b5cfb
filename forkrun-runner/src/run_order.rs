// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ordering of test classes before they are handed to forks.

use crate::{errors::RunOrderParseError, statistics::RunEntryStatisticsMap};
use camino::Utf8PathBuf;
use chrono::{DateTime, Local, Timelike};
use debug_ignore::DebugIgnore;
use forkrun_filtering::TestListResolver;
use indexmap::IndexSet;
use itertools::Itertools;
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use serde::Deserialize;
use std::{fmt, str::FromStr};
use tracing::{debug, warn};

/// A strategy for ordering test classes.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum RunOrder {
    /// Sort by fully qualified class name.
    Alphabetical,

    /// Sort by fully qualified class name, in reverse.
    ReverseAlphabetical,

    /// Shuffle, with a seed that can be reproduced.
    Random,

    /// Alphabetical during even hours, reverse alphabetical during odd hours.
    Hourly,

    /// Classes that failed last time first.
    FailedFirst,

    /// Spread classes so that forks finish at about the same time.
    Balanced,

    /// Discovery order.
    Filesystem,

    /// The order in which patterns were passed in with `--test`.
    TestOrder,
}

impl RunOrder {
    /// All run orders.
    pub const ALL: &'static [Self] = &[
        Self::Alphabetical,
        Self::ReverseAlphabetical,
        Self::Random,
        Self::Hourly,
        Self::FailedFirst,
        Self::Balanced,
        Self::Filesystem,
        Self::TestOrder,
    ];

    /// Returns the name of this run order.
    pub fn name(self) -> &'static str {
        match self {
            Self::Alphabetical => "alphabetical",
            Self::ReverseAlphabetical => "reversealphabetical",
            Self::Random => "random",
            Self::Hourly => "hourly",
            Self::FailedFirst => "failedfirst",
            Self::Balanced => "balanced",
            Self::Filesystem => "filesystem",
            Self::TestOrder => "testorder",
        }
    }

    /// Returns the names of all run orders.
    pub fn variants() -> impl Iterator<Item = &'static str> {
        Self::ALL.iter().map(|order| order.name())
    }

    /// Returns true if this run order needs the statistics file.
    pub fn uses_statistics(self) -> bool {
        matches!(self, Self::FailedFirst | Self::Balanced)
    }
}

impl FromStr for RunOrder {
    type Err = RunOrderParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|order| order.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| RunOrderParseError::UnknownName { name: s.to_owned() })
    }
}

impl fmt::Display for RunOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A run order with positional arguments, e.g. `random:123322`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunOrderWithArguments {
    run_order: RunOrder,
    arguments: Vec<String>,
}

impl RunOrderWithArguments {
    /// Creates a run order without arguments.
    pub fn new(run_order: RunOrder) -> Self {
        Self {
            run_order,
            arguments: Vec::new(),
        }
    }

    /// Returns the run order.
    pub fn run_order(&self) -> RunOrder {
        self.run_order
    }

    /// Returns the positional arguments.
    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }
}

impl fmt::Display for RunOrderWithArguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.run_order)?;
        for argument in &self.arguments {
            write!(f, ":{argument}")?;
        }
        Ok(())
    }
}

/// A list of run orders, as parsed from `failedfirst,balanced` or `random:123322`.
///
/// Only the first run order decides how classes are ordered.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RunOrders {
    orders: Vec<RunOrderWithArguments>,
}

impl RunOrders {
    /// Creates a list of run orders without arguments.
    pub fn new(orders: impl IntoIterator<Item = RunOrder>) -> Self {
        Self {
            orders: orders.into_iter().map(RunOrderWithArguments::new).collect(),
        }
    }

    /// Returns true if there are no run orders.
    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Iterates over the run orders.
    pub fn iter(&self) -> impl Iterator<Item = &RunOrderWithArguments> + '_ {
        self.orders.iter()
    }

    /// Returns the first run order, which is the one that decides ordering.
    pub fn first(&self) -> Option<RunOrder> {
        self.orders.first().map(|order| order.run_order)
    }

    /// Returns true if any of the run orders is `run_order`.
    pub fn contains(&self, run_order: RunOrder) -> bool {
        self.orders.iter().any(|order| order.run_order == run_order)
    }

    /// Returns the arguments of the first occurrence of `run_order`.
    pub fn arguments(&self, run_order: RunOrder) -> Option<&[String]> {
        self.orders
            .iter()
            .find(|order| order.run_order == run_order)
            .map(|order| order.arguments())
    }

    /// Returns the seed passed in as `random:<seed>`, if any.
    pub fn random_seed(&self) -> Option<u64> {
        self.arguments(RunOrder::Random)?.first()?.parse().ok()
    }
}

impl FromStr for RunOrders {
    type Err = RunOrderParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let orders = input
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let mut parts = entry.split(':');
                let run_order: RunOrder = parts.next().unwrap_or_default().trim().parse()?;
                let arguments: Vec<String> = parts.map(|arg| arg.trim().to_owned()).collect();
                if run_order == RunOrder::Random {
                    if let Some(seed) = arguments.first() {
                        seed.parse::<u64>()
                            .map_err(|error| RunOrderParseError::InvalidRandomSeed {
                                seed: seed.clone(),
                                error,
                            })?;
                    }
                }
                Ok(RunOrderWithArguments {
                    run_order,
                    arguments,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if orders.len() > 1 && orders.iter().any(|o| o.run_order == RunOrder::TestOrder) {
            return Err(RunOrderParseError::TestOrderNotAlone {
                input: input.to_owned(),
            });
        }
        Ok(Self { orders })
    }
}

impl<'de> Deserialize<'de> for RunOrders {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for RunOrders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.orders.iter().join(","))
    }
}

/// Everything needed to order test classes.
#[derive(Clone, Debug, Default)]
pub struct RunOrderParameters {
    /// The run orders.
    pub run_orders: RunOrders,

    /// Where run history is kept. Without a file, failed-first and balanced orders have no
    /// history to work with.
    pub statistics_file: Option<Utf8PathBuf>,

    /// The seed for the random order. Filled in by [`RunOrderCalculator::new`] if not set.
    pub random_seed: Option<u64>,
}

impl RunOrderParameters {
    /// Creates parameters without a statistics file or a seed.
    pub fn new(run_orders: RunOrders) -> Self {
        Self {
            run_orders,
            statistics_file: None,
            random_seed: None,
        }
    }

    /// Sets the statistics file.
    pub fn with_statistics_file(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.statistics_file = Some(path.into());
        self
    }

    /// Sets the random seed.
    pub fn with_random_seed(mut self, seed: u64) -> Self {
        self.random_seed = Some(seed);
        self
    }
}

/// An ordered list of fully qualified test class names, without duplicates.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TestsToRun {
    classes: IndexSet<String>,
}

impl TestsToRun {
    /// Creates a list from class names. Later duplicates are dropped.
    pub fn new<I, S>(classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            classes: classes.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns the number of classes.
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Returns true if there are no classes.
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Returns true if the class is in the list.
    pub fn contains(&self, class_name: &str) -> bool {
        self.classes.contains(class_name)
    }

    /// Iterates over class names in order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = &str> + '_ {
        self.classes.iter().map(String::as_str)
    }

    /// Returns the class names in order.
    pub fn into_vec(self) -> Vec<String> {
        self.classes.into_iter().collect()
    }
}

impl<S: Into<String>> FromIterator<S> for TestsToRun {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self::new(iter)
    }
}

impl IntoIterator for TestsToRun {
    type Item = String;
    type IntoIter = indexmap::set::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.classes.into_iter()
    }
}

type Clock = DebugIgnore<Box<dyn Fn() -> DateTime<Local> + Send + Sync>>;

/// Orders test classes according to [`RunOrderParameters`].
#[derive(Debug)]
pub struct RunOrderCalculator {
    parameters: RunOrderParameters,
    random_seed: u64,
    thread_count: usize,
    test_order: Option<TestListResolver>,
    clock: Clock,
}

impl RunOrderCalculator {
    /// Creates a new calculator.
    ///
    /// The random seed is taken from the parameters, then from a `random:<seed>` argument, and is
    /// generated otherwise. Either way it is stored back into the parameters.
    ///
    /// `test_order` is the resolver whose pattern order the `testorder` strategy follows.
    pub fn new(
        mut parameters: RunOrderParameters,
        thread_count: usize,
        test_order: Option<TestListResolver>,
    ) -> Self {
        let random_seed = parameters
            .random_seed
            .or_else(|| parameters.run_orders.random_seed())
            .unwrap_or_else(rand::random);
        parameters.random_seed = Some(random_seed);
        Self {
            parameters,
            random_seed,
            thread_count: thread_count.max(1),
            test_order,
            clock: DebugIgnore(Box::new(Local::now)),
        }
    }

    /// Replaces the clock used by the `hourly` strategy.
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Local> + Send + Sync + 'static) -> Self {
        self.clock = DebugIgnore(Box::new(clock));
        self
    }

    /// Returns the parameters, with the random seed filled in.
    pub fn parameters(&self) -> &RunOrderParameters {
        &self.parameters
    }

    /// Returns the random seed.
    pub fn random_seed(&self) -> u64 {
        self.random_seed
    }

    /// Orders test classes using the first run order. Other run orders are ignored.
    pub fn order_test_classes(&self, tests: TestsToRun) -> TestsToRun {
        let mut classes = tests.into_vec();
        match self.parameters.run_orders.first() {
            Some(RunOrder::Alphabetical) => classes.sort(),
            Some(RunOrder::ReverseAlphabetical) => classes.sort_by(|a, b| b.cmp(a)),
            Some(RunOrder::Hourly) => {
                let hour = (self.clock.0)().hour();
                debug!("hourly run order at hour {hour}");
                if hour % 2 == 0 {
                    classes.sort();
                } else {
                    classes.sort_by(|a, b| b.cmp(a));
                }
            }
            Some(RunOrder::Random) => {
                let mut rng = StdRng::seed_from_u64(self.random_seed);
                classes.shuffle(&mut rng);
            }
            Some(RunOrder::FailedFirst) => {
                classes = self.statistics().prioritized_tests_by_failure_first(&classes);
            }
            Some(RunOrder::Balanced) => {
                classes = self
                    .statistics()
                    .prioritized_tests_class_run_time(&classes, self.thread_count);
            }
            Some(RunOrder::TestOrder) => {
                if let Some(resolver) = &self.test_order {
                    resolver.test_order_comparator().sort_classes(&mut classes);
                }
            }
            Some(RunOrder::Filesystem) | None => {}
        }
        TestsToRun::new(classes)
    }

    fn statistics(&self) -> RunEntryStatisticsMap {
        let Some(path) = &self.parameters.statistics_file else {
            return RunEntryStatisticsMap::new();
        };
        RunEntryStatisticsMap::from_file(path).unwrap_or_else(|error| {
            warn!("ignoring run statistics: {error}");
            RunEntryStatisticsMap::new()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use chrono::TimeZone;
    use test_case::test_case;
    use test_strategy::proptest;

    #[test_case("hourly" => Ok(vec![RunOrder::Hourly]); "lower case")]
    #[test_case("HOURLY" => Ok(vec![RunOrder::Hourly]); "upper case")]
    #[test_case("failedfirst, Balanced" => Ok(vec![RunOrder::FailedFirst, RunOrder::Balanced]); "multiple")]
    #[test_case("" => Ok(vec![]); "empty")]
    #[test_case("testorder" => Ok(vec![RunOrder::TestOrder]); "test order alone")]
    fn parse(input: &str) -> Result<Vec<RunOrder>, String> {
        input
            .parse::<RunOrders>()
            .map(|orders| orders.iter().map(|o| o.run_order()).collect())
            .map_err(|error| error.to_string())
    }

    #[test]
    fn parse_errors() {
        let error = "alphabetical,arbitraryName".parse::<RunOrders>().unwrap_err();
        assert_eq!(
            error.to_string(),
            "There's no RunOrder with the name arbitraryName. Please use one of the following \
             RunOrders: alphabetical, reversealphabetical, random, hourly, failedfirst, balanced, \
             filesystem, testorder."
        );

        let error = "testorder,alphabetical".parse::<RunOrders>().unwrap_err();
        assert!(matches!(error, RunOrderParseError::TestOrderNotAlone { .. }));

        let error = "random:abc".parse::<RunOrders>().unwrap_err();
        assert!(matches!(error, RunOrderParseError::InvalidRandomSeed { .. }));
    }

    #[test]
    fn arguments() {
        let orders: RunOrders = "random:123322,failedfirst".parse().unwrap();
        assert_eq!(orders.first(), Some(RunOrder::Random));
        assert_eq!(
            orders.arguments(RunOrder::Random),
            Some(&["123322".to_owned()][..])
        );
        assert_eq!(orders.random_seed(), Some(123322));
        assert!(orders.contains(RunOrder::FailedFirst));
        assert_eq!(orders.to_string(), "random:123322,failedfirst");
    }

    #[proptest]
    fn display_round_trips(
        #[strategy(proptest::collection::vec(proptest::sample::select(RunOrder::ALL), 0..4))]
        orders: Vec<RunOrder>,
    ) {
        let orders: Vec<_> = orders
            .into_iter()
            .filter(|order| *order != RunOrder::TestOrder)
            .collect();
        let canonical = orders.iter().map(|order| order.name()).join(",");
        let parsed: RunOrders = canonical.parse().unwrap();
        assert_eq!(parsed.to_string(), canonical);
        assert_eq!(parsed, RunOrders::new(orders));
    }

    fn classes() -> TestsToRun {
        TestsToRun::new(["pkg.B", "pkg.C", "pkg.A", "pkg.B"])
    }

    fn calculator(run_orders: &str) -> RunOrderCalculator {
        RunOrderCalculator::new(
            RunOrderParameters::new(run_orders.parse().unwrap()),
            1,
            None,
        )
    }

    #[test]
    fn tests_to_run_dedups() {
        assert_eq!(classes().into_vec(), ["pkg.B", "pkg.C", "pkg.A"]);
    }

    #[test]
    fn sort_orders() {
        let ordered = calculator("alphabetical").order_test_classes(classes());
        assert_eq!(ordered.into_vec(), ["pkg.A", "pkg.B", "pkg.C"]);

        let ordered = calculator("reversealphabetical,alphabetical").order_test_classes(classes());
        assert_eq!(ordered.into_vec(), ["pkg.C", "pkg.B", "pkg.A"]);

        let ordered = calculator("filesystem").order_test_classes(classes());
        assert_eq!(ordered.into_vec(), ["pkg.B", "pkg.C", "pkg.A"]);

        let ordered = calculator("").order_test_classes(classes());
        assert_eq!(ordered.into_vec(), ["pkg.B", "pkg.C", "pkg.A"]);
    }

    #[test]
    fn hourly() {
        let at_hour = |hour| {
            move || {
                Local
                    .with_ymd_and_hms(2024, 1, 1, hour, 30, 0)
                    .earliest()
                    .unwrap()
            }
        };
        let ordered = calculator("hourly")
            .with_clock(at_hour(10))
            .order_test_classes(classes());
        assert_eq!(ordered.into_vec(), ["pkg.A", "pkg.B", "pkg.C"]);

        let ordered = calculator("hourly")
            .with_clock(at_hour(11))
            .order_test_classes(classes());
        assert_eq!(ordered.into_vec(), ["pkg.C", "pkg.B", "pkg.A"]);
    }

    #[test]
    fn random_is_reproducible() {
        let many = TestsToRun::new((0..50).map(|i| format!("pkg.Test{i}")));
        let first = RunOrderCalculator::new(
            RunOrderParameters::new("random".parse().unwrap()).with_random_seed(42),
            1,
            None,
        );
        let second = calculator("random:42");
        assert_eq!(second.parameters().random_seed, Some(42));

        let a = first.order_test_classes(many.clone());
        assert_eq!(a, first.order_test_classes(many.clone()));
        assert_eq!(a, second.order_test_classes(many.clone()));
        assert_ne!(a, many);
    }

    #[test]
    fn generated_seed_is_stored() {
        let calculator = calculator("random");
        assert_eq!(
            calculator.parameters().random_seed,
            Some(calculator.random_seed())
        );
    }

    #[test]
    fn statistics_orders() {
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("stats");
        std::fs::write(&path, "1,10,pkg.A,a\n0,5,pkg.B,b\n1,100,pkg.C,c\n").unwrap();

        let with_stats = |run_orders: &str, thread_count| {
            RunOrderCalculator::new(
                RunOrderParameters::new(run_orders.parse().unwrap()).with_statistics_file(&path),
                thread_count,
                None,
            )
        };
        let input = || TestsToRun::new(["pkg.A", "pkg.B", "pkg.C"]);

        let ordered = with_stats("failedfirst", 1).order_test_classes(input());
        assert_eq!(ordered.into_vec(), ["pkg.B", "pkg.A", "pkg.C"]);

        let ordered = with_stats("balanced", 2).order_test_classes(input());
        assert_eq!(ordered.into_vec(), ["pkg.C", "pkg.A", "pkg.B"]);

        // A missing file is no history.
        let ordered = RunOrderCalculator::new(
            RunOrderParameters::new("failedfirst".parse().unwrap())
                .with_statistics_file(dir.path().join("missing")),
            1,
            None,
        )
        .order_test_classes(input());
        assert_eq!(ordered.into_vec(), ["pkg.A", "pkg.B", "pkg.C"]);
    }

    #[test]
    fn test_order() {
        let resolver = TestListResolver::new("pkg/C*, pkg/A*").unwrap();
        let calculator = RunOrderCalculator::new(
            RunOrderParameters::new("testorder".parse().unwrap()),
            1,
            Some(resolver),
        );
        let ordered = calculator.order_test_classes(TestsToRun::new(["pkg.A", "pkg.B", "pkg.C"]));
        assert_eq!(ordered.into_vec(), ["pkg.C", "pkg.A", "pkg.B"]);
    }
}

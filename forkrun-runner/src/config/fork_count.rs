// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::ForkCountParseError;
use serde::Deserialize;
use std::{fmt, str::FromStr, sync::LazyLock};
use tracing::warn;

/// Gets the number of available CPUs and caches the value.
#[inline]
pub fn get_num_cpus() -> usize {
    static NUM_CPUS: LazyLock<usize> =
        LazyLock::new(|| match std::thread::available_parallelism() {
            Ok(count) => count.into(),
            Err(err) => {
                warn!("unable to determine num-cpus ({err}), assuming 1 logical CPU");
                1
            }
        });

    *NUM_CPUS
}

/// Type for the fork-count config key.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ForkCount {
    /// Run a fixed number of forks.
    Count(usize),

    /// Run as many forks as there are logical CPUs.
    NumCpus,

    /// Run a multiple of the number of logical CPUs, e.g. `1.5C`.
    PerCpu(f64),
}

impl ForkCount {
    /// Gets the actual number of forks computed at runtime. Always at least 1.
    pub fn compute(self) -> usize {
        match self {
            Self::Count(count) => count.max(1),
            Self::NumCpus => get_num_cpus(),
            Self::PerCpu(factor) => ((get_num_cpus() as f64) * factor).floor().max(1.0) as usize,
        }
    }
}

impl FromStr for ForkCount {
    type Err = ForkCountParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "num-cpus" {
            return Ok(Self::NumCpus);
        }
        if let Some(factor) = s.strip_suffix(['C', 'c']) {
            return match factor.parse::<f64>() {
                Ok(factor) if factor > 0.0 && factor.is_finite() => Ok(Self::PerCpu(factor)),
                _ => Err(ForkCountParseError::new(s)),
            };
        }
        match s.parse::<usize>() {
            Ok(0) | Err(_) => Err(ForkCountParseError::new(s)),
            Ok(count) => Ok(Self::Count(count)),
        }
    }
}

impl fmt::Display for ForkCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count(count) => write!(f, "{count}"),
            Self::NumCpus => write!(f, "num-cpus"),
            Self::PerCpu(factor) => write!(f, "{factor}C"),
        }
    }
}

impl<'de> Deserialize<'de> for ForkCount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;

        impl serde::de::Visitor<'_> for V {
            type Value = ForkCount;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(
                    formatter,
                    "a positive integer, the string \"num-cpus\", or a CPU multiple such as \"1.5C\""
                )
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                v.parse().map_err(|_| {
                    serde::de::Error::invalid_value(serde::de::Unexpected::Str(v), &self)
                })
            }

            // Note that TOML uses i64, not u64.
            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v > 0 {
                    Ok(ForkCount::Count(v as usize))
                } else {
                    Err(serde::de::Error::invalid_value(
                        serde::de::Unexpected::Signed(v),
                        &self,
                    ))
                }
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v > 0 {
                    Ok(ForkCount::Count(v as usize))
                } else {
                    Err(serde::de::Error::invalid_value(
                        serde::de::Unexpected::Unsigned(v),
                        &self,
                    ))
                }
            }
        }

        deserializer.deserialize_any(V)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("3" => Some(ForkCount::Count(3)); "count")]
    #[test_case("num-cpus" => Some(ForkCount::NumCpus); "num cpus")]
    #[test_case("1.5C" => Some(ForkCount::PerCpu(1.5)); "per cpu")]
    #[test_case("2c" => Some(ForkCount::PerCpu(2.0)); "lower case")]
    #[test_case("0" => None; "zero")]
    #[test_case("0C" => None; "zero per cpu")]
    #[test_case("many" => None; "garbage")]
    fn parse(input: &str) -> Option<ForkCount> {
        input.parse().ok()
    }

    #[test]
    fn compute() {
        assert_eq!(ForkCount::Count(4).compute(), 4);
        assert_eq!(ForkCount::NumCpus.compute(), get_num_cpus());
        assert!(ForkCount::PerCpu(0.01).compute() >= 1);
    }
}

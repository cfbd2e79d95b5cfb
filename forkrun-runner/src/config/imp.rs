// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::ForkCount;
use crate::{
    errors::{ConfigParseError, ConfigParseErrorKind, ProfileNotFound},
    run_order::{RunOrderParameters, RunOrders},
};
use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, ConfigBuilder, ConfigError, File, FileFormat, builder::DefaultState};
use serde::Deserialize;
use std::{
    collections::{BTreeSet, HashMap},
    time::Duration,
};
use tracing::warn;

/// Overall configuration for forkrun.
///
/// Most settings live in [profiles](ForkrunProfile), obtained through the
/// [`profile`](Self::profile) method.
#[derive(Clone, Debug)]
pub struct ForkrunConfig {
    workspace_root: Utf8PathBuf,
    inner: ForkrunConfigImpl,
}

impl ForkrunConfig {
    /// The default location of the config within the workspace: `.config/forkrun.toml`.
    pub const CONFIG_PATH: &'static str = ".config/forkrun.toml";

    /// Contains the default config as a TOML file.
    ///
    /// Repository-specific configuration is layered on top of the default config.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../../default-config.toml");

    /// The name of the default profile.
    pub const DEFAULT_PROFILE: &'static str = "default";

    /// Reads the config from the given file, or if not specified from `.config/forkrun.toml` in
    /// the workspace root.
    ///
    /// If no config file is specified and the workspace doesn't have `.config/forkrun.toml`, uses
    /// the default config options.
    pub fn from_sources(
        workspace_root: impl Into<Utf8PathBuf>,
        config_file: Option<&Utf8Path>,
    ) -> Result<Self, ConfigParseError> {
        Self::from_sources_impl(workspace_root, config_file, |config_file, unknown| {
            let mut unknown_str = String::new();
            if unknown.len() == 1 {
                // Print this on the same line.
                unknown_str.push(' ');
                unknown_str.extend(unknown.iter().next().map(String::as_str));
            } else {
                for ignored_key in unknown {
                    unknown_str.push('\n');
                    unknown_str.push_str("  - ");
                    unknown_str.push_str(ignored_key);
                }
            }

            warn!("ignoring unknown configuration keys in config file {config_file}:{unknown_str}")
        })
    }

    // A custom unknown_callback can be passed in while testing.
    fn from_sources_impl(
        workspace_root: impl Into<Utf8PathBuf>,
        config_file: Option<&Utf8Path>,
        mut unknown_callback: impl FnMut(&Utf8Path, &BTreeSet<String>),
    ) -> Result<Self, ConfigParseError> {
        let workspace_root = workspace_root.into();
        let (config_file, source) = match config_file {
            Some(file) => (file.to_owned(), File::new(file.as_str(), FileFormat::Toml)),
            None => {
                let config_file = workspace_root.join(Self::CONFIG_PATH);
                let source = File::new(config_file.as_str(), FileFormat::Toml).required(false);
                (config_file, source)
            }
        };

        let builder = Self::make_default_config().add_source(source);
        let (inner, unknown) = Self::build_and_deserialize_config(&builder)
            .map_err(|kind| ConfigParseError::new(&config_file, kind))?;
        if !unknown.is_empty() {
            unknown_callback(&config_file, &unknown);
        }

        Ok(Self {
            workspace_root,
            inner: inner.into_config_impl(),
        })
    }

    /// Returns the default config.
    pub fn default_config(workspace_root: impl Into<Utf8PathBuf>) -> Self {
        let config = Self::make_default_config()
            .build()
            .expect("default config is always valid");
        let deserialized: ForkrunConfigDeserialize = config
            .try_deserialize()
            .expect("default config is always valid");
        Self {
            workspace_root: workspace_root.into(),
            inner: deserialized.into_config_impl(),
        }
    }

    /// Returns the workspace root.
    pub fn workspace_root(&self) -> &Utf8Path {
        &self.workspace_root
    }

    /// Returns the profile with the given name, or an error if it is not known.
    pub fn profile(&self, name: impl AsRef<str>) -> Result<ForkrunProfile<'_>, ProfileNotFound> {
        let name = name.as_ref();
        let custom_profile = self.inner.get_profile(name)?;
        Ok(ForkrunProfile {
            name: name.to_owned(),
            workspace_root: &self.workspace_root,
            default_profile: &self.inner.default_profile,
            custom_profile,
        })
    }

    /// Returns the names of all known profiles, sorted.
    pub fn profile_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.inner.all_profiles().collect();
        names.sort_unstable();
        names
    }

    fn make_default_config() -> ConfigBuilder<DefaultState> {
        Config::builder().add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
    }

    /// This returns a tuple of (config, ignored paths).
    fn build_and_deserialize_config(
        builder: &ConfigBuilder<DefaultState>,
    ) -> Result<(ForkrunConfigDeserialize, BTreeSet<String>), ConfigParseErrorKind> {
        let config = builder
            .build_cloned()
            .map_err(|error| ConfigParseErrorKind::BuildError(Box::new(error)))?;

        let mut ignored = BTreeSet::new();
        let mut cb = |path: serde_ignored::Path| {
            ignored.insert(path.to_string());
        };
        let ignored_de = serde_ignored::Deserializer::new(config, &mut cb);
        let config: ForkrunConfigDeserialize = serde_path_to_error::deserialize(ignored_de)
            .map_err(|error| {
                // serde_path_to_error already tracks the key, so drop it from the config error.
                let path = error.path().clone();
                let error = match error.into_inner() {
                    ConfigError::At { error, .. } => *error,
                    other => other,
                };
                ConfigParseErrorKind::DeserializeError(Box::new(serde_path_to_error::Error::new(
                    path, error,
                )))
            })?;

        Ok((config, ignored))
    }
}

/// A configuration profile. Named profiles fall back to the default profile field by field.
///
/// Returned by [`ForkrunConfig::profile`].
#[derive(Clone, Debug)]
pub struct ForkrunProfile<'cfg> {
    name: String,
    workspace_root: &'cfg Utf8Path,
    default_profile: &'cfg DefaultProfileImpl,
    custom_profile: Option<&'cfg CustomProfileImpl>,
}

impl<'cfg> ForkrunProfile<'cfg> {
    /// Returns the name of the profile.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the patterns selecting classes and methods, in `--test` syntax.
    pub fn test(&self) -> &'cfg str {
        self.custom_profile
            .and_then(|profile| profile.test.as_deref())
            .unwrap_or(&self.default_profile.test)
    }

    /// Returns the class files to scan for. Empty means the built-in list.
    pub fn includes(&self) -> &'cfg [String] {
        self.custom_profile
            .and_then(|profile| profile.includes.as_deref())
            .unwrap_or(&self.default_profile.includes)
    }

    /// Returns the class files to skip. Empty means the built-in list.
    pub fn excludes(&self) -> &'cfg [String] {
        self.custom_profile
            .and_then(|profile| profile.excludes.as_deref())
            .unwrap_or(&self.default_profile.excludes)
    }

    /// Returns the run orders.
    pub fn run_orders(&self) -> &'cfg RunOrders {
        self.custom_profile
            .and_then(|profile| profile.run_order.as_ref())
            .unwrap_or(&self.default_profile.run_order)
    }

    /// Returns the configured random seed, if any.
    pub fn run_order_random_seed(&self) -> Option<u64> {
        self.custom_profile
            .and_then(|profile| profile.run_order_random_seed)
            .or(self.default_profile.run_order_random_seed)
    }

    /// Returns the absolute path to the run statistics file.
    ///
    /// Unless configured, the file is named after a checksum of the test selection and the fork
    /// command, so that differently configured runs keep separate histories.
    pub fn statistics_file(&self) -> Utf8PathBuf {
        let configured = self
            .custom_profile
            .and_then(|profile| profile.statistics_file.as_ref())
            .or(self.default_profile.statistics_file.as_ref());
        match configured {
            Some(path) => self.workspace_root.join(path),
            None => self
                .workspace_root
                .join(format!(".forkrun-{:016x}", self.configuration_checksum())),
        }
    }

    fn configuration_checksum(&self) -> u64 {
        let mut input = String::new();
        let test = [self.test().to_owned()];
        let sections = [
            &test[..],
            self.includes(),
            self.excludes(),
            self.fork_command(),
        ];
        for section in sections {
            for item in section {
                input.push_str(item);
                input.push('\0');
            }
            input.push('\n');
        }
        xxhash_rust::xxh3::xxh3_64(input.as_bytes())
    }

    /// Returns the parameters for the run-order calculator.
    pub fn run_order_parameters(&self) -> RunOrderParameters {
        RunOrderParameters {
            run_orders: self.run_orders().clone(),
            statistics_file: Some(self.statistics_file()),
            random_seed: self.run_order_random_seed(),
        }
    }

    /// Returns the number of forks to run at once.
    pub fn fork_count(&self) -> ForkCount {
        self.custom_profile
            .and_then(|profile| profile.fork_count)
            .unwrap_or(self.default_profile.fork_count)
    }

    /// Returns true if forks run more than one class.
    pub fn reuse_forks(&self) -> bool {
        self.custom_profile
            .and_then(|profile| profile.reuse_forks)
            .unwrap_or(self.default_profile.reuse_forks)
    }

    /// Returns the command that starts a fork.
    pub fn fork_command(&self) -> &'cfg [String] {
        self.custom_profile
            .and_then(|profile| profile.fork_command.as_deref())
            .unwrap_or(&self.default_profile.fork_command)
    }

    /// Returns the time after which forks are killed, or `None` for no timeout.
    pub fn forked_process_timeout(&self) -> Option<Duration> {
        let timeout = self
            .custom_profile
            .and_then(|profile| profile.forked_process_timeout)
            .unwrap_or(self.default_profile.forked_process_timeout);
        (!timeout.is_zero()).then_some(timeout)
    }

    /// Returns the number of failures after which remaining tests are skipped, or `None`.
    pub fn skip_after_failure_count(&self) -> Option<usize> {
        let count = self
            .custom_profile
            .and_then(|profile| profile.skip_after_failure_count)
            .unwrap_or(self.default_profile.skip_after_failure_count);
        (count > 0).then_some(count)
    }

    /// Returns the absolute directory for dump files.
    pub fn dump_dir(&self) -> Utf8PathBuf {
        let dir = self
            .custom_profile
            .and_then(|profile| profile.dump_dir.as_ref())
            .unwrap_or(&self.default_profile.dump_dir);
        self.workspace_root.join(dir)
    }

    /// Returns the absolute path of the file that receives every byte read from forks, if any.
    pub fn debug_stream_file(&self) -> Option<Utf8PathBuf> {
        self.custom_profile
            .and_then(|profile| profile.debug_stream_file.as_ref())
            .or(self.default_profile.debug_stream_file.as_ref())
            .map(|path| self.workspace_root.join(path))
    }
}

#[derive(Clone, Debug)]
struct ForkrunConfigImpl {
    default_profile: DefaultProfileImpl,
    other_profiles: HashMap<String, CustomProfileImpl>,
}

impl ForkrunConfigImpl {
    fn get_profile(&self, profile: &str) -> Result<Option<&CustomProfileImpl>, ProfileNotFound> {
        let custom_profile = match profile {
            ForkrunConfig::DEFAULT_PROFILE => None,
            other => Some(
                self.other_profiles
                    .get(other)
                    .ok_or_else(|| ProfileNotFound::new(profile, self.all_profiles()))?,
            ),
        };
        Ok(custom_profile)
    }

    fn all_profiles(&self) -> impl Iterator<Item = &str> {
        self.other_profiles
            .keys()
            .map(|key| key.as_str())
            .chain(std::iter::once(ForkrunConfig::DEFAULT_PROFILE))
    }
}

// This is the form of `ForkrunConfig` that gets deserialized.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ForkrunConfigDeserialize {
    #[serde(rename = "profile")]
    profiles: HashMap<String, CustomProfileImpl>,
}

impl ForkrunConfigDeserialize {
    fn into_config_impl(mut self) -> ForkrunConfigImpl {
        let p = self
            .profiles
            .remove(ForkrunConfig::DEFAULT_PROFILE)
            .expect("default profile should exist");
        ForkrunConfigImpl {
            default_profile: DefaultProfileImpl::new(p),
            other_profiles: self.profiles,
        }
    }
}

#[derive(Clone, Debug)]
struct DefaultProfileImpl {
    test: String,
    includes: Vec<String>,
    excludes: Vec<String>,
    run_order: RunOrders,
    run_order_random_seed: Option<u64>,
    statistics_file: Option<Utf8PathBuf>,
    fork_count: ForkCount,
    reuse_forks: bool,
    fork_command: Vec<String>,
    forked_process_timeout: Duration,
    skip_after_failure_count: usize,
    dump_dir: Utf8PathBuf,
    debug_stream_file: Option<Utf8PathBuf>,
}

impl DefaultProfileImpl {
    fn new(p: CustomProfileImpl) -> Self {
        Self {
            test: p.test.expect("test present in default profile"),
            includes: p.includes.expect("includes present in default profile"),
            excludes: p.excludes.expect("excludes present in default profile"),
            run_order: p.run_order.expect("run-order present in default profile"),
            run_order_random_seed: p.run_order_random_seed,
            statistics_file: p.statistics_file,
            fork_count: p.fork_count.expect("fork-count present in default profile"),
            reuse_forks: p.reuse_forks.expect("reuse-forks present in default profile"),
            fork_command: p
                .fork_command
                .expect("fork-command present in default profile"),
            forked_process_timeout: p
                .forked_process_timeout
                .expect("forked-process-timeout present in default profile"),
            skip_after_failure_count: p
                .skip_after_failure_count
                .expect("skip-after-failure-count present in default profile"),
            dump_dir: p.dump_dir.expect("dump-dir present in default profile"),
            debug_stream_file: p.debug_stream_file,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct CustomProfileImpl {
    #[serde(default)]
    test: Option<String>,
    #[serde(default)]
    includes: Option<Vec<String>>,
    #[serde(default)]
    excludes: Option<Vec<String>>,
    #[serde(default)]
    run_order: Option<RunOrders>,
    #[serde(default)]
    run_order_random_seed: Option<u64>,
    #[serde(default)]
    statistics_file: Option<Utf8PathBuf>,
    #[serde(default)]
    fork_count: Option<ForkCount>,
    #[serde(default)]
    reuse_forks: Option<bool>,
    #[serde(default)]
    fork_command: Option<Vec<String>>,
    #[serde(default, with = "humantime_serde::option")]
    forked_process_timeout: Option<Duration>,
    #[serde(default)]
    skip_after_failure_count: Option<usize>,
    #[serde(default)]
    dump_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    debug_stream_file: Option<Utf8PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_order::RunOrder;
    use camino_tempfile::Utf8TempDir;
    use indoc::indoc;

    fn workspace(config_contents: &str) -> Utf8TempDir {
        let dir = Utf8TempDir::new().unwrap();
        let config_path = dir.path().join(ForkrunConfig::CONFIG_PATH);
        std::fs::create_dir_all(config_path.parent().unwrap()).unwrap();
        std::fs::write(&config_path, config_contents).unwrap();
        dir
    }

    #[test]
    fn default_config_is_valid() {
        let config = ForkrunConfig::default_config("/ws");
        let profile = config
            .profile(ForkrunConfig::DEFAULT_PROFILE)
            .expect("default profile should exist");
        assert_eq!(profile.test(), "");
        assert_eq!(profile.run_orders().first(), Some(RunOrder::Filesystem));
        assert_eq!(profile.fork_count(), ForkCount::Count(1));
        assert!(profile.reuse_forks());
        assert_eq!(profile.forked_process_timeout(), None);
        assert_eq!(profile.skip_after_failure_count(), None);
        assert_eq!(profile.dump_dir(), "/ws/target/forkrun-reports");
        assert_eq!(profile.debug_stream_file(), None);
        assert!(
            profile
                .statistics_file()
                .as_str()
                .starts_with("/ws/.forkrun-")
        );

        let ci = config.profile("ci").unwrap();
        assert_eq!(
            ci.forked_process_timeout(),
            Some(Duration::from_secs(30 * 60))
        );
        assert_eq!(config.profile_names(), ["ci", "default"]);
    }

    #[test]
    fn profiles_fall_back_to_default() {
        let dir = workspace(indoc! {r#"
            [profile.default]
            fork-count = 3
            test = "pkg.*Test"

            [profile.nightly]
            run-order = "random:42"
            reuse-forks = false
            statistics-file = "stats/forkrun.txt"
        "#});
        let config = ForkrunConfig::from_sources(dir.path(), None).unwrap();

        let nightly = config.profile("nightly").unwrap();
        assert_eq!(nightly.name(), "nightly");
        assert_eq!(nightly.fork_count(), ForkCount::Count(3));
        assert_eq!(nightly.test(), "pkg.*Test");
        assert!(!nightly.reuse_forks());
        assert_eq!(nightly.run_orders().random_seed(), Some(42));
        assert_eq!(
            nightly.statistics_file(),
            dir.path().join("stats/forkrun.txt")
        );

        let params = nightly.run_order_parameters();
        assert_eq!(params.statistics_file, Some(nightly.statistics_file()));
        assert_eq!(params.random_seed, None);

        let error = config.profile("missing").unwrap_err();
        assert_eq!(
            error.to_string(),
            "profile `missing` not found (known profiles: ci, default, nightly)"
        );
    }

    #[test]
    fn statistics_file_depends_on_selection() {
        let dir = workspace(indoc! {r#"
            [profile.other]
            test = "pkg.OtherTest"
        "#});
        let config = ForkrunConfig::from_sources(dir.path(), None).unwrap();
        let default = config.profile("default").unwrap().statistics_file();
        let other = config.profile("other").unwrap().statistics_file();
        assert_ne!(default, other);
        assert_eq!(default, config.profile("ci").unwrap().statistics_file());
    }

    #[test]
    fn ignored_keys() {
        let dir = workspace(indoc! {r#"
            ignored1 = "test"

            [profile.default]
            fork-count = 2
            ignored2 = "hi"

            [profile.custom]
            ignored3 = 42
        "#});

        let mut unknown_keys = None;
        ForkrunConfig::from_sources_impl(dir.path(), None, |_path, ignored| {
            unknown_keys = Some(ignored.clone());
        })
        .expect("config is valid");

        assert_eq!(
            unknown_keys.expect("unknown keys reported"),
            maplit::btreeset! {
                "ignored1".to_owned(),
                "profile.default.ignored2".to_owned(),
                "profile.custom.ignored3".to_owned(),
            }
        );
    }

    #[test]
    fn invalid_values() {
        let dir = workspace(indoc! {r#"
            [profile.default]
            run-order = "bogus"
        "#});
        let error = ForkrunConfig::from_sources(dir.path(), None).unwrap_err();
        assert!(matches!(
            error.kind(),
            ConfigParseErrorKind::DeserializeError(_)
        ));
        assert!(
            error
                .kind()
                .to_string()
                .contains("There's no RunOrder with the name bogus"),
            "unexpected error: {}",
            error.kind()
        );

        let dir = workspace(indoc! {r#"
            [profile.default]
            fork-count = 0
        "#});
        assert!(ForkrunConfig::from_sources(dir.path(), None).is_err());
    }

    #[test]
    fn explicit_config_file_must_exist() {
        let dir = Utf8TempDir::new().unwrap();
        let missing = dir.path().join("forkrun.toml");
        let error = ForkrunConfig::from_sources(dir.path(), Some(&missing)).unwrap_err();
        assert_eq!(error.config_file(), missing);
        assert!(matches!(error.kind(), ConfigParseErrorKind::BuildError(_)));
    }
}

// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    ExpectedError,
    errors::Result,
    output::{OutputContext, OutputOpts, OutputWriter},
};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand, ValueEnum};
use forkrun_filtering::TestListResolver;
use forkrun_metadata::{ForkrunExitCode, TestListSummary};
use forkrun_runner::{
    config::{ForkCount, ForkrunConfig, ForkrunProfile},
    discovery::DirectoryScanner,
    errors::WriteEventError,
    fork::{ForkCommand, ForkConfiguration, ForkStarter, run_stub_fork},
    reporter::{MessageFormat, ReporterBuilder},
    run_order::{RunOrder, RunOrderCalculator, TestsToRun},
};
use serde::Serialize;
use std::{collections::BTreeMap, io::Write, time::Duration};
use tracing::{debug, info};

/// Runs test classes in forked processes.
///
/// forkrun scans a directory of compiled test classes, orders them and hands them to forks: child
/// processes that run the classes and report results back over their standard streams.
#[derive(Debug, Parser)]
#[command(version, name = "forkrun", styles = crate::output::clap_styles())]
pub struct App {
    #[command(flatten)]
    output: OutputOpts,

    #[command(subcommand)]
    command: Command,
}

impl App {
    /// Initializes the output context.
    pub fn init_output(&self) -> OutputContext {
        self.output.init()
    }

    /// Executes the app, returning the exit code for the process.
    pub fn exec(self, output: OutputContext, output_writer: &mut OutputWriter) -> Result<i32> {
        match self.command {
            Command::List {
                config_opts,
                selection,
                message_format,
            } => {
                let config = config_opts.make_config()?;
                let profile = config_opts.profile(&config)?;
                let fork_count = profile.fork_count().compute();
                let ordered = selection.compute(&profile, config.workspace_root(), fork_count)?;

                let mut reporter = message_format
                    .reporter_builder(output)
                    .build(output_writer.stdout_writer());
                reporter.report_list(&ordered.summary)?;
                Ok(ForkrunExitCode::OK)
            }
            Command::Run {
                config_opts,
                selection,
                message_format,
                runner_opts,
                fork_command,
            } => {
                let config = config_opts.make_config()?;
                let profile = config_opts.profile(&config)?;
                let fork_count = runner_opts
                    .fork_count
                    .unwrap_or_else(|| profile.fork_count())
                    .compute();
                let ordered = selection.compute(&profile, config.workspace_root(), fork_count)?;

                let argv = if fork_command.is_empty() {
                    profile.fork_command()
                } else {
                    &fork_command
                };
                let command =
                    ForkCommand::from_argv(argv)?.current_dir(config.workspace_root());
                let fork_config = runner_opts.to_fork_configuration(&profile, command, fork_count);
                debug!("fork configuration: {fork_config:?}");

                let mut reporter = message_format
                    .reporter_builder(output)
                    .build(output_writer.stdout_writer());
                let mut write_error: Option<WriteEventError> = None;
                let starter = ForkStarter::new(fork_config);
                let report = starter.run(ordered.tests, |event| {
                    if write_error.is_none()
                        && let Err(err) = reporter.report_event(event)
                    {
                        write_error = Some(err);
                    }
                })?;
                if let Some(err) = write_error {
                    return Err(err.into());
                }

                reporter.report_run(&report)?;
                Ok(report.result.exit_code())
            }
            Command::ShowConfig { config_opts } => {
                let config = config_opts.make_config()?;
                let profile = config_opts.profile(&config)?;
                if output.verbose {
                    info!("known profiles: {}", config.profile_names().join(", "));
                }

                let show = ShowConfig::new(&profile);
                let serialized = toml::to_string(&show)
                    .map_err(|err| ExpectedError::ShowConfigError { err })?;
                let mut writer = output_writer.stdout_writer();
                writer
                    .write_all(serialized.as_bytes())
                    .and_then(|()| writer.flush())
                    .map_err(|err| ExpectedError::from(WriteEventError::Io(err)))
                    .map(|()| ForkrunExitCode::OK)
            }
            Command::Debug { command } => command.exec(),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List test classes in the order they would run
    ///
    /// This command scans the classes directory and prints the classes that match the test
    /// selection, after the run order is applied. Use --message-format json to get
    /// machine-readable output.
    List {
        #[command(flatten)]
        config_opts: ConfigOpts,

        #[command(flatten)]
        selection: SelectionOpts,

        /// Output format
        #[arg(
            short = 'T',
            long,
            value_enum,
            default_value_t,
            help_heading = "OUTPUT OPTIONS",
            value_name = "FMT"
        )]
        message_format: MessageFormatOpts,
    },
    /// Run test classes in forks
    ///
    /// This command scans the classes directory, orders the classes that match the test selection,
    /// then hands them to forks started with the fork command.
    ///
    /// The fork command is everything after `--`, or the profile's `fork-command` if nothing is
    /// passed in. `{fork_number}` in any argument is replaced with the number of the fork.
    Run {
        #[command(flatten)]
        config_opts: ConfigOpts,

        #[command(flatten)]
        selection: SelectionOpts,

        /// Output format
        #[arg(
            short = 'T',
            long,
            value_enum,
            default_value_t,
            help_heading = "OUTPUT OPTIONS",
            value_name = "FMT"
        )]
        message_format: MessageFormatOpts,

        #[command(flatten)]
        runner_opts: RunnerOpts,

        /// The command that starts a fork
        #[arg(last = true, value_name = "FORK_COMMAND")]
        fork_command: Vec<String>,
    },
    /// Show the settings of a profile
    ShowConfig {
        #[command(flatten)]
        config_opts: ConfigOpts,
    },
    /// Debugging utilities
    #[command(hide = true)]
    Debug {
        #[command(subcommand)]
        command: DebugCommand,
    },
}

#[derive(Debug, Args)]
#[command(next_help_heading = "CONFIG OPTIONS")]
struct ConfigOpts {
    /// Workspace root [default: current directory]
    #[arg(long, value_name = "DIR")]
    workspace_root: Option<Utf8PathBuf>,

    /// Config file [default: workspace-root/.config/forkrun.toml]
    #[arg(long, value_name = "PATH")]
    config_file: Option<Utf8PathBuf>,

    /// Forkrun profile to use
    #[arg(long, short = 'P', env = "FORKRUN_PROFILE")]
    profile: Option<String>,
}

impl ConfigOpts {
    fn workspace_root(&self) -> Result<Utf8PathBuf> {
        match &self.workspace_root {
            Some(root) => Ok(root.clone()),
            None => {
                let current_dir = std::env::current_dir()
                    .map_err(|err| ExpectedError::CurrentDirFailed { err })?;
                Utf8PathBuf::try_from(current_dir).map_err(|err| {
                    ExpectedError::WorkspaceRootInvalidUtf8 {
                        path: err.into_path_buf(),
                    }
                })
            }
        }
    }

    /// Creates a forkrun config with the given options.
    fn make_config(&self) -> Result<ForkrunConfig> {
        let workspace_root = self.workspace_root()?;
        debug!("workspace root: {workspace_root}");
        Ok(ForkrunConfig::from_sources(
            workspace_root,
            self.config_file.as_deref(),
        )?)
    }

    fn profile<'cfg>(&self, config: &'cfg ForkrunConfig) -> Result<ForkrunProfile<'cfg>> {
        let name = self
            .profile
            .as_deref()
            .unwrap_or(ForkrunConfig::DEFAULT_PROFILE);
        Ok(config.profile(name)?)
    }
}

#[derive(Debug, Args)]
#[command(next_help_heading = "SELECTION OPTIONS")]
struct SelectionOpts {
    /// Directory containing compiled test classes, relative to the workspace root
    #[arg(long, value_name = "DIR", default_value = "target/test-classes")]
    classes_dir: Utf8PathBuf,

    /// Test patterns, separated by commas [default: the profile's `test`]
    ///
    /// Each pattern is a class pattern, a method pattern after `#`, or both. Class patterns
    /// match fully qualified names (`pkg.MyTest`) or class files (`pkg/MyTest.class`) and accept
    /// globs. Prefix a pattern with `!` to exclude, and wrap it in `%regex[...]` to use a regular
    /// expression.
    #[arg(long, value_name = "PATTERNS")]
    test: Option<String>,

    /// Class files to scan for, as globs (may be repeated)
    #[arg(long, value_name = "GLOB")]
    include: Vec<String>,

    /// Class files to skip, as globs (may be repeated)
    #[arg(long, value_name = "GLOB")]
    exclude: Vec<String>,

    /// Order in which test classes run [default: the profile's `run-order`]
    ///
    /// One of alphabetical, reversealphabetical, random, hourly, failedfirst, balanced,
    /// filesystem or testorder. Only the first of several comma-separated orders is used.
    #[arg(long, value_name = "ORDER")]
    run_order: Option<String>,

    /// Seed for the random run order
    #[arg(long, value_name = "SEED")]
    random_seed: Option<u64>,
}

struct OrderedTests {
    tests: TestsToRun,
    summary: TestListSummary,
}

impl SelectionOpts {
    fn compute(
        &self,
        profile: &ForkrunProfile<'_>,
        workspace_root: &Utf8Path,
        fork_count: usize,
    ) -> Result<OrderedTests> {
        let test = self.test.as_deref().unwrap_or(profile.test());
        let filter = TestListResolver::new(test)
            .map_err(|err| ExpectedError::test_pattern_error(test, err))?;

        let includes = if self.include.is_empty() {
            profile.includes()
        } else {
            &self.include
        };
        let excludes = if self.exclude.is_empty() {
            profile.excludes()
        } else {
            &self.exclude
        };
        let scanner = DirectoryScanner::with_patterns(
            workspace_root.join(&self.classes_dir),
            includes,
            excludes,
        )?;
        let tests = scanner.scan(&filter)?;

        let mut parameters = profile.run_order_parameters();
        if let Some(input) = &self.run_order {
            parameters.run_orders = input
                .parse()
                .map_err(|err| ExpectedError::run_order_parse_error(input, err))?;
        }
        if let Some(seed) = self.random_seed {
            parameters.random_seed = Some(seed);
        }

        let calculator = RunOrderCalculator::new(parameters, fork_count, Some(filter));
        let tests = calculator.order_test_classes(tests);

        let run_orders = &calculator.parameters().run_orders;
        let random_seed = run_orders
            .contains(RunOrder::Random)
            .then(|| calculator.random_seed());
        let summary = TestListSummary::new(
            run_orders.to_string(),
            random_seed,
            tests.iter().map(str::to_owned).collect(),
        );
        Ok(OrderedTests { tests, summary })
    }
}

#[derive(Debug, Args)]
#[command(next_help_heading = "RUNNER OPTIONS")]
struct RunnerOpts {
    /// Number of forks to run at once: an integer, num-cpus, or a CPU multiple such as 1.5C
    #[arg(long, short = 'j', value_name = "COUNT", env = "FORKRUN_FORK_COUNT")]
    fork_count: Option<ForkCount>,

    /// Start a fresh fork for every test class
    #[arg(long)]
    no_reuse_forks: bool,

    /// Skip remaining tests after this many failures (0 to never skip)
    #[arg(long, value_name = "COUNT")]
    skip_after_failure_count: Option<usize>,
}

impl RunnerOpts {
    fn to_fork_configuration(
        &self,
        profile: &ForkrunProfile<'_>,
        command: ForkCommand,
        fork_count: usize,
    ) -> ForkConfiguration {
        let mut config = ForkConfiguration::from_profile(profile, command);
        config.fork_count = fork_count;
        if self.no_reuse_forks {
            config.reuse_forks = false;
        }
        if let Some(count) = self.skip_after_failure_count {
            config.skip_after_failure_count = (count > 0).then_some(count);
        }
        config
    }
}

#[derive(Copy, Clone, Debug, Default, ValueEnum)]
enum MessageFormatOpts {
    #[default]
    Human,
    Json,
}

impl MessageFormatOpts {
    fn reporter_builder(self, output: OutputContext) -> ReporterBuilder {
        let mut builder = ReporterBuilder::default();
        match self {
            Self::Human => {
                builder
                    .set_message_format(MessageFormat::Human)
                    .set_colorize(output.colorize_stdout());
            }
            Self::Json => {
                builder.set_message_format(MessageFormat::Json);
            }
        }
        builder.set_verbose(output.verbose);
        builder
    }
}

#[derive(Debug, Subcommand)]
enum DebugCommand {
    /// Act as a fork: read commands from stdin and write events to stdout
    ///
    /// Each test class runs two simulated tests. Markers in the simple class name pick the
    /// behavior: Failing, Error, Skipped, Flaky, Stop, Noisy, Crash or Hang.
    ForkStub {
        /// The number of this fork
        #[arg(long, default_value_t = 1)]
        fork_number: u32,
    },
}

impl DebugCommand {
    fn exec(self) -> Result<i32> {
        match self {
            Self::ForkStub { fork_number } => {
                run_stub_fork(std::io::stdin(), std::io::stdout().lock(), fork_number)
                    .map_err(|err| ExpectedError::ForkStubError { err })
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct ShowConfig<'a> {
    profile: BTreeMap<&'a str, ShowProfile<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct ShowProfile<'a> {
    test: &'a str,
    includes: &'a [String],
    excludes: &'a [String],
    run_order: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_order_random_seed: Option<u64>,
    statistics_file: String,
    fork_count: String,
    reuse_forks: bool,
    fork_command: &'a [String],
    #[serde(with = "humantime_serde")]
    forked_process_timeout: Duration,
    skip_after_failure_count: usize,
    dump_dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    debug_stream_file: Option<String>,
}

impl<'a> ShowConfig<'a> {
    fn new(profile: &'a ForkrunProfile<'a>) -> Self {
        let show = ShowProfile {
            test: profile.test(),
            includes: profile.includes(),
            excludes: profile.excludes(),
            run_order: profile.run_orders().to_string(),
            run_order_random_seed: profile.run_order_random_seed(),
            statistics_file: profile.statistics_file().into_string(),
            fork_count: profile.fork_count().to_string(),
            reuse_forks: profile.reuse_forks(),
            fork_command: profile.fork_command(),
            forked_process_timeout: profile.forked_process_timeout().unwrap_or_default(),
            skip_after_failure_count: profile.skip_after_failure_count().unwrap_or(0),
            dump_dir: profile.dump_dir().into_string(),
            debug_stream_file: profile.debug_stream_file().map(Utf8PathBuf::into_string),
        };
        Self {
            profile: BTreeMap::from([(profile.name(), show)]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use clap::CommandFactory;
    use indoc::indoc;

    #[test]
    fn verify_app() {
        App::command().debug_assert();
    }

    #[test]
    fn test_argument_parsing() {
        let valid: &[&str] = &[
            "forkrun list",
            "forkrun list --test pkg.ATest#testOne",
            "forkrun list --include **/*IT.class --include **/*Test.class --exclude **/Slow*",
            "forkrun list -T json --run-order random --random-seed 42",
            "forkrun list -P ci --config-file forkrun.toml --workspace-root /tmp",
            "forkrun -v --color never list",
            "forkrun run -- java -cp target/test-classes Runner {fork_number}",
            "forkrun run -j 4 --no-reuse-forks -- stub",
            "forkrun run --fork-count 1.5C --skip-after-failure-count 3",
            "forkrun run --fork-count num-cpus -T json",
            "forkrun show-config -P ci",
            "forkrun debug fork-stub --fork-number 3",
        ];
        let invalid: &[(&str, clap::error::ErrorKind)] = &[
            ("forkrun run -j abc", clap::error::ErrorKind::ValueValidation),
            ("forkrun run -j 0", clap::error::ErrorKind::ValueValidation),
            (
                "forkrun list -T xml",
                clap::error::ErrorKind::InvalidValue,
            ),
            (
                "forkrun list --no-reuse-forks",
                clap::error::ErrorKind::UnknownArgument,
            ),
            (
                "forkrun debug fork-stub --fork-number x",
                clap::error::ErrorKind::ValueValidation,
            ),
        ];

        for args in valid {
            if let Err(error) = App::try_parse_from(args.split_whitespace()) {
                panic!("{args} should have parsed successfully, but didn't: {error}");
            }
        }

        for &(args, kind) in invalid {
            match App::try_parse_from(args.split_whitespace()) {
                Ok(_) => panic!("{args} should have errored out but successfully parsed"),
                Err(error) => {
                    assert_eq!(error.kind(), kind, "{args} errored with unexpected kind");
                }
            }
        }
    }

    fn workspace(files: &[&str], config: Option<&str>) -> Utf8TempDir {
        let dir = Utf8TempDir::new().unwrap();
        for file in files {
            let path = dir.path().join("target/test-classes").join(file);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, b"").unwrap();
        }
        if let Some(config) = config {
            let path = dir.path().join(ForkrunConfig::CONFIG_PATH);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, config).unwrap();
        }
        dir
    }

    fn exec(args: &str, workspace: &Utf8Path) -> (Result<i32>, String) {
        let args = format!("forkrun --color never {args} --workspace-root {workspace}");
        let app = App::try_parse_from(args.split_whitespace()).unwrap();
        let output = app.init_output();
        let mut writer = OutputWriter::Test { stdout: Vec::new() };
        let result = app.exec(output, &mut writer);
        let OutputWriter::Test { stdout } = writer else {
            unreachable!("test writer was created above");
        };
        (result, String::from_utf8(stdout).unwrap())
    }

    #[test]
    fn list_orders_classes() {
        let dir = workspace(
            &[
                "b/BTest.class",
                "a/ATest.class",
                "a/ATest$Inner.class",
                "a/Helper.class",
            ],
            None,
        );

        let (result, stdout) = exec("list", dir.path());
        assert_eq!(result.unwrap(), ForkrunExitCode::OK);
        assert_eq!(stdout, "a.ATest\nb.BTest\n");

        let (result, stdout) = exec("list --run-order reversealphabetical -T json", dir.path());
        assert_eq!(result.unwrap(), ForkrunExitCode::OK);
        let summary = TestListSummary::parse(&stdout).unwrap();
        assert_eq!(summary.run_order, "reversealphabetical");
        assert_eq!(summary.random_seed, None);
        assert_eq!(summary.classes, vec!["b.BTest", "a.ATest"]);
    }

    #[test]
    fn list_applies_test_patterns() {
        let dir = workspace(&["a/ATest.class", "a/BTest.class", "c/CTest.class"], None);

        let (result, stdout) = exec("list --test *Test,!BTest -T json", dir.path());
        assert_eq!(result.unwrap(), ForkrunExitCode::OK);
        let summary = TestListSummary::parse(&stdout).unwrap();
        assert_eq!(summary.classes, vec!["a.ATest", "c.CTest"]);

        let (result, _) = exec("list --test ATest#a#b", dir.path());
        assert_eq!(
            result.unwrap_err().process_exit_code(),
            ForkrunExitCode::INVALID_TEST_PATTERN
        );
    }

    #[test]
    fn list_random_order_reports_seed() {
        let dir = workspace(&["a/ATest.class", "b/BTest.class", "c/CTest.class"], None);

        let (result, stdout) = exec("list -T json --run-order random --random-seed 7", dir.path());
        assert_eq!(result.unwrap(), ForkrunExitCode::OK);
        let first = TestListSummary::parse(&stdout).unwrap();
        assert_eq!(first.random_seed, Some(7));

        let (_, stdout) = exec("list -T json --run-order random:7", dir.path());
        let second = TestListSummary::parse(&stdout).unwrap();
        assert_eq!(second.random_seed, Some(7));
        assert_eq!(first.classes, second.classes);
    }

    #[test]
    fn invalid_run_order() {
        let dir = workspace(&["a/ATest.class"], None);
        let (result, _) = exec("list --run-order sideways", dir.path());
        assert_eq!(
            result.unwrap_err().process_exit_code(),
            ForkrunExitCode::INVALID_RUN_ORDER
        );
    }

    #[test]
    fn missing_classes_dir() {
        let dir = Utf8TempDir::new().unwrap();
        let (result, _) = exec("list", dir.path());
        assert_eq!(
            result.unwrap_err().process_exit_code(),
            ForkrunExitCode::SETUP_ERROR
        );
    }

    #[test]
    fn run_without_fork_command() {
        let dir = workspace(&["a/ATest.class"], None);
        let (result, _) = exec("run", dir.path());
        assert!(matches!(
            result.unwrap_err(),
            ExpectedError::ForkCommandError { .. }
        ));
    }

    #[test]
    fn unknown_profile() {
        let dir = workspace(&["a/ATest.class"], None);
        let (result, _) = exec("list -P nonexistent", dir.path());
        assert!(matches!(
            result.unwrap_err(),
            ExpectedError::ProfileNotFound { .. }
        ));
    }

    #[test]
    fn show_config_uses_profile() {
        let config = indoc! {r#"
            [profile.default]
            test = "pkg.*Test"
            statistics-file = "stats.txt"
            fork-command = ["java", "-cp", "classes"]

            [profile.quick]
            run-order = "alphabetical"
            fork-count = 4
            skip-after-failure-count = 1
        "#};
        let dir = workspace(&[], Some(config));

        let (result, stdout) = exec("show-config -P quick", dir.path());
        assert_eq!(result.unwrap(), ForkrunExitCode::OK);
        let parsed: toml::Table = stdout.parse().unwrap();
        let quick = &parsed["profile"]["quick"];
        assert_eq!(quick["test"].as_str(), Some("pkg.*Test"));
        assert_eq!(quick["run-order"].as_str(), Some("alphabetical"));
        assert_eq!(quick["fork-count"].as_str(), Some("4"));
        assert_eq!(quick["skip-after-failure-count"].as_integer(), Some(1));
        assert_eq!(quick["forked-process-timeout"].as_str(), Some("0s"));
        assert_eq!(
            quick["statistics-file"].as_str(),
            Some(dir.path().join("stats.txt").as_str())
        );
        assert_eq!(
            quick["fork-command"].as_array().map(|command| command.len()),
            Some(3)
        );
    }
}

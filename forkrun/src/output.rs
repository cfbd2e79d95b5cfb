// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use clap::{
    Args, ValueEnum,
    builder::{
        Styles,
        styling::{AnsiColor, Effects},
    },
};
use miette::{GraphicalTheme, MietteHandlerOpts, ThemeStyles};
use owo_colors::{OwoColorize, Style, style};
use std::{
    env::VarError,
    fmt,
    io::{self, BufWriter, Write},
    sync::Once,
};
use supports_color::Stream;
use tracing::{
    Event, Level, Subscriber,
    field::{Field, Visit},
    level_filters::LevelFilter,
    warn,
};
use tracing_subscriber::{
    Layer,
    filter::Targets,
    fmt::{FmtContext, FormatEvent, FormatFields, format},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
};

/// Log events with this target are printed without an `error:`/`warning:` prefix.
pub(crate) const NO_HEADING_TARGET: &str = "forkrun::no_heading";

const LOG_ENV: &str = "FORKRUN_LOG";

pub(crate) const fn clap_styles() -> Styles {
    let heading = AnsiColor::Green.on_default().effects(Effects::BOLD);
    let literal = AnsiColor::Cyan.on_default().effects(Effects::BOLD);
    Styles::styled()
        .header(heading)
        .usage(heading)
        .literal(literal)
        .placeholder(AnsiColor::Cyan.on_default())
        .error(AnsiColor::Red.on_default().effects(Effects::BOLD))
        .valid(literal)
        .invalid(AnsiColor::Yellow.on_default().effects(Effects::BOLD))
}

#[derive(Copy, Clone, Debug, Args)]
#[must_use]
pub(crate) struct OutputOpts {
    /// Verbose output
    #[arg(long, short, global = true, env = "FORKRUN_VERBOSE")]
    pub(crate) verbose: bool,

    /// Produce color output: auto, always, never
    #[arg(
        long,
        value_enum,
        default_value_t,
        hide_possible_values = true,
        global = true,
        value_name = "WHEN",
        env = "FORKRUN_COLOR"
    )]
    pub(crate) color: Color,
}

impl OutputOpts {
    /// Installs logging and the miette report handler, once per process.
    pub(crate) fn init(self) -> OutputContext {
        static INIT: Once = Once::new();
        let colorize_stderr = self.color.enabled_for(Stream::Stderr);
        INIT.call_once(|| {
            init_logging(colorize_stderr);
            install_miette_hook(colorize_stderr);
        });

        OutputContext {
            verbose: self.verbose,
            color: self.color,
        }
    }
}

/// Output settings shared by every subcommand.
#[derive(Copy, Clone, Debug)]
#[must_use]
pub struct OutputContext {
    pub(crate) verbose: bool,
    color: Color,
}

impl OutputContext {
    /// Returns the styles used for errors printed to stderr.
    pub fn stderr_styles(&self) -> StderrStyles {
        if self.color.enabled_for(Stream::Stderr) {
            StderrStyles {
                bold: style().bold(),
                warning_text: style().yellow(),
            }
        } else {
            StderrStyles::default()
        }
    }

    pub(crate) fn colorize_stdout(&self) -> bool {
        self.color.enabled_for(Stream::Stdout)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
#[must_use]
pub(crate) enum Color {
    #[default]
    Auto,
    Always,
    Never,
}

impl Color {
    fn enabled_for(self, stream: Stream) -> bool {
        match self {
            Color::Auto => supports_color::on_cached(stream).is_some(),
            Color::Always => true,
            Color::Never => false,
        }
    }
}

/// Styles for error messages printed to stderr.
#[derive(Debug, Default)]
pub struct StderrStyles {
    pub(crate) bold: Style,
    pub(crate) warning_text: Style,
}

fn init_logging(colorize: bool) {
    let (targets, warning) = log_targets(std::env::var(LOG_ENV));
    let layer = tracing_subscriber::fmt::layer()
        .event_format(HeadingFormatter { colorize })
        .with_writer(io::stderr)
        .with_filter(targets);
    tracing_subscriber::registry().with(layer).init();

    if let Some(warning) = warning {
        warn!("{warning}");
    }
}

/// Turns the value of `FORKRUN_LOG` into a filter. An unset or empty variable means `info`; an
/// invalid one also means `info`, along with a warning to print once logging is up.
fn log_targets(value: Result<String, VarError>) -> (Targets, Option<String>) {
    let default = || Targets::new().with_default(LevelFilter::INFO);
    match value {
        Ok(value) if !value.is_empty() => match value.parse::<Targets>() {
            Ok(targets) => (targets, None),
            Err(error) => (
                default(),
                Some(format!("ignoring invalid {LOG_ENV} `{value}`: {error}")),
            ),
        },
        Ok(_) | Err(VarError::NotPresent) => (default(), None),
        Err(VarError::NotUnicode(_)) => (
            default(),
            Some(format!("ignoring {LOG_ENV}: not valid UTF-8")),
        ),
    }
}

fn install_miette_hook(colorize: bool) {
    let installed = miette::set_hook(Box::new(move |_| {
        let mut theme = if supports_unicode::on(supports_unicode::Stream::Stderr) {
            GraphicalTheme::unicode()
        } else {
            GraphicalTheme::ascii()
        };
        theme.characters.error = "error:".into();
        if !colorize {
            theme.styles = ThemeStyles::none();
        }
        Box::new(MietteHandlerOpts::new().graphical_theme(theme).build())
    }));
    if installed.is_err() {
        warn!("a miette report handler was already installed");
    }
}

/// Prints `<level>: <message>`, or just the message for [`NO_HEADING_TARGET`].
struct HeadingFormatter {
    colorize: bool,
}

impl HeadingFormatter {
    fn heading(&self, level: Level) -> (&'static str, Style) {
        let (heading, style) = match level {
            Level::ERROR => ("error", style().red().bold()),
            Level::WARN => ("warning", style().yellow().bold()),
            Level::INFO => ("info", style().bold()),
            Level::DEBUG => ("debug", style().bold()),
            Level::TRACE => ("trace", style().dimmed()),
        };
        (heading, if self.colorize { style } else { Style::new() })
    }
}

impl<S, N> FormatEvent<S, N> for HeadingFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        if metadata.target() != NO_HEADING_TARGET {
            let (heading, style) = self.heading(*metadata.level());
            write!(writer, "{}: ", heading.style(style))?;
        }

        let mut visitor = MessageVisitor {
            writer: &mut writer,
            result: Ok(()),
        };
        event.record(&mut visitor);
        visitor.result?;
        writeln!(writer)
    }
}

/// Writes the `message` field and ignores the rest.
struct MessageVisitor<'a, 'writer> {
    writer: &'a mut format::Writer<'writer>,
    result: fmt::Result,
}

impl Visit for MessageVisitor<'_, '_> {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" && self.result.is_ok() {
            self.result = write!(self.writer, "{value:?}");
        }
    }
}

/// Where standard output goes. Tests capture it in memory.
#[derive(Default)]
pub enum OutputWriter {
    /// The process's standard output.
    #[default]
    Normal,

    /// Output captured in memory.
    #[cfg(test)]
    Test {
        /// Everything written so far.
        stdout: Vec<u8>,
    },
}

impl OutputWriter {
    pub(crate) fn stdout_writer(&mut self) -> Box<dyn Write + '_> {
        match self {
            Self::Normal => Box::new(BufWriter::new(io::stdout())),
            #[cfg(test)]
            Self::Test { stdout } => Box::new(stdout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_targets_from_env() {
        let (targets, warning) = log_targets(Err(VarError::NotPresent));
        assert!(targets.would_enable("forkrun", &Level::INFO));
        assert!(!targets.would_enable("forkrun", &Level::DEBUG));
        assert_eq!(warning, None);

        let (targets, warning) = log_targets(Ok("forkrun_runner=debug".to_owned()));
        assert!(targets.would_enable("forkrun_runner::fork", &Level::DEBUG));
        assert_eq!(warning, None);

        let (targets, warning) = log_targets(Ok("forkrun=loudest".to_owned()));
        assert!(targets.would_enable("forkrun", &Level::INFO));
        assert!(!targets.would_enable("forkrun", &Level::DEBUG));
        let warning = warning.expect("invalid filter produces a warning");
        assert!(
            warning.starts_with("ignoring invalid FORKRUN_LOG `forkrun=loudest`"),
            "unexpected warning: {warning}"
        );
    }

    #[test]
    fn headings_without_color() {
        let plain = HeadingFormatter { colorize: false };
        let colored = HeadingFormatter { colorize: true };
        for (level, expected) in [(Level::ERROR, "error"), (Level::WARN, "warning")] {
            let (heading, style) = plain.heading(level);
            assert_eq!(heading, expected);
            assert!(style.is_plain());
            assert!(!colored.heading(level).1.is_plain());
        }
    }
}

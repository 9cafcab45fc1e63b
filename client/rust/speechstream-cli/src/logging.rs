//! Console log formatting and subscriber setup.

use anyhow::Result;
use owo_colors::OwoColorize;
use std::fmt;
use std::io::IsTerminal;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields};
use tracing_subscriber::fmt::time::{ChronoLocal, FormatTime};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogStyle {
    /// Icon and message only.
    Compact,
    #[default]
    Pretty,
    /// Adds spans and file/line.
    Verbose,
}

impl std::str::FromStr for LogStyle {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "compact" => Ok(LogStyle::Compact),
            "pretty" => Ok(LogStyle::Pretty),
            "verbose" => Ok(LogStyle::Verbose),
            _ => Err(format!(
                "Invalid log style '{s}'. Expected: compact, pretty, or verbose"
            )),
        }
    }
}

pub mod icons {
    pub const TRACE: &str = "·";
    pub const DEBUG: &str = "●";
    pub const INFO: &str = "✓";
    pub const WARN: &str = "⚠";
    pub const ERROR: &str = "✕";
}

fn format_level_icon(level: Level) -> &'static str {
    match level {
        Level::TRACE => icons::TRACE,
        Level::DEBUG => icons::DEBUG,
        Level::INFO => icons::INFO,
        Level::WARN => icons::WARN,
        Level::ERROR => icons::ERROR,
    }
}

pub struct PrettyFormatter<T> {
    timer: T,
    use_ansi: bool,
    style: LogStyle,
}

impl<T> PrettyFormatter<T> {
    pub fn new(timer: T) -> Self {
        Self {
            timer,
            use_ansi: std::io::stderr().is_terminal(),
            style: LogStyle::Pretty,
        }
    }

    pub fn with_ansi(mut self, use_ansi: bool) -> Self {
        self.use_ansi = use_ansi;
        self
    }

    pub fn with_style(mut self, style: LogStyle) -> Self {
        self.style = style;
        self
    }
}

impl<S, N, T> FormatEvent<S, N> for PrettyFormatter<T>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
    T: FormatTime,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let meta = event.metadata();
        let level = *meta.level();

        self.timer.format_time(&mut writer)?;
        write!(writer, " ")?;

        let icon = format_level_icon(level);
        let label = if self.style == LogStyle::Compact {
            icon.to_string()
        } else {
            format!("{icon} {:<5}", level.as_str())
        };
        if self.use_ansi {
            match level {
                Level::TRACE => write!(writer, "{}", label.dimmed())?,
                Level::DEBUG => write!(writer, "{}", label.blue())?,
                Level::INFO => write!(writer, "{}", label.green())?,
                Level::WARN => write!(writer, "{}", label.yellow())?,
                Level::ERROR => write!(writer, "{}", label.red().bold())?,
            }
        } else {
            write!(writer, "{label}")?;
        }

        if self.style != LogStyle::Compact {
            let target = meta.target();
            if self.use_ansi {
                write!(writer, " {}", target.dimmed())?;
            } else {
                write!(writer, " {target}")?;
            }
        }

        if self.style == LogStyle::Verbose {
            if let Some(scope) = ctx.event_scope() {
                for span in scope.from_root() {
                    if self.use_ansi {
                        write!(writer, " {}", format!("{}:", span.name()).cyan())?;
                    } else {
                        write!(writer, " {}:", span.name())?;
                    }
                }
            }
            if let (Some(file), Some(line)) = (meta.file(), meta.line()) {
                let short_file = file.rsplit('/').next().unwrap_or(file);
                if self.use_ansi {
                    write!(writer, " {}", format!("{short_file}:{line}").dimmed())?;
                } else {
                    write!(writer, " {short_file}:{line}")?;
                }
            }
        }

        write!(writer, " ")?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

pub struct LogConfig {
    pub level: String,
    pub style: LogStyle,
    pub json: bool,
}

/// Installs the global subscriber. `RUST_LOG` wins over `level` when set.
/// Logs go to stderr so stdout stays free for the prompt.
pub fn init(config: &LogConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)?,
    };
    let timer = ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string());

    let layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_timer(timer)
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        let formatter = PrettyFormatter::new(timer)
            .with_ansi(std::io::stderr().is_terminal())
            .with_style(config.style);
        tracing_subscriber::fmt::layer()
            .event_format(formatter)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry().with(filter).with(layer).try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn log_style_from_str() {
        assert_eq!(LogStyle::from_str("compact").unwrap(), LogStyle::Compact);
        assert_eq!(LogStyle::from_str("Pretty").unwrap(), LogStyle::Pretty);
        assert_eq!(LogStyle::from_str("VERBOSE").unwrap(), LogStyle::Verbose);
        assert!(LogStyle::from_str("loud").is_err());
    }

    #[test]
    fn level_icons() {
        assert_eq!(format_level_icon(Level::INFO), icons::INFO);
        assert_eq!(format_level_icon(Level::WARN), icons::WARN);
        assert_eq!(format_level_icon(Level::ERROR), icons::ERROR);
    }
}

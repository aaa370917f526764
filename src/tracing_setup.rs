//! Structured logging setup.
//!
//! Every module logs through `tracing` macros with fields (`trial`, `cycle`,
//! `phase`, `path`, ...). This module installs the global subscriber once per
//! process:
//! - pretty, compact or JSON output selected by `application.log_format`
//! - `RUST_LOG` overrides `application.log_level` when set
//! - thread names are on by default, so engine and `camera-capture` lines
//!   are distinguishable
//!
//! # Example
//! ```no_run
//! use lsci_session::{config::SessionConfig, tracing_setup};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SessionConfig::load_from("config/session.toml")?;
//! tracing_setup::init_from_config(&config)?;
//! info!(subjects = config.session.subjects.len(), "Session configured");
//! # Ok(())
//! # }
//! ```

use crate::config::SessionConfig;
use crate::error::{AppResult, SessionError};
use std::str::FromStr;
use tracing::{Level, Subscriber};
use tracing_subscriber::fmt::{self, format::FmtSpan};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, colored (development)
    Pretty,
    /// One line per event (lab machines)
    Compact,
    /// Newline-delimited JSON for log collection
    Json,
}

impl FromStr for OutputFormat {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            _ => Err(SessionError::ConfigValidation(format!(
                "Invalid log format '{}'. Must be one of: pretty, compact, json",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub level: Level,
    pub format: OutputFormat,
    /// Emit span open/close events
    pub span_events: bool,
    /// Include source file and line
    pub source_location: bool,
    pub thread_names: bool,
    /// Colors; honored by the pretty format only
    pub ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            span_events: false,
            source_location: false,
            thread_names: true,
            ansi: true,
        }
    }
}

impl TracingConfig {
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Level and format from the `[application]` section.
    pub fn from_session_config(config: &SessionConfig) -> AppResult<Self> {
        let level = Level::from_str(&config.application.log_level).map_err(|_| {
            SessionError::ConfigValidation(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                config.application.log_level
            ))
        })?;
        Ok(Self {
            level,
            format: config.application.log_format.parse()?,
            ..Default::default()
        })
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    pub fn with_source_location(mut self, enabled: bool) -> Self {
        self.source_location = enabled;
        self
    }

    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.ansi = enabled;
        self
    }

    /// `RUST_LOG` if set, otherwise the configured level for every target.
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level.as_str().to_lowercase()))
    }

    fn fmt_layer<S>(&self) -> Box<dyn Layer<S> + Send + Sync>
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        let spans = if self.span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let base = fmt::layer()
            .with_span_events(spans)
            .with_file(self.source_location)
            .with_line_number(self.source_location)
            .with_thread_names(self.thread_names);

        match self.format {
            OutputFormat::Pretty => base.pretty().with_ansi(self.ansi).boxed(),
            OutputFormat::Compact => base.compact().with_ansi(false).boxed(),
            OutputFormat::Json => base.json().with_ansi(false).boxed(),
        }
    }
}

/// Install the subscriber described by the session configuration.
pub fn init_from_config(config: &SessionConfig) -> AppResult<()> {
    init(TracingConfig::from_session_config(config)?)
}

/// Install the global subscriber.
///
/// Returns `Ok(())` without changes when a subscriber is already installed,
/// so tests and embedding applications may call it freely.
pub fn init(config: TracingConfig) -> AppResult<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }
    let layer = config.fmt_layer().with_filter(config.filter());
    match tracing_subscriber::registry().with(layer).try_init() {
        Ok(()) => Ok(()),
        // Lost a race with another initializer
        Err(_) if tracing::dispatcher::has_been_set() => Ok(()),
        Err(e) => Err(SessionError::ConfigValidation(format!(
            "Failed to initialize tracing: {}",
            e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_parse_case_insensitively() {
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!("compact".parse::<OutputFormat>().unwrap(), OutputFormat::Compact);
        assert!(matches!(
            "xml".parse::<OutputFormat>(),
            Err(SessionError::ConfigValidation(_))
        ));
    }

    #[test]
    fn reads_the_application_section() {
        let mut config = SessionConfig::default();
        config.application.log_level = "Debug".to_string();
        config.application.log_format = "json".to_string();

        let tracing = TracingConfig::from_session_config(&config).unwrap();
        assert_eq!(tracing.level, Level::DEBUG);
        assert_eq!(tracing.format, OutputFormat::Json);
        assert!(tracing.thread_names);

        config.application.log_level = "loud".to_string();
        assert!(TracingConfig::from_session_config(&config).is_err());
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = TracingConfig::new(Level::WARN)
            .with_format(OutputFormat::Compact)
            .with_span_events(true)
            .with_source_location(true)
            .with_ansi(false);

        assert_eq!(config.level, Level::WARN);
        assert!(config.span_events && config.source_location);
        assert!(!config.ansi);
    }

    #[test]
    fn second_init_is_a_no_op() {
        assert!(init(TracingConfig::new(Level::ERROR)).is_ok());
        assert!(init(TracingConfig::new(Level::ERROR).with_format(OutputFormat::Json)).is_ok());
    }
}

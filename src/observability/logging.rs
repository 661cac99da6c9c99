//! Structured logging using the tracing crate
//!
//! ## Log Format Options
//!
//! `LOG_FORMAT` selects the output:
//!
//! - `json` - structured JSON for log aggregation (default)
//! - `pretty` - multi-line, coloured output for development
//! - `compact` - single-line, coloured terminal output
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: ERROR, WARN, INFO, DEBUG or TRACE, defaults to INFO
//! - `LOG_FORMAT`: json, pretty or compact, defaults to json
//! - `LOG_SPANS`: emit span open/close events (true/false), defaults to false
//! - `RUST_LOG`: replaces the computed filter entirely
//!
//! ```bash
//! LOG_FORMAT=pretty LOG_LEVEL=DEBUG parcela run
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Dependencies capped at `warn` regardless of `LOG_LEVEL`
const NOISY_TARGETS: &[&str] = &["rumqttc", "warp", "hyper", "tokio"];

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    /// Parse log format from string; unknown values fall back to JSON
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Resolved logging settings
#[derive(Debug, Clone, PartialEq)]
pub struct LoggingOptions {
    pub level: Level,
    pub format: LogFormat,
    pub include_spans: bool,
    /// Raw `RUST_LOG` directives, used instead of `level` when present
    pub directives: Option<String>,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Json,
            include_spans: false,
            directives: None,
        }
    }
}

impl LoggingOptions {
    /// Read `LOG_LEVEL`, `LOG_FORMAT`, `LOG_SPANS` and `RUST_LOG` through `env`
    pub fn from_env(env: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            level: env("LOG_LEVEL")
                .map(|l| parse_level(&l))
                .unwrap_or(Level::INFO),
            format: env("LOG_FORMAT")
                .map(|f| LogFormat::parse(&f))
                .unwrap_or(LogFormat::Json),
            include_spans: env("LOG_SPANS")
                .map(|s| s.trim().eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            directives: env("RUST_LOG").filter(|d| !d.trim().is_empty()),
        }
    }

    /// Raise the level to DEBUG, as `--verbose` does
    pub fn verbose(mut self) -> Self {
        if self.level < Level::DEBUG {
            self.level = Level::DEBUG;
        }
        self
    }

    /// Filter for these options; `RUST_LOG` wins over everything else
    pub fn filter(&self) -> EnvFilter {
        if let Some(directives) = &self.directives {
            return EnvFilter::new(directives);
        }

        NOISY_TARGETS
            .iter()
            .filter_map(|target| format!("{target}=warn").parse::<Directive>().ok())
            .fold(EnvFilter::new(self.level.to_string()), |filter, directive| {
                filter.add_directive(directive)
            })
    }

    fn span_events(&self) -> FmtSpan {
        if self.include_spans {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

/// Level names are case-insensitive; anything unknown means INFO
pub fn parse_level(raw: &str) -> Level {
    match raw.trim().to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Install the global subscriber
///
/// Returns false when a subscriber was already installed.
pub fn init_logging(options: &LoggingOptions) -> bool {
    let subscriber = tracing_subscriber::registry().with(options.filter());

    let result = match options.format {
        LogFormat::Json => subscriber
            .with(fmt::layer().json().with_span_events(options.span_events()))
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .with_span_events(options.span_events()),
            )
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(options.span_events()),
            )
            .try_init(),
    };
    result.is_ok()
}

/// Initialize logging from the process environment
pub fn init_default_logging() -> bool {
    init_logging(&LoggingOptions::from_env(|name| env::var(name).ok()))
}

/// Create an MQTT operation span
#[macro_export]
macro_rules! mqtt_span {
    ($($field:tt)*) => {
        tracing::info_span!("mqtt_operation", $($field)*)
    };
}

/// Create a span for work on one device
#[macro_export]
macro_rules! device_span {
    ($($field:tt)*) => {
        tracing::info_span!("device", $($field)*)
    };
}

/// Create a span for one outbound command delivery
#[macro_export]
macro_rules! command_span {
    ($($field:tt)*) => {
        tracing::info_span!("command_delivery", $($field)*)
    };
}

pub use {command_span, device_span, mqtt_span};

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("PRETTY"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("CoMpAcT"), LogFormat::Compact);
    }

    #[test]
    fn test_log_format_parse_invalid_defaults_to_json() {
        for input in ["invalid", "", "xml", "yaml"] {
            assert_eq!(LogFormat::parse(input), LogFormat::Json, "{input}");
        }
    }

    #[test]
    fn test_parse_level() {
        let cases = [
            ("ERROR", Level::ERROR),
            ("warn", Level::WARN),
            ("Info", Level::INFO),
            ("debug", Level::DEBUG),
            ("TRACE", Level::TRACE),
            ("invalid", Level::INFO),
        ];
        for (input, expected) in cases {
            assert_eq!(parse_level(input), expected, "Failed for input: {input}");
        }
    }

    #[test]
    fn test_options_defaults_without_env() {
        let options = LoggingOptions::from_env(env_of(&[]));
        assert_eq!(options, LoggingOptions::default());
    }

    #[test]
    fn test_options_from_env() {
        let options = LoggingOptions::from_env(env_of(&[
            ("LOG_LEVEL", "debug"),
            ("LOG_FORMAT", "compact"),
            ("LOG_SPANS", "TRUE"),
        ]));
        assert_eq!(options.level, Level::DEBUG);
        assert_eq!(options.format, LogFormat::Compact);
        assert!(options.include_spans);
        assert!(options.directives.is_none());
    }

    #[test]
    fn test_log_spans_only_true_enables() {
        for (input, expected) in [("true", true), ("True", true), ("yes", false), ("1", false)] {
            let options = LoggingOptions::from_env(env_of(&[("LOG_SPANS", input)]));
            assert_eq!(options.include_spans, expected, "Failed for input: '{input}'");
        }
    }

    #[test]
    fn test_verbose_raises_level_only() {
        let options = LoggingOptions::default().verbose();
        assert_eq!(options.level, Level::DEBUG);

        let trace = LoggingOptions {
            level: Level::TRACE,
            ..LoggingOptions::default()
        };
        assert_eq!(trace.verbose().level, Level::TRACE);
    }

    #[test]
    fn test_filter_caps_noisy_targets() {
        let filter = LoggingOptions::default().filter().to_string();
        assert!(filter.contains("rumqttc=warn"));
        assert!(filter.contains("warp=warn"));
        assert!(filter.contains("hyper=warn"));
    }

    #[test]
    fn test_rust_log_overrides_filter() {
        let options = LoggingOptions::from_env(env_of(&[("RUST_LOG", "parcela=trace")]));
        let filter = options.filter().to_string();
        assert!(filter.contains("parcela=trace"));
        assert!(!filter.contains("rumqttc"));
    }
}

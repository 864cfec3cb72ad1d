//! Structured logging built on `tracing`
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: ERROR, WARN, INFO, DEBUG or TRACE (default INFO)
//! - `LOG_FORMAT`: `json`, `pretty` or `compact` (default json)
//! - `LOG_SPANS`: emit span open/close events when `true`
//! - `RUST_LOG`: replaces the whole filter when set
//!
//! ```bash
//! LOG_FORMAT=pretty LOG_LEVEL=DEBUG tripflow run --request-file trip.json
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Dependencies that are only interesting when they misbehave
const NOISY_TARGETS: &[&str] = &["hyper", "hyper_util", "reqwest", "warp", "tokio", "h2", "rustls"];

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event
    Json,
    /// Multi-line, coloured
    Pretty,
    /// Single-line, coloured
    Compact,
}

impl LogFormat {
    /// Parse a format name; anything unknown means JSON
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Parse a level name; anything unknown means INFO
pub fn parse_level(s: &str) -> Level {
    match s.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

fn build_filter(level: Level) -> EnvFilter {
    if let Ok(rust_log) = env::var("RUST_LOG") {
        return EnvFilter::new(rust_log);
    }

    NOISY_TARGETS
        .iter()
        .filter_map(|target| format!("{target}=warn").parse().ok())
        .fold(EnvFilter::new(level.to_string()), |filter, directive| {
            filter.add_directive(directive)
        })
}

fn span_events(include_spans: bool) -> FmtSpan {
    if include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

/// Install the global subscriber, writing to stderr. Returns false if one
/// was already set.
pub fn init_logging(level: Level, format: LogFormat, include_spans: bool) -> bool {
    let subscriber = tracing_subscriber::registry().with(build_filter(level));
    let events = span_events(include_spans);

    let installed = match format {
        LogFormat::Json => subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr).with_span_events(events))
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .with_writer(std::io::stderr)
                    .with_span_events(events),
            )
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .with_span_events(events),
            )
            .try_init(),
    };
    installed.is_ok()
}

/// Initialize logging from `LOG_LEVEL`, `LOG_FORMAT` and `LOG_SPANS`
pub fn init_default_logging() -> bool {
    let level = parse_level(&env::var("LOG_LEVEL").unwrap_or_default());
    let format = LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_default());
    let include_spans = env::var("LOG_SPANS")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    init_logging(level, format, include_spans)
}

/// Span covering one whole session run
#[macro_export]
macro_rules! session_span {
    ($($field:tt)*) => {
        tracing::info_span!("session", $($field)*)
    };
}

/// Span covering one stage attempt
#[macro_export]
macro_rules! stage_span {
    ($($field:tt)*) => {
        tracing::info_span!("stage", $($field)*)
    };
}

/// Span covering one provider call
#[macro_export]
macro_rules! provider_span {
    ($($field:tt)*) => {
        tracing::debug_span!("provider_call", $($field)*)
    };
}

pub use {provider_span, session_span, stage_span};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("PRETTY"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("CoMpAcT"), LogFormat::Compact);
    }

    #[test]
    fn test_unknown_format_defaults_to_json() {
        for input in ["", "xml", "yaml", "invalid"] {
            assert_eq!(LogFormat::parse(input), LogFormat::Json, "input: {input}");
        }
    }

    #[test]
    fn test_parse_level() {
        let cases = [
            ("error", Level::ERROR),
            ("WARN", Level::WARN),
            ("Info", Level::INFO),
            ("debug", Level::DEBUG),
            ("TRACE", Level::TRACE),
            ("loud", Level::INFO),
        ];
        for (input, expected) in cases {
            assert_eq!(parse_level(input), expected, "input: {input}");
        }
    }

    #[test]
    fn test_span_events() {
        assert_eq!(span_events(false), FmtSpan::NONE);
        assert_eq!(span_events(true), FmtSpan::NEW | FmtSpan::CLOSE);
    }

    #[test]
    fn test_span_macros_build_spans() {
        let _session = session_span!(session_id = "s-1");
        let _stage = stage_span!(stage = "plan", attempt = 0);
        let _provider = provider_span!(provider = "primary");
    }
}

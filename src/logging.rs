// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Logging Setup
//!
//! Installs a `tracing` subscriber for hosts that do not bring their own.
//!
//! - `LOG_LEVEL`: `error`, `warn`, `info` (default), `debug` or `trace`
//! - `LOG_FORMAT`: `json` (default), `pretty` or `compact`
//! - `RUST_LOG`: full filter directives, overrides `LOG_LEVEL`

use std::env;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, util::TryInitError, EnvFilter};

/// Output format of the log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Machine-readable, one JSON object per line
    #[default]
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    /// Unknown values fall back to JSON.
    pub fn parse(s: &str) -> LogFormat {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

fn parse_level(s: &str) -> Level {
    match s.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

fn filter(level: Level) -> EnvFilter {
    if let Ok(directives) = env::var("RUST_LOG") {
        if let Ok(filter) = EnvFilter::try_new(directives) {
            return filter;
        }
    }

    // the AMQP stack is chatty below warn
    EnvFilter::try_new(format!("{level},lapin=warn,amq_protocol=warn"))
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()))
}

/// Installs the global subscriber.
///
/// # Errors
/// When a global subscriber is already set
pub fn init_logging(level: Level, format: LogFormat) -> Result<(), TryInitError> {
    let subscriber = tracing_subscriber::registry().with(filter(level));

    match format {
        LogFormat::Json => subscriber.with(fmt::layer().json()).try_init(),
        LogFormat::Pretty => subscriber
            .with(fmt::layer().pretty().with_ansi(true))
            .try_init(),
        LogFormat::Compact => subscriber
            .with(fmt::layer().compact().with_ansi(true).with_target(false))
            .try_init(),
    }
}

/// Installs the global subscriber configured from `LOG_LEVEL` and `LOG_FORMAT`.
pub fn init_default_logging() -> Result<(), TryInitError> {
    let level = parse_level(&env::var("LOG_LEVEL").unwrap_or_default());
    let format = LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_default());

    init_logging(level, format)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_parse_case_insensitively() {
        assert_eq!(LogFormat::parse("PRETTY"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("compact"), LogFormat::Compact);
        assert_eq!(LogFormat::parse("Json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("xml"), LogFormat::Json);
    }

    #[test]
    fn levels_default_to_info() {
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level("WARN"), Level::WARN);
        assert_eq!(parse_level(""), Level::INFO);
    }

    #[test]
    fn second_init_is_an_error() {
        let _ = init_logging(Level::INFO, LogFormat::Compact);
        assert!(init_logging(Level::INFO, LogFormat::Json).is_err());
    }
}

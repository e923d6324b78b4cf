use std::fmt;

use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Plain,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Plain => write!(f, "plain"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl From<&str> for LogFormat {
    fn from(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Plain,
        }
    }
}

/// Builds the filter from a directive string; an invalid directive falls back to `info`.
pub fn env_filter(directive: &str) -> EnvFilter {
    EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber from `XRATE_LOG` and `XRATE_LOG_FORMAT`.
pub fn init_from_env() -> Result<()> {
    let level = std::env::var("XRATE_LOG").unwrap_or_else(|_| "info".to_string());
    let format = std::env::var("XRATE_LOG_FORMAT").unwrap_or_else(|_| "plain".to_string());
    init_logger(&level, LogFormat::from(format.as_str()))
}

pub fn init_logger(level: &str, format: LogFormat) -> Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Plain => builder.try_init(),
    }
    .map_err(|err| anyhow!("installing log subscriber: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::filter::LevelFilter;

    #[test]
    fn log_format_from_str() {
        assert_eq!(LogFormat::from("json"), LogFormat::Json);
        assert_eq!(LogFormat::from(" JSON "), LogFormat::Json);
        assert_eq!(LogFormat::from("plain"), LogFormat::Plain);
        assert_eq!(LogFormat::from("pretty"), LogFormat::Plain);
        assert_eq!(LogFormat::Json.to_string(), "json");
    }

    #[test]
    fn invalid_directive_falls_back_to_info() {
        assert!(EnvFilter::try_new("xrate=verbose").is_err());
        assert_eq!(env_filter("xrate=verbose").max_level_hint(), Some(LevelFilter::INFO));
        assert_eq!(env_filter("debug").max_level_hint(), Some(LevelFilter::DEBUG));
    }
}

//! Logging setup
//!
//! `RUST_LOG` filters (default `info`), `LOG_FORMAT=json` switches to JSON
//! lines, `NO_COLOR` disables ANSI colors in text mode.

use std::env;
use std::error::Error;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

/// Output format of the global subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text { ansi: bool },
    Json,
}

impl LogFormat {
    pub fn from_env() -> Self {
        Self::from_vars(
            env::var("LOG_FORMAT").ok().as_deref(),
            env::var_os("NO_COLOR").is_some(),
        )
    }

    pub fn from_vars(log_format: Option<&str>, no_color: bool) -> Self {
        match log_format {
            Some(f) if f.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text { ansi: !no_color },
        }
    }
}

/// Install the global tracing subscriber
pub fn init(format: LogFormat) -> Result<(), Box<dyn Error + Send + Sync + 'static>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init(),
        LogFormat::Text { ansi } => tracing_subscriber::fmt()
            .with_ansi(ansi)
            .with_env_filter(filter)
            .try_init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_selection() {
        assert_eq!(LogFormat::from_vars(None, false), LogFormat::Text { ansi: true });
        assert_eq!(LogFormat::from_vars(None, true), LogFormat::Text { ansi: false });
        assert_eq!(LogFormat::from_vars(Some("json"), false), LogFormat::Json);
        assert_eq!(LogFormat::from_vars(Some("JSON"), true), LogFormat::Json);
        assert_eq!(
            LogFormat::from_vars(Some("pretty"), false),
            LogFormat::Text { ansi: true }
        );
    }
}

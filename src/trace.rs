//! Tracing initialization.
//!
//! Structured logging for the whole crate via `tracing` and
//! `tracing-subscriber`. The level and output format come from
//! [`crate::config::ApplicationConfig`]; the `RUST_LOG` environment variable
//! overrides the configured level when set.
//!
//! Initialization is idempotent: a second call (common in tests, where every
//! test may try to set up logging) is a no-op rather than an error.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::ApplicationConfig;
use crate::error::{AppResult, DaqError};

/// Install the global tracing subscriber from the application settings.
pub fn init(config: &ApplicationConfig) -> AppResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    let result = match config.log_format.as_str() {
        "pretty" => tracing_subscriber::registry()
            .with(fmt::layer().pretty().with_filter(filter))
            .try_init(),
        "compact" => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(false)
                    .with_filter(filter),
            )
            .try_init(),
        "json" => tracing_subscriber::registry()
            .with(fmt::layer().json().with_filter(filter))
            .try_init(),
        other => {
            return Err(DaqError::Configuration(format!(
                "invalid log-format '{other}'; must be pretty, compact, or json"
            )));
        }
    };

    match result {
        Ok(()) => Ok(()),
        // A subscriber installed earlier in the process keeps working.
        Err(_already_set) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let config = ApplicationConfig::default();
        init(&config).unwrap();
        init(&config).unwrap();
    }

    #[test]
    fn unknown_format_is_rejected() {
        let mut config = ApplicationConfig::default();
        config.log_format = "xml".to_string();
        assert!(init(&config).is_err());
    }
}

//! Process-wide `tracing` subscriber.
//!
//! Logs always go to stderr so that `search` and `ask` output on stdout stays
//! machine-readable. `RUST_LOG`, when set, wins over `[logging] level`.

use tracing_subscriber::{prelude::*, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};

/// Install the global subscriber. Calling it twice is harmless; the second
/// call keeps the first subscriber and returns `false`.
pub fn init(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .flatten_event(true),
            )
            .with(filter)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .compact(),
            )
            .with(filter)
            .try_init(),
    };
    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_a_no_op() {
        let config = LoggingConfig::default();
        let _ = init(&config);
        assert!(!init(&config));
    }
}

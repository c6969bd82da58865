//! Logging bootstrap built on `tracing-subscriber`

use crate::config::DebugConfig;
use std::sync::Mutex;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Build the filter: `RUST_LOG` wins, otherwise the configured level.
pub fn build_filter(config: &DebugConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter()))
}

/// Install the global subscriber.
///
/// Logs go to stderr, and additionally to `config.log_path` when
/// `log_to_file` is set. Calling this twice leaves the first subscriber in
/// place and returns `false`.
pub fn init(config: &DebugConfig) -> bool {
    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    let file_layer = if config.log_to_file {
        match std::fs::File::create(&config.log_path) {
            Ok(file) => Some(fmt::layer().with_writer(Mutex::new(file)).with_ansi(false)),
            Err(e) => {
                eprintln!(
                    "Failed to open log file {}: {}",
                    config.log_path.display(),
                    e
                );
                None
            }
        }
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(build_filter(config))
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_init_does_not_panic() {
        let config = DebugConfig::default();
        let _ = init(&config);
        assert!(!init(&config));
    }
}

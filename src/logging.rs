use crate::cli::LogLevel;
use tracing_subscriber::EnvFilter;

/// Environment variable with an `EnvFilter` directive taking precedence over CLI flags.
pub const LOG_ENV: &str = "CRAFTSBOT_LOG";

/// Initialize tracing on stderr.
pub fn init_logging(level: LogLevel, verbose: bool) {
    let level = if verbose && level == LogLevel::Info {
        LogLevel::Debug
    } else {
        level
    };

    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(format!("craftsbot={}", level.as_filter())));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

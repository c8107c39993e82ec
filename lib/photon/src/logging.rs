//! Logging bootstrap.
//!
//! Components take a `Logger` explicitly and derive children with
//! `log.new(o!(...))`; anything constructed without one falls back to
//! `Discard`. Logger construction goes through `sloggers` so deployments can
//! swap terminal output for files purely in configuration.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::{Config, LoggerConfig};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "info"
destination = "stderr"
"#;

/// Builds the default terminal logger (stderr, info level).
pub fn init() -> Logger {
    let config: LoggerConfig =
        serdeconv::from_toml_str(DEFAULT_CONFIG).expect("builtin logging config must parse");
    config.build_logger().expect("builtin logging config must build")
}

/// Builds a logger from a deserialized `sloggers` configuration section.
pub fn from_config(config: &LoggerConfig) -> Result<Logger, sloggers::Error> {
    config.build_logger()
}

/// The TOML fragment `init()` is built from; embedded in generated config
/// files so the default stays in one place.
pub fn default_config_toml() -> &'static str {
    DEFAULT_CONFIG
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_builds() {
        let logger = init();
        info!(logger, "logger built from the builtin config");

        let config: LoggerConfig = serdeconv::from_toml_str(default_config_toml()).unwrap();
        assert!(from_config(&config).is_ok());
    }
}

pub use slog::{debug, error, info, o, trace, warn, Discard, Drain, Logger};
pub use sloggers::types::Severity;

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::{Build, Config, LoggerConfig};

/// Builds a terminal logger writing to stderr at the requested severity.
pub fn terminal(level: Severity) -> Logger {
    TerminalLoggerBuilder::new()
        .level(level)
        .destination(Destination::Stderr)
        .build()
        .expect("Failed building terminal logger")
}

/// Builds a logger from a TOML configuration snippet. The format is the
/// `sloggers` configuration schema, e.g.:
///
/// ```toml
/// type = "terminal"
/// level = "debug"
/// destination = "stderr"
/// ```
pub fn from_toml(config: &str) -> Option<Logger> {
    let config: LoggerConfig = serdeconv::from_toml_str(config).ok()?;
    config.build_logger().ok()
}

/// A logger that swallows everything. Used as the fallback when a component
/// is constructed without a parent logger.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discard_logger() {
        let log = discard();
        trace!(log, "no-op"; "context" => "test");
    }

    #[test]
    fn test_from_toml() {
        let log = from_toml(
            r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
        )
        .unwrap();

        debug!(log, "logger built from toml");
    }

    #[test]
    fn test_from_toml_invalid() {
        assert!(from_toml("not toml at all ][").is_none());
    }
}

pub use slog::{crit, debug, error, info, o, trace, warn};
pub use slog::{Discard, Logger};

use sloggers::{Config, LoggerConfig};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

/// Builds a root logger from a TOML logger description. The accepted format
/// is the `sloggers` configuration schema (type, level, destination et al).
pub fn from_toml(toml: &str) -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(toml).expect("Malformed logger configuration");

    config.build_logger().expect("Error building logger")
}

/// Builds the default terminal logger used when no configuration is supplied.
pub fn terminal() -> Logger {
    from_toml(DEFAULT_CONFIG)
}

/// A logger that swallows all records. Components constructed without a parent
/// logger fall back to this.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

/// Resolves an optional parent logger into a child scoped with the supplied
/// component name, or a discard logger when no parent was given.
pub fn component<'a, L: Into<Option<&'a Logger>>>(parent: L, name: &'static str) -> Logger {
    match parent.into() {
        Some(log) => log.new(o!("component" => name)),
        None => discard(),
    }
}

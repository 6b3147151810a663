//! Thin facade over slog so components can take a `logging::Logger` without
//! caring how the root logger was built.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Builds a terminal logger writing to stderr at the given level.
pub fn terminal(level: &str) -> Logger {
    let severity = match level {
        "trace" => Severity::Trace,
        "debug" => Severity::Debug,
        "info" => Severity::Info,
        "warning" => Severity::Warning,
        "error" => Severity::Error,
        "critical" => Severity::Critical,
        other => panic!("Unknown log level {:?}", other),
    };

    let mut builder = TerminalLoggerBuilder::new();
    builder.level(severity);
    builder.destination(Destination::Stderr);
    builder.build().expect("Error building the terminal logger")
}

/// A logger that swallows everything. Components take this when the caller
/// does not care about their output.
#[inline]
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

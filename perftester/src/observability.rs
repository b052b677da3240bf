//! Tracing setup for the binary.

use std::env;
use std::io::IsTerminal;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, prelude::*};

use crate::config::{LogFormat, Logging};

/// Installs the global tracing subscriber, writing to stderr.
pub fn init_tracing(logging: &Logging) {
    let (level, env_filter) = parse_rust_log(logging.level);

    let format = match logging.format {
        LogFormat::Auto if std::io::stderr().is_terminal() => LogFormat::Pretty,
        LogFormat::Auto => LogFormat::Simplified,
        format => format,
    };

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);
    let layer = match format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Simplified => layer.compact().with_ansi(false).boxed(),
        LogFormat::Auto | LogFormat::Pretty => layer.with_ansi(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(level))
        .with(env_filter)
        .init();
}

/// Reads `RUST_LOG`, falling back to the configured level.
pub fn parse_rust_log(default: LevelFilter) -> (LevelFilter, EnvFilter) {
    parse_filter(env::var(EnvFilter::DEFAULT_ENV).ok().as_deref(), default)
}

fn parse_filter(rust_log: Option<&str>, default: LevelFilter) -> (LevelFilter, EnvFilter) {
    // A bare level replaces the configured one. Anything else is taken literally.
    let level = match rust_log {
        Some(value) => match value.parse::<LevelFilter>() {
            Ok(level) => level,
            Err(_) => return (LevelFilter::TRACE, EnvFilter::new(value)),
        },
        None => default,
    };

    // This is the maximum verbosity that will be logged, we filter this down to `level`.
    let env_filter = EnvFilter::new(
        "INFO,\
        aws_config=WARN,\
        aws_smithy_runtime=WARN,\
        perftester=TRACE,\
        ",
    );

    (level, env_filter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_configured_level() {
        let (level, _) = parse_filter(None, LevelFilter::WARN);
        assert_eq!(level, LevelFilter::WARN);
    }

    #[test]
    fn bare_level_overrides_config() {
        let (level, filter) = parse_filter(Some("debug"), LevelFilter::WARN);
        assert_eq!(level, LevelFilter::DEBUG);
        assert!(filter.to_string().contains("perftester=trace"));
    }

    #[test]
    fn directives_are_used_verbatim() {
        let (level, filter) = parse_filter(Some("perftester::runner=debug"), LevelFilter::WARN);
        assert_eq!(level, LevelFilter::TRACE);
        assert!(filter.to_string().contains("perftester::runner=debug"));
    }
}

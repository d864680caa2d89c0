use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

/// Output encoding for controller logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

impl LogFormat {
    /// Interpret the `--log-format` flag; anything but "json" is human.
    pub fn from_flag(flag: &str) -> Self {
        if flag.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Human
        }
    }
}

/// Install the process-wide subscriber.
///
/// `RUST_LOG` overrides the default info-level filter; malformed
/// directives in it are dropped rather than fatal.
pub fn init(format: LogFormat) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Human => builder.compact().with_target(false).init(),
        LogFormat::Json => builder.json().flatten_event(true).init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_flag() {
        assert_eq!(LogFormat::from_flag("json"), LogFormat::Json);
        assert_eq!(LogFormat::from_flag("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::from_flag("human"), LogFormat::Human);
        assert_eq!(LogFormat::from_flag("anything-else"), LogFormat::Human);
    }
}

//! Bootstrap utilities for the audit-ingest binary.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LOG_ENV_VAR, LOG_FORMAT_ENV_VAR};

/// Initialize tracing with the AUDIT_INGEST_LOG environment variable.
///
/// Defaults to "info" level if AUDIT_INGEST_LOG is not set. Emits JSON lines
/// when AUDIT_INGEST_LOG_FORMAT is `json`.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let json = std::env::var(LOG_FORMAT_ENV_VAR)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Extract the value of `--config <path>` or `--config=<path>` from `args`.
///
/// The first element is taken to be the program name and skipped.
pub fn parse_config_path<I>(args: I) -> Option<String>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" || arg == "-c" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_config_path() {
        assert_eq!(
            parse_config_path(argv(&["audit-ingest", "--config", "/etc/a.yaml"])),
            Some("/etc/a.yaml".to_string())
        );
        assert_eq!(
            parse_config_path(argv(&["audit-ingest", "--config=b.yaml"])),
            Some("b.yaml".to_string())
        );
        assert_eq!(
            parse_config_path(argv(&["audit-ingest", "-c", "c.yaml"])),
            Some("c.yaml".to_string())
        );
    }

    #[test]
    fn test_parse_config_path_absent() {
        assert_eq!(parse_config_path(argv(&["audit-ingest"])), None);
        assert_eq!(parse_config_path(argv(&["audit-ingest", "--config"])), None);
    }
}

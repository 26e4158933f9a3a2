//! Tracing setup for coordinator and worker binaries.
//!
//! Logs always go to stderr: a worker's stdout is forwarded to the
//! coordinator's stderr, and the coordinator's stdout belongs to its embedder.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Base level when `RUST_LOG` is unset: `debug`, `warn`, `error`, else `info`.
pub const LOG_LEVEL_ENV: &str = "TETHER_LOG";

/// Install the global subscriber. Does nothing if one is already installed.
///
/// `RUST_LOG` takes precedence; otherwise `TETHER_LOG` sets the level for the
/// `tether` target. `LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(default_directives(
            std::env::var(LOG_LEVEL_ENV).ok().as_deref(),
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn default_directives(level: Option<&str>) -> String {
    let level = match level {
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("tether={level},tether::bridge::codec=off")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_defaults_to_info() {
        assert_eq!(
            default_directives(None),
            "tether=info,tether::bridge::codec=off"
        );
        assert_eq!(
            default_directives(Some("verbose")),
            "tether=info,tether::bridge::codec=off"
        );
    }

    #[test]
    fn known_levels_are_honored() {
        assert!(default_directives(Some("debug")).starts_with("tether=debug,"));
        assert!(default_directives(Some("warning")).starts_with("tether=warn,"));
        assert!(default_directives(Some("error")).starts_with("tether=error,"));
    }

    #[test]
    fn directives_parse() {
        assert!(EnvFilter::try_new(default_directives(Some("debug"))).is_ok());
    }
}

//! ---
//! cbx_section: "01-core-runtime"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Tracing setup for the ColdBox daemon: console output plus a daily tick log."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
//! The console gets the configured format. The file always gets JSON so temperature,
//! decision and actuator events can be replayed after an outage.
use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::registry::Registry;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "COLDBOX_LOG";
const DEFAULT_DIRECTIVE: &str = "info";

static GUARDS: OnceCell<[WorkerGuard; 2]> = OnceCell::new();

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Console format for the daemon.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    StructuredJson,
    #[default]
    Pretty,
}

/// Pick the filter directive: `COLDBOX_LOG`, then `RUST_LOG`, then `info`.
/// An unparsable `COLDBOX_LOG` falls back to `info` and the parse error is returned.
fn resolve_filter(coldbox_log: Option<String>, rust_log: Option<String>) -> (EnvFilter, Option<String>) {
    if let Some(directive) = coldbox_log {
        return match EnvFilter::try_new(&directive) {
            Ok(filter) => (filter, None),
            Err(err) => (
                EnvFilter::new(DEFAULT_DIRECTIVE),
                Some(format!("invalid {LOG_ENV} directive {directive:?}: {err}")),
            ),
        };
    }
    let filter = rust_log
        .and_then(|directive| EnvFilter::try_new(directive).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVE));
    (filter, None)
}

/// Base name for the daily log file. The prefix defaults to the service name.
fn log_file_name(service_name: &str, config: &LoggingConfig) -> String {
    let prefix = config.file_prefix.as_deref().unwrap_or(service_name);
    format!("{prefix}.log")
}

fn console_layer(format: LogFormat, writer: NonBlocking) -> BoxedLayer {
    let layer = fmt::layer().with_timer(fmt::time::UtcTime::rfc_3339());
    match format {
        LogFormat::StructuredJson => layer.with_target(false).json().with_writer(writer).boxed(),
        LogFormat::Pretty => layer.with_target(true).with_writer(writer).boxed(),
    }
}

/// Install the global subscriber. Calling it again keeps the first subscriber.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&config.directory)?;
    let file_appender = daily(&config.directory, log_file_name(service_name, config));
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    let _ = GUARDS.set([file_guard, stdout_guard]);

    let (filter, warning) = resolve_filter(
        std::env::var(LOG_ENV).ok(),
        std::env::var(EnvFilter::DEFAULT_ENV).ok(),
    );
    let file_layer: BoxedLayer = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .with_writer(file_writer)
        .boxed();
    let layers = vec![console_layer(config.format, stdout_writer), file_layer];

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .ok();

    if let Some(warning) = warning {
        tracing::warn!("{warning}; logging at {DEFAULT_DIRECTIVE}");
    }
    info!(
        service = %service_name,
        log_dir = %config.directory.display(),
        format = ?config.format,
        "tracing initialised"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coldbox_log_wins_over_rust_log() {
        let (filter, warning) = resolve_filter(Some("debug".into()), Some("error".into()));
        assert!(warning.is_none());
        assert!(filter.to_string().eq_ignore_ascii_case("debug"));
    }

    #[test]
    fn rust_log_is_used_when_coldbox_log_is_unset() {
        let (filter, _) = resolve_filter(None, Some("coldbox_protocol=trace".into()));
        assert!(filter.to_string().eq_ignore_ascii_case("coldbox_protocol=trace"));
        let (filter, _) = resolve_filter(None, None);
        assert!(filter.to_string().eq_ignore_ascii_case(DEFAULT_DIRECTIVE));
    }

    #[test]
    fn bad_directive_falls_back_with_a_warning() {
        let (filter, warning) = resolve_filter(Some("coldbox=loudly".into()), None);
        assert!(filter.to_string().eq_ignore_ascii_case(DEFAULT_DIRECTIVE));
        assert!(warning.unwrap().contains(LOG_ENV));
    }

    #[test]
    fn file_name_defaults_to_the_service() {
        let mut config = LoggingConfig::default();
        assert_eq!(log_file_name("coldboxd", &config), "coldboxd.log");
        config.file_prefix = Some("cellar".into());
        assert_eq!(log_file_name("coldboxd", &config), "cellar.log");
    }
}

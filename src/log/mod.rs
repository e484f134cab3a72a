// tracing_setup.rs
use tracing_error::ErrorLayer;
use tracing_subscriber::{fmt, layer::SubscriberExt, reload, EnvFilter, Registry};

/// Handle onto the live `EnvFilter`, used by the management API's
/// `GET`/`PUT /log-level` endpoints to change verbosity without a restart.
#[derive(Clone)]
pub struct LogHandle {
    reload: reload::Handle<EnvFilter, Registry>,
}

impl LogHandle {
    pub fn set_level(&self, level: &str) -> crate::errors::Result<()> {
        let filter = EnvFilter::try_new(level)
            .map_err(|e| crate::errors::ApitapError::ConfigError(e.to_string()))?;
        self.reload
            .reload(filter)
            .map_err(|e| crate::errors::ApitapError::Internal(e.to_string()))
    }

    pub fn current_level(&self) -> String {
        self.reload
            .with_current(|filter| filter.to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    }
}

/// Initialize tracing subscriber with default environment-based configuration.
///
/// Reads configuration from environment variables:
/// - `FLAPI_LOG_LEVEL`: Sets the log level (e.g., "info", "debug", "trace")
/// - `FLAPI_LOG_FORMAT`: Set to "json" for JSON output, otherwise uses human-readable format
/// - Falls back to `RUST_LOG` if `FLAPI_LOG_LEVEL` is not set
/// - Defaults to "info" level if neither is set
pub fn init_tracing() -> LogHandle {
    let level = std::env::var("FLAPI_LOG_LEVEL").ok();
    let use_json = std::env::var("FLAPI_LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);
    init_tracing_with(level.as_deref(), use_json)
}

/// Initialize tracing subscriber with explicit configuration options, returning a
/// [`LogHandle`] that the management API can use to change the level at runtime.
pub fn init_tracing_with(level: Option<&str>, use_json: bool) -> LogHandle {
    let filter = match level {
        Some(lvl) => EnvFilter::new(lvl),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let (filter, reload_handle) = reload::Layer::new(filter);

    if use_json {
        let subscriber = Registry::default()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(ErrorLayer::default());

        tracing::subscriber::set_global_default(subscriber)
            .expect("failed to set global tracing subscriber");
    } else {
        let subscriber = Registry::default()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_file(true)
                    .with_line_number(true),
            )
            .with(ErrorLayer::default());

        tracing::subscriber::set_global_default(subscriber)
            .expect("failed to set global tracing subscriber");
    }

    LogHandle {
        reload: reload_handle,
    }
}

//! Structured logging initialization.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable pretty format (for development).
    Pretty,
    /// JSON format (for log aggregation).
    Json,
}

impl LogFormat {
    /// Parse log format from string. Anything but `json` is pretty.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }

    /// Name of the format.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Pretty => "pretty",
            LogFormat::Json => "json",
        }
    }
}

/// Default directives used when `RUST_LOG` is unset.
pub(crate) fn default_directives(level: &str) -> String {
    format!("flock_core={level},flock_node={level},tower_http=debug,axum::rejection=trace")
}

/// Initialize the global subscriber.
///
/// `RUST_LOG` takes precedence over `level`. Calling this twice is a no-op
/// apart from a warning.
///
/// # Example
///
/// ```rust,no_run
/// use flock_node::observability::{init_logging, LogFormat};
///
/// init_logging("info", LogFormat::Json);
/// ```
pub fn init_logging(level: &str, format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_directives(level).into());

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true),
            )
            .try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
    };

    if let Err(e) = installed {
        tracing::warn!(error = %e, "Logging already initialized");
        return;
    }

    tracing::info!(level = %level, format = format.as_str(), "Logging initialized");
}

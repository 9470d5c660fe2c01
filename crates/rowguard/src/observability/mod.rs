//! Logging and optional decision metrics

#[cfg(feature = "metrics")]
mod metrics;

#[cfg(feature = "metrics")]
pub use metrics::{init_metrics, render_metrics};

use crate::acl::AccessType;
use crate::config::TelemetryConfig;
use crate::error::{Error, Result};

/// Install the global subscriber (and metrics recorder when enabled)
pub fn init_observability(config: &TelemetryConfig) -> Result<()> {
    #[cfg(feature = "metrics")]
    {
        init_metrics()?;
    }

    init_logging(config)
}

fn init_logging(config: &TelemetryConfig) -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, Layer};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    // stdout belongs to the CLI's own output
    let fmt_layer = if config.json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {e}")))
}

/// Outcome of one authorization decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Granted,
    Filtered,
    Forbidden,
    Challenge,
}

impl Decision {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Granted => "granted",
            Self::Filtered => "filtered",
            Self::Forbidden => "forbidden",
            Self::Challenge => "challenge",
        }
    }
}

/// Record a decision; a no-op unless the `metrics` feature is enabled
#[allow(clippy::missing_const_for_fn)]
pub fn record_decision(entity: &str, access: AccessType, decision: Decision) {
    #[cfg(feature = "metrics")]
    metrics::record_decision(entity, access, decision);

    #[cfg(not(feature = "metrics"))]
    let _ = (entity, access, decision);
}

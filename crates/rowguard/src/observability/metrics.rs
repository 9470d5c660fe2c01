//! Prometheus counters for authorization decisions

use std::sync::OnceLock;

use metrics::{counter, describe_counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use super::Decision;
use crate::acl::AccessType;
use crate::error::{Error, Result};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

const METRIC_INFO: &str = "rowguard_info";
const METRIC_DECISIONS: &str = "rowguard_decisions_total";

/// Initialize Prometheus metrics recorder.
pub fn init_metrics() -> Result<()> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::Config(format!("Failed to install metrics recorder: {e}")))?;

    PROMETHEUS_HANDLE.set(handle).ok();

    describe_counter!(METRIC_DECISIONS, "Authorization decisions by outcome");
    gauge!(METRIC_INFO, "version" => env!("CARGO_PKG_VERSION")).set(1.0);

    tracing::info!("Prometheus metrics initialized");
    Ok(())
}

/// Render metrics in Prometheus text format.
#[must_use]
pub fn render_metrics() -> String {
    PROMETHEUS_HANDLE
        .get()
        .map(PrometheusHandle::render)
        .unwrap_or_default()
}

pub(super) fn record_decision(entity: &str, access: AccessType, decision: Decision) {
    counter!(
        METRIC_DECISIONS,
        "entity" => entity.to_owned(),
        "access" => access.as_str(),
        "decision" => decision.as_str(),
    )
    .increment(1);
}

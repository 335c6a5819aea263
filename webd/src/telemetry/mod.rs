//! Logging and metrics.
//!
//! Hot paths record metrics fire-and-forget over an unbounded channel; a
//! dedicated task aggregates and reports them on an interval. Logging is
//! structured `tracing` with `RUST_LOG` taking precedence over the
//! configured level.

pub mod metrics;

pub use metrics::{record_metric, MetricsEvent, MetricsHandle};

use crate::config::LoggingConfig;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Service name stamped on startup logs.
    pub service_name: String,

    /// Enable the metrics aggregation task.
    pub enable_metrics: bool,

    /// Seconds between metric summary reports.
    pub report_interval_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "webd".to_string(),
            enable_metrics: true,
            report_interval_secs: 60,
        }
    }
}

/// Initializes logging and, when enabled, the metrics task.
pub fn init_telemetry(config: &TelemetryConfig, logging: &LoggingConfig) -> Result<MetricsHandle> {
    init_logging(logging)?;

    let handle = if config.enable_metrics {
        tracing::info!(
            service = %config.service_name,
            interval_secs = config.report_interval_secs,
            "starting metrics task"
        );
        metrics::start_metrics_task(config)
    } else {
        tracing::warn!("metrics collection is disabled");
        MetricsHandle::disabled()
    };

    tracing::info!(service = %config.service_name, "telemetry initialized");
    Ok(handle)
}

fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .or_else(|_| EnvFilter::try_new("info"))?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_file(logging.include_file_line)
        .with_line_number(logging.include_file_line);

    if logging.json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .ok();
    }

    Ok(())
}

use metrics::{register_counter, register_gauge, register_histogram, Counter, Gauge, Histogram};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

use crate::{CaptureError, ReapReport};

/// Process-wide metric handles.
///
/// Handles are registered against whatever recorder is installed when
/// [`Metrics::new`] runs; without one they are no-ops, which is what tests get.
pub struct Metrics {
    pub jobs_enqueued: Counter,
    pub jobs_claimed: Counter,
    pub jobs_done: Counter,
    pub jobs_failed: Counter,
    pub artifacts_delivered: Counter,
    pub deliveries_failed: Counter,
    pub alerts_sent: Counter,
    pub alerts_suppressed: Counter,
    pub jobs_reaped: Counter,
    pub queue_depth: Gauge,
    pub capture_duration: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            jobs_enqueued: register_counter!("jobs_enqueued"),
            jobs_claimed: register_counter!("jobs_claimed"),
            jobs_done: register_counter!("jobs_done"),
            jobs_failed: register_counter!("jobs_failed"),
            artifacts_delivered: register_counter!("artifacts_delivered"),
            deliveries_failed: register_counter!("deliveries_failed"),
            alerts_sent: register_counter!("alerts_sent"),
            alerts_suppressed: register_counter!("alerts_suppressed"),
            jobs_reaped: register_counter!("jobs_reaped"),
            queue_depth: register_gauge!("queue_depth"),
            capture_duration: register_histogram!("capture_duration_seconds"),
        }
    }

    pub fn noop() -> Self {
        Self {
            jobs_enqueued: Counter::noop(),
            jobs_claimed: Counter::noop(),
            jobs_done: Counter::noop(),
            jobs_failed: Counter::noop(),
            artifacts_delivered: Counter::noop(),
            deliveries_failed: Counter::noop(),
            alerts_sent: Counter::noop(),
            alerts_suppressed: Counter::noop(),
            jobs_reaped: Counter::noop(),
            queue_depth: Gauge::noop(),
            capture_duration: Histogram::noop(),
        }
    }

    pub fn record_completion(&self, done: bool) {
        if done {
            self.jobs_done.increment(1);
        } else {
            self.jobs_failed.increment(1);
        }
    }

    pub fn record_capture(&self, duration: Duration) {
        self.capture_duration.record(duration.as_secs_f64());
    }

    pub fn record_delivery(&self, success: bool) {
        if success {
            self.artifacts_delivered.increment(1);
        } else {
            self.deliveries_failed.increment(1);
        }
    }

    pub fn record_alert(&self, sent: bool) {
        if sent {
            self.alerts_sent.increment(1);
        } else {
            self.alerts_suppressed.increment(1);
        }
    }

    pub fn record_reap(&self, report: &ReapReport) {
        self.jobs_reaped.increment(report.requeued + report.failed);
    }

    pub fn set_queue_depth(&self, depth: i64) {
        self.queue_depth.set(depth as f64);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Install the Prometheus recorder and serve `/metrics` on `addr`.
///
/// Must run inside the tokio runtime and before [`Metrics::new`].
pub fn install_prometheus(addr: SocketAddr) -> Result<(), CaptureError> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| CaptureError::Configuration(format!("metrics exporter: {e}")))?;

    info!("Serving Prometheus metrics on {}", addr);
    Ok(())
}

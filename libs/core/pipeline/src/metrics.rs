//! Prometheus metrics for tasks, queues, subscribers and processors
//!
//! Components never talk to the `metrics` facade directly. They record
//! through a [`MetricsSink`], so tests can swap in a recording sink and
//! workers get Prometheus through [`MetricsRegistry`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use tracing::{info, warn};

use crate::registry::MessagingType;

/// Metric names
pub mod names {
    pub const TASK_EXECUTION_TIME: &str = "task_execution_time";
    pub const TASK_RESULT_COUNT: &str = "task_result_count";
    pub const ENQUEUE_COUNT: &str = "enqueue_count";
    pub const ENQUEUE_TIME: &str = "enqueue_time";
    pub const DEQUEUE_COUNT: &str = "dequeue_count";
    pub const DEQUEUE_TIME: &str = "dequeue_time";
    pub const QUEUE_DEPTH: &str = "queue_depth";
    pub const SUBSCRIBER_PULL_COUNT: &str = "subscriber_pull_count";
    pub const SUBSCRIBER_PULL_TIME: &str = "subscriber_pull_time";
    pub const SUBSCRIBER_PROCESS_COUNT: &str = "subscriber_process_count";
    pub const ACKNOWLEDGE_COUNT: &str = "acknowledge_count";
}

/// Tag keys and well-known tag values
pub mod tags {
    pub const NAME: &str = "name";
    pub const MESSAGING_TYPE: &str = "messaging_type";
    pub const STATUS: &str = "status";
    pub const REASON: &str = "reason";

    pub const SUCCESS: &str = "success";
    pub const FAILURE: &str = "failure";
    pub const ACK_FAILURE: &str = "ack_failure";
    pub const REJECTED: &str = "rejected";
}

/// A metrics tag
pub type Label = (&'static str, String);

/// Build a metrics tag
pub fn label(key: &'static str, value: impl Into<String>) -> Label {
    (key, value.into())
}

/// Start of a timed operation
#[derive(Debug, Clone, Copy)]
pub struct Sample(Instant);

impl Sample {
    pub fn start() -> Self {
        Sample(Instant::now())
    }

    pub fn elapsed(&self) -> Duration {
        self.0.elapsed()
    }
}

/// Destination for counters and timers.
pub trait MetricsSink: Send + Sync {
    fn start_sample(&self) -> Sample {
        Sample::start()
    }

    /// Record the time elapsed since `sample` under `name`
    fn end_sample(&self, sample: Sample, name: &'static str, labels: &[Label]);

    /// Add `count` to the counter `name`
    fn increment_counter(&self, name: &'static str, count: u64, labels: &[Label]);

    fn set_gauge(&self, _name: &'static str, _value: f64, _labels: &[Label]) {}
}

/// [`MetricsSink`] backed by the global `metrics` recorder.
///
/// Without an installed recorder every call is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsRegistry;

impl MetricsRegistry {
    pub fn shared() -> Arc<dyn MetricsSink> {
        Arc::new(MetricsRegistry)
    }
}

fn to_labels(labels: &[Label]) -> Vec<metrics::Label> {
    labels
        .iter()
        .map(|(key, value)| metrics::Label::new(*key, value.clone()))
        .collect()
}

impl MetricsSink for MetricsRegistry {
    fn end_sample(&self, sample: Sample, name: &'static str, labels: &[Label]) {
        histogram!(name, to_labels(labels)).record(sample.elapsed().as_secs_f64());
    }

    fn increment_counter(&self, name: &'static str, count: u64, labels: &[Label]) {
        counter!(name, to_labels(labels)).increment(count);
    }

    fn set_gauge(&self, name: &'static str, value: f64, labels: &[Label]) {
        gauge!(name, to_labels(labels)).set(value);
    }
}

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls are no-ops. A failure to
/// install the recorder is logged and leaves metrics disabled.
pub fn init_metrics() {
    let result = PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok::<_, metrics_exporter_prometheus::BuildError>(handle)
    });
    if let Err(e) = result {
        warn!(error = %e, "Failed to install Prometheus recorder, metrics disabled");
    }
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    prometheus_handle().map(|h| h.render()).unwrap_or_default()
}

/// Subscriber and processor metrics helper.
///
/// Every counter carries `name` and `messaging_type`. Zero counts are not
/// recorded.
#[derive(Clone)]
pub struct MessagingMetrics {
    sink: Arc<dyn MetricsSink>,
    name: String,
    messaging_type: MessagingType,
}

impl MessagingMetrics {
    pub fn new(
        sink: Arc<dyn MetricsSink>,
        name: impl Into<String>,
        messaging_type: MessagingType,
    ) -> Self {
        Self {
            sink,
            name: name.into(),
            messaging_type,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn messaging_type(&self) -> MessagingType {
        self.messaging_type
    }

    pub fn sink(&self) -> &Arc<dyn MetricsSink> {
        &self.sink
    }

    fn labels(&self, status: &str, reason: &str) -> [Label; 4] {
        [
            label(tags::NAME, self.name.as_str()),
            label(tags::MESSAGING_TYPE, self.messaging_type.as_ref()),
            label(tags::STATUS, status),
            label(tags::REASON, reason),
        ]
    }

    fn count(&self, metric: &'static str, count: u64, status: &str, reason: &str) {
        if count > 0 {
            self.sink
                .increment_counter(metric, count, &self.labels(status, reason));
        }
    }

    /// Records that completed processing
    pub fn processed(&self, count: u64) {
        self.count(names::SUBSCRIBER_PROCESS_COUNT, count, tags::SUCCESS, tags::SUCCESS);
    }

    /// Records that failed processing, tagged with the failure reason
    pub fn process_failed(&self, count: u64, reason: &str) {
        self.count(names::SUBSCRIBER_PROCESS_COUNT, count, tags::FAILURE, reason);
    }

    pub fn acknowledged(&self, count: u64) {
        self.count(names::ACKNOWLEDGE_COUNT, count, tags::SUCCESS, tags::SUCCESS);
    }

    pub fn ack_failed(&self, count: u64) {
        self.count(names::ACKNOWLEDGE_COUNT, count, tags::FAILURE, tags::ACK_FAILURE);
    }

    /// Records pulled by one successful pull
    pub fn pulled(&self, count: u64) {
        self.count(names::SUBSCRIBER_PULL_COUNT, count, tags::SUCCESS, tags::SUCCESS);
    }

    pub fn pull_failed(&self, reason: &str) {
        self.count(names::SUBSCRIBER_PULL_COUNT, 1, tags::FAILURE, reason);
    }

    pub fn pull_time(&self, sample: Sample) {
        self.sink.end_sample(
            sample,
            names::SUBSCRIBER_PULL_TIME,
            &[
                label(tags::NAME, self.name.as_str()),
                label(tags::MESSAGING_TYPE, self.messaging_type.as_ref()),
            ],
        );
    }
}

impl std::fmt::Debug for MessagingMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingMetrics")
            .field("name", &self.name)
            .field("messaging_type", &self.messaging_type)
            .finish()
    }
}

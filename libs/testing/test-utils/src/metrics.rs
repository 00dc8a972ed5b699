//! Metrics sink that keeps everything it is given.

use std::sync::{Mutex, MutexGuard, PoisonError};

use message_pipeline::metrics::Label;
use message_pipeline::{MetricsSink, Sample};

#[derive(Debug, Clone)]
struct Counter {
    name: &'static str,
    count: u64,
    labels: Vec<Label>,
}

#[derive(Debug, Default)]
struct Recorded {
    counters: Vec<Counter>,
    samples: Vec<(&'static str, Vec<Label>)>,
    gauges: Vec<(&'static str, f64)>,
}

/// [`MetricsSink`] for assertions.
///
/// Counter queries sum every increment whose labels contain all the given
/// `(key, value)` pairs.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    recorded: Mutex<Recorded>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn counter(&self, name: &str, filter: &[(&str, &str)]) -> u64 {
        self.lock()
            .counters
            .iter()
            .filter(|c| c.name == name && matches_all(&c.labels, filter))
            .map(|c| c.count)
            .sum()
    }

    pub fn samples(&self, name: &str) -> usize {
        self.lock().samples.iter().filter(|(n, _)| *n == name).count()
    }

    /// Last value set on gauge `name`
    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.lock()
            .gauges
            .iter()
            .rev()
            .find(|(n, _)| *n == name)
            .map(|(_, value)| *value)
    }

    pub fn clear(&self) {
        *self.lock() = Recorded::default();
    }
}

fn matches_all(labels: &[Label], filter: &[(&str, &str)]) -> bool {
    filter
        .iter()
        .all(|(key, value)| labels.iter().any(|(k, v)| k == key && v == value))
}

impl MetricsSink for RecordingMetrics {
    fn end_sample(&self, _sample: Sample, name: &'static str, labels: &[Label]) {
        self.lock().samples.push((name, labels.to_vec()));
    }

    fn increment_counter(&self, name: &'static str, count: u64, labels: &[Label]) {
        self.lock().counters.push(Counter {
            name,
            count,
            labels: labels.to_vec(),
        });
    }

    fn set_gauge(&self, name: &'static str, value: f64, _labels: &[Label]) {
        self.lock().gauges.push((name, value));
    }
}

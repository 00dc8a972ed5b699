//! Batch processor.
//!
//! One task invocation per pulled batch. The task returns the records it
//! considers ready for acknowledgment; everything it left out counts as
//! `failed`, and each returned record is acknowledged on its own.
//!
//! For a batch of `N` records where the task returned `M`:
//!
//! ```text
//! acknowledged + unacknowledged == |M|
//! failed                        == N - |M|
//! ```
//!
//! When the task fails outright the whole batch is reported failed and no
//! record is acknowledged.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use tracing::{Instrument, Span, debug, error, warn};

use crate::error::TaskError;
use crate::metrics::{MessagingMetrics, MetricsRegistry, MetricsSink, tags};
use crate::registry::MessagingType;
use crate::subscriber::{Acknowledgeable, BatchSubscriberFlow, acknowledge_all};
use crate::task::Task;
use crate::trace::TracePropagator;

/// Accounting for one processed batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchProcessResult<T> {
    /// Records the task returned for acknowledgment
    pub data: Vec<T>,
    pub acknowledged: usize,
    pub unacknowledged: usize,
    /// Records of the pulled batch the task left out
    pub failed: usize,
}

impl<T> BatchProcessResult<T> {
    /// Size of the batch this result accounts for
    pub fn total(&self) -> usize {
        self.acknowledged + self.unacknowledged + self.failed
    }
}

pub type BatchProcessOutcome<T> = Result<BatchProcessResult<T>, TaskError>;

/// Runs every batch of a [`BatchSubscriberFlow`] through a task.
pub struct BatchProcessor<T> {
    flow: Arc<dyn BatchSubscriberFlow<T>>,
    shared: Arc<Shared<T>>,
    concurrency: usize,
}

struct Shared<T> {
    task: Arc<dyn Task<Vec<T>, Vec<T>>>,
    metrics: MessagingMetrics,
    propagator: Option<Arc<dyn TracePropagator<T>>>,
}

impl<T> BatchProcessor<T>
where
    T: Acknowledgeable + Send + Sync + 'static,
{
    pub fn new(
        messaging_type: MessagingType,
        flow: Arc<dyn BatchSubscriberFlow<T>>,
        task: Arc<dyn Task<Vec<T>, Vec<T>>>,
    ) -> Self {
        let metrics = MessagingMetrics::new(MetricsRegistry::shared(), flow.name(), messaging_type);
        Self {
            flow,
            shared: Arc::new(Shared {
                task,
                metrics,
                propagator: None,
            }),
            concurrency: 1,
        }
    }

    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        let metrics = MessagingMetrics::new(sink, self.flow.name(), self.messaging_type());
        self.shared = Arc::new(Shared {
            task: Arc::clone(&self.shared.task),
            metrics,
            propagator: self.shared.propagator.clone(),
        });
        self
    }

    /// Trace each batch under the context of its last record.
    pub fn with_propagator(mut self, propagator: Arc<dyn TracePropagator<T>>) -> Self {
        self.shared = Arc::new(Shared {
            task: Arc::clone(&self.shared.task),
            metrics: self.shared.metrics.clone(),
            propagator: Some(propagator),
        });
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn name(&self) -> &str {
        self.flow.name()
    }

    pub fn messaging_type(&self) -> MessagingType {
        self.shared.metrics.messaging_type()
    }

    pub fn process(&self) -> BoxStream<'static, BatchProcessOutcome<T>> {
        let shared = Arc::clone(&self.shared);
        self.flow
            .stream()
            .map(move |batch| Arc::clone(&shared).handle(batch))
            .buffered(self.concurrency)
            .boxed()
    }

    pub fn stop(&self) {
        self.flow.stop();
    }
}

impl<T> Shared<T>
where
    T: Acknowledgeable + Send + Sync + 'static,
{
    fn handle(self: Arc<Self>, batch: Vec<T>) -> BoxFuture<'static, BatchProcessOutcome<T>> {
        let span = match (&self.propagator, batch.last()) {
            (Some(propagator), Some(last)) => {
                propagator.start_span(last, self.metrics.name(), self.metrics.messaging_type())
            }
            _ => Span::none(),
        };
        self.run(batch).instrument(span).boxed()
    }

    async fn run(self: Arc<Self>, batch: Vec<T>) -> BatchProcessOutcome<T> {
        let total = batch.len();
        debug!(subscriber = %self.metrics.name(), size = total, "Processing batch");

        let result = AssertUnwindSafe(self.task.execute_value(batch))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(TaskError::from_panic(panic)));

        match result {
            Ok(returned) => {
                let records = returned.unwrap_or_default();
                Ok(self.acknowledge(records, total).await)
            }
            Err(err) => {
                error!(
                    subscriber = %self.metrics.name(),
                    messaging_type = %self.metrics.messaging_type(),
                    size = total,
                    error = %err,
                    "Batch processing failed"
                );
                self.metrics.process_failed(total as u64, err.reason());
                Err(err)
            }
        }
    }

    async fn acknowledge(&self, records: Vec<T>, total: usize) -> BatchProcessResult<T> {
        let size = records.len();
        if size > total {
            warn!(
                subscriber = %self.metrics.name(),
                returned = size,
                pulled = total,
                "Task returned more records than it was given"
            );
        }

        let acknowledged = acknowledge_all(&records).await;
        let unacknowledged = size - acknowledged;
        let failed = total.saturating_sub(size);

        debug!(
            subscriber = %self.metrics.name(),
            processed = size,
            acknowledged,
            failed,
            "Batch processed"
        );
        if unacknowledged > 0 {
            warn!(subscriber = %self.metrics.name(), unacknowledged, "Failed to acknowledge records");
        }

        self.metrics.processed(size as u64);
        self.metrics.process_failed(failed as u64, tags::REJECTED);
        self.metrics.acknowledged(acknowledged as u64);
        self.metrics.ack_failed(unacknowledged as u64);

        BatchProcessResult {
            data: records,
            acknowledged,
            unacknowledged,
            failed,
        }
    }
}

impl<T: Send + 'static> std::fmt::Debug for BatchProcessor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchProcessor")
            .field("name", &self.flow.name())
            .field("task", &self.shared.task.name())
            .field("messaging_type", &self.shared.metrics.messaging_type())
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AckError;
    use crate::task::TaskBuilder;
    use async_trait::async_trait;
    use futures::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone)]
    struct Item {
        value: u32,
        ack_ok: bool,
        acks: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Acknowledgeable for Item {
        async fn acknowledge(&self) -> Result<(), AckError> {
            self.acks.fetch_add(1, Ordering::SeqCst);
            if self.ack_ok {
                Ok(())
            } else {
                Err(AckError::new("nack"))
            }
        }
    }

    struct Batches(Vec<Vec<Item>>);

    impl BatchSubscriberFlow<Item> for Batches {
        fn name(&self) -> &str {
            "batches"
        }

        fn stream(&self) -> BoxStream<'static, Vec<Item>> {
            stream::iter(self.0.clone()).boxed()
        }
    }

    fn items(acks: &Arc<AtomicUsize>, values: impl IntoIterator<Item = u32>) -> Vec<Item> {
        values
            .into_iter()
            .map(|value| Item {
                value,
                ack_ok: true,
                acks: acks.clone(),
            })
            .collect()
    }

    fn batch_task<F>(f: F) -> Arc<dyn Task<Vec<Item>, Vec<Item>>>
    where
        F: Fn(Vec<Item>) -> crate::task::TaskResult<Vec<Item>> + Send + Sync + 'static,
    {
        Arc::new(TaskBuilder::new("batch").sync(f).unwrap())
    }

    async fn run_one(flow: Batches, task: Arc<dyn Task<Vec<Item>, Vec<Item>>>) -> BatchProcessOutcome<Item> {
        let processor = BatchProcessor::new(MessagingType::GcpPubsub, Arc::new(flow), task);
        processor.process().next().await.unwrap()
    }

    #[tokio::test]
    async fn test_rejected_records_count_as_failed() {
        let acks = Arc::new(AtomicUsize::new(0));
        let flow = Batches(vec![items(&acks, 0..5)]);
        let task = batch_task(|batch| Ok(Some(batch.into_iter().filter(|i| i.value != 3).collect())));

        let result = run_one(flow, task).await.unwrap();

        assert_eq!(result.data.len(), 4);
        assert_eq!(result.failed, 1);
        assert_eq!(result.acknowledged, 4);
        assert_eq!(result.unacknowledged, 0);
        assert_eq!(result.total(), 5);
        assert_eq!(acks.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_ack_failures_are_unacknowledged_not_failed() {
        let acks = Arc::new(AtomicUsize::new(0));
        let mut batch = items(&acks, 0..3);
        batch[1].ack_ok = false;
        let task = batch_task(|batch| Ok(Some(batch)));

        let result = run_one(Batches(vec![batch]), task).await.unwrap();

        assert_eq!(result.acknowledged, 2);
        assert_eq!(result.unacknowledged, 1);
        assert_eq!(result.failed, 0);
    }

    #[tokio::test]
    async fn test_task_failure_acknowledges_nothing() {
        let acks = Arc::new(AtomicUsize::new(0));
        let task = batch_task(|_| Err(TaskError::transient("downstream timeout")));

        let outcome = run_one(Batches(vec![items(&acks, 0..4)]), task).await;

        assert_eq!(outcome.unwrap_err(), TaskError::transient("downstream timeout"));
        assert_eq!(acks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_absent_response_fails_whole_batch() {
        let acks = Arc::new(AtomicUsize::new(0));
        let task = batch_task(|_| Ok(None));

        let result = run_one(Batches(vec![items(&acks, 0..3)]), task).await.unwrap();

        assert!(result.data.is_empty());
        assert_eq!(result.failed, 3);
        assert_eq!(result.total(), 3);
        assert_eq!(acks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_oversized_response_does_not_underflow() {
        let acks = Arc::new(AtomicUsize::new(0));
        let extra = items(&acks, 10..12);
        let task = batch_task(move |mut batch| {
            batch.extend(extra.clone());
            Ok(Some(batch))
        });

        let result = run_one(Batches(vec![items(&acks, 0..2)]), task).await.unwrap();

        assert_eq!(result.data.len(), 4);
        assert_eq!(result.failed, 0);
        assert_eq!(result.acknowledged, 4);
    }

    #[test]
    fn test_debug_names_flow_and_task() {
        let processor = BatchProcessor::new(
            MessagingType::GcpPubsub,
            Arc::new(Batches(vec![])),
            batch_task(|batch| Ok(Some(batch))),
        );

        let debug = format!("{processor:?}");

        assert!(debug.contains("\"batches\""));
        assert!(debug.contains("\"batch\""));
    }
}

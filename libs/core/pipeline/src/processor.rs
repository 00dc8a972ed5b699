//! Single-record processor.
//!
//! Pulls records from a [`SubscriberFlow`], runs each one through a task,
//! acknowledges what the task returns and emits one outcome per record:
//!
//! - `Ok(Some(ProcessResult))`: processed, with the acknowledgment verdict
//! - `Ok(None)`: processed, nothing to acknowledge
//! - `Err(TaskError)`: processing failed, the record is left unacknowledged
//!   for the broker to redeliver
//!
//! Acknowledgment failures never fail the pipeline, they show up as
//! `acknowledged: false` and in the `acknowledge_count` metric.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use tracing::{Instrument, Span, debug, error, warn};

use crate::error::TaskError;
use crate::metrics::{MessagingMetrics, MetricsRegistry, MetricsSink};
use crate::registry::MessagingType;
use crate::subscriber::{Acknowledgeable, SubscriberFlow, acknowledge_quietly};
use crate::task::Task;
use crate::trace::TracePropagator;

/// A processed record and whether its acknowledgment went through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult<T> {
    pub data: T,
    pub acknowledged: bool,
}

impl<T> ProcessResult<T> {
    pub fn new(data: T, acknowledged: bool) -> Self {
        Self { data, acknowledged }
    }
}

/// Outcome emitted for every pulled record
pub type ProcessOutcome<T> = Result<Option<ProcessResult<T>>, TaskError>;

/// Runs every record of a [`SubscriberFlow`] through a task.
pub struct Processor<T> {
    flow: Arc<dyn SubscriberFlow<T>>,
    shared: Arc<Shared<T>>,
    concurrency: usize,
}

struct Shared<T> {
    task: Arc<dyn Task<T, T>>,
    metrics: MessagingMetrics,
    propagator: Option<Arc<dyn TracePropagator<T>>>,
}

impl<T> Processor<T>
where
    T: Acknowledgeable + Send + Sync + 'static,
{
    pub fn new(
        messaging_type: MessagingType,
        flow: Arc<dyn SubscriberFlow<T>>,
        task: Arc<dyn Task<T, T>>,
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

    /// Open a consumer span per record, parented to the context the
    /// propagator extracts from it.
    pub fn with_propagator(mut self, propagator: Arc<dyn TracePropagator<T>>) -> Self {
        self.shared = Arc::new(Shared {
            task: Arc::clone(&self.shared.task),
            metrics: self.shared.metrics.clone(),
            propagator: Some(propagator),
        });
        self
    }

    /// Process up to `concurrency` records at once. Outcomes keep pull order.
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

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Start processing. Each call subscribes to the flow afresh.
    pub fn process(&self) -> BoxStream<'static, ProcessOutcome<T>> {
        let shared = Arc::clone(&self.shared);
        self.flow
            .stream()
            .map(move |record| Arc::clone(&shared).handle(record))
            .buffered(self.concurrency)
            .boxed()
    }

    /// Stop the underlying flow; the outcome stream completes once
    /// in-flight records are done.
    pub fn stop(&self) {
        self.flow.stop();
    }
}

impl<T> Shared<T>
where
    T: Acknowledgeable + Send + Sync + 'static,
{
    fn handle(self: Arc<Self>, record: T) -> BoxFuture<'static, ProcessOutcome<T>> {
        let span = match &self.propagator {
            Some(propagator) => {
                propagator.start_span(&record, self.metrics.name(), self.metrics.messaging_type())
            }
            None => Span::none(),
        };
        self.run(record).instrument(span).boxed()
    }

    async fn run(self: Arc<Self>, record: T) -> ProcessOutcome<T> {
        debug!(subscriber = %self.metrics.name(), "Processing record");

        let result = AssertUnwindSafe(self.task.execute_value(record))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(TaskError::from_panic(panic)));

        match result {
            Ok(Some(processed)) => {
                let acknowledged = acknowledge_quietly(&processed).await;
                if acknowledged {
                    self.metrics.acknowledged(1);
                } else {
                    warn!(subscriber = %self.metrics.name(), "Record processed but not acknowledged");
                    self.metrics.ack_failed(1);
                }
                self.metrics.processed(1);
                Ok(Some(ProcessResult::new(processed, acknowledged)))
            }
            Ok(None) => {
                debug!(subscriber = %self.metrics.name(), "Task returned nothing to acknowledge");
                Ok(None)
            }
            Err(err) => {
                error!(
                    subscriber = %self.metrics.name(),
                    messaging_type = %self.metrics.messaging_type(),
                    error = %err,
                    "Record processing failed"
                );
                self.metrics.process_failed(1, err.reason());
                Err(err)
            }
        }
    }
}

impl<T: Send + 'static> std::fmt::Debug for Processor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
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
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    struct Msg {
        value: u32,
        ack_ok: bool,
    }

    #[async_trait]
    impl Acknowledgeable for Msg {
        async fn acknowledge(&self) -> Result<(), AckError> {
            if self.ack_ok {
                Ok(())
            } else {
                Err(AckError::new("broker unavailable"))
            }
        }
    }

    struct Fixed(Vec<Msg>);

    impl SubscriberFlow<Msg> for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        fn stream(&self) -> BoxStream<'static, Msg> {
            stream::iter(self.0.clone()).boxed()
        }
    }

    fn msgs(values: impl IntoIterator<Item = u32>) -> Vec<Msg> {
        values.into_iter().map(|value| Msg { value, ack_ok: true }).collect()
    }

    fn identity() -> Arc<dyn Task<Msg, Msg>> {
        Arc::new(TaskBuilder::new("identity").sync(|m: Msg| Ok(Some(m))).unwrap())
    }

    #[tokio::test]
    async fn test_identity_pipeline_acknowledges_each_record() {
        let processor = Processor::new(MessagingType::InMemory, Arc::new(Fixed(msgs(0..3))), identity());

        let outcomes: Vec<_> = processor.process().collect().await;

        assert_eq!(outcomes.len(), 3);
        for (value, outcome) in (0..3).zip(outcomes) {
            let result = outcome.unwrap().unwrap();
            assert_eq!(result.data.value, value);
            assert!(result.acknowledged);
        }
    }

    #[tokio::test]
    async fn test_ack_failure_is_not_a_pipeline_error() {
        let flow = Fixed(vec![Msg { value: 1, ack_ok: false }]);
        let processor = Processor::new(MessagingType::Kafka, Arc::new(flow), identity());

        let outcomes: Vec<_> = processor.process().collect().await;
        let result = outcomes[0].clone().unwrap().unwrap();

        assert!(!result.acknowledged);
    }

    #[tokio::test]
    async fn test_failures_are_emitted_and_processing_continues() {
        let task: Arc<dyn Task<Msg, Msg>> = Arc::new(
            TaskBuilder::new("odd_fails")
                .sync(|m: Msg| {
                    if m.value % 2 == 1 {
                        Err(TaskError::permanent("odd"))
                    } else {
                        Ok(Some(m))
                    }
                })
                .unwrap(),
        );
        let processor = Processor::new(MessagingType::InMemory, Arc::new(Fixed(msgs(0..4))), task);

        let outcomes: Vec<_> = processor.process().collect().await;

        assert_eq!(outcomes.len(), 4);
        assert!(outcomes[0].is_ok());
        assert_eq!(outcomes[1], Err(TaskError::permanent("odd")));
        assert!(outcomes[2].is_ok());
        assert!(outcomes[3].is_err());
    }

    #[tokio::test]
    async fn test_absent_response_is_not_acknowledged() {
        let task: Arc<dyn Task<Msg, Msg>> =
            Arc::new(TaskBuilder::new("drop_all").sync(|_: Msg| Ok(None)).unwrap());
        let processor = Processor::new(MessagingType::AwsSqs, Arc::new(Fixed(msgs(0..2))), task);

        let outcomes: Vec<_> = processor.process().collect().await;

        assert_eq!(outcomes, vec![Ok(None), Ok(None)]);
    }

    #[tokio::test]
    async fn test_concurrent_processing_keeps_pull_order() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (current, max) = (in_flight.clone(), peak.clone());
        let task: Arc<dyn Task<Msg, Msg>> = Arc::new(
            TaskBuilder::new("slow_first")
                .asynchronous(move |m: Msg| {
                    let (current, max) = (current.clone(), max.clone());
                    async move {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        max.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(u64::from(5 - m.value) * 10)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        Ok(Some(m))
                    }
                })
                .unwrap(),
        );
        let processor = Processor::new(MessagingType::InMemory, Arc::new(Fixed(msgs(0..5))), task)
            .with_concurrency(3);

        let values: Vec<u32> = processor
            .process()
            .map(|outcome| outcome.unwrap().unwrap().data.value)
            .collect()
            .await;

        assert_eq!(values, vec![0, 1, 2, 3, 4]);
        assert!(peak.load(Ordering::SeqCst) > 1);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn test_zero_concurrency_is_clamped() {
        let processor = Processor::new(MessagingType::InMemory, Arc::new(Fixed(vec![])), identity())
            .with_concurrency(0);
        assert_eq!(processor.concurrency(), 1);
        assert_eq!(processor.name(), "fixed");
    }

    #[test]
    fn test_debug_names_flow_and_task() {
        let processor = Processor::new(MessagingType::InMemory, Arc::new(Fixed(vec![])), identity());

        let debug = format!("{processor:?}");

        assert!(debug.contains("\"fixed\""));
        assert!(debug.contains("\"identity\""));
    }
}

//! End-to-end pipeline scenarios: subscriber -> task -> acknowledgment.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::StreamExt;
use message_pipeline::metrics::{names, tags};
use message_pipeline::{
    BatchProcessor, BatchSubscriberFlow, CircuitBreakerSetting, MessageQueue, MessagingMetrics,
    MessagingType, PollSetting, PollingBatchSubscriber, Processor, PullError,
    QueueSetting, QueueSubscriber, ResourceRegistry, SubscriberFlow, SubscriberRecord, Task,
    TaskBuilder, TaskError, TaskSetting, W3cPropagator,
};
use test_utils::assertions::assert_accounted;
use tracing::span;
use tracing::subscriber::Subscriber;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use test_utils::{
    RecordingMetrics, ScriptedPuller, TestAck, TestDataBuilder, VecBatchFlow, VecFlow,
    init_test_tracing, record, records,
};

type Record = SubscriberRecord<u32>;

fn identity(name: &str) -> Arc<dyn Task<Record, Record>> {
    Arc::new(TaskBuilder::new(name).sync(|record: Record| Ok(Some(record))).unwrap())
}

fn batch_identity(name: &str) -> Arc<dyn Task<Vec<Record>, Vec<Record>>> {
    Arc::new(TaskBuilder::new(name).sync(|batch: Vec<Record>| Ok(Some(batch))).unwrap())
}

fn reject_value(rejected: u32) -> Arc<dyn Task<Vec<Record>, Vec<Record>>> {
    Arc::new(
        TaskBuilder::new("reject_value")
            .sync(move |batch: Vec<Record>| {
                Ok(Some(batch.into_iter().filter(|r| r.data != rejected).collect()))
            })
            .unwrap(),
    )
}

// =============================================================================
// Single-record processing
// =============================================================================

#[tokio::test]
async fn test_identity_pipeline_over_five_records() {
    let ack = TestAck::succeeding();
    let flow = Arc::new(VecFlow::new("five", records(0..5u32, &ack)));
    let processor = Processor::new(MessagingType::InMemory, flow, identity("identity"));

    let outcomes: Vec<_> = processor.process().take(5).collect().await;

    let emitted: Vec<(u32, bool)> = outcomes
        .into_iter()
        .map(|outcome| {
            let result = outcome.unwrap().unwrap();
            (result.data.data, result.acknowledged)
        })
        .collect();
    assert_eq!(emitted, (0..5).map(|i| (i, true)).collect::<Vec<_>>());
    assert_eq!(ack.calls(), 5);
}

#[tokio::test]
async fn test_every_successful_record_is_acknowledged_once() {
    let acks: Vec<_> = (0..10).map(|_| TestAck::succeeding()).collect();
    let items = acks.iter().enumerate().map(|(i, ack)| record(i as u32, ack)).collect();
    let processor = Processor::new(
        MessagingType::Kafka,
        Arc::new(VecFlow::new("once", items)),
        identity("identity"),
    );

    let outcomes: Vec<_> = processor.process().collect().await;

    assert_eq!(outcomes.len(), 10);
    assert!(outcomes.iter().all(|o| matches!(o, Ok(Some(r)) if r.acknowledged)));
    assert!(acks.iter().all(|ack| ack.calls() == 1));
}

#[tokio::test]
async fn test_ack_failure_reports_unacknowledged() {
    let failing = TestAck::failing();
    let panicking = TestAck::panicking();
    let metrics = Arc::new(RecordingMetrics::new());
    let flow = Arc::new(VecFlow::new(
        "nacks",
        vec![record(1, &failing), record(2, &panicking)],
    ));
    let processor = Processor::new(MessagingType::GcpPubsub, flow, identity("identity"))
        .with_metrics(metrics.clone());

    let outcomes: Vec<_> = processor.process().collect().await;

    for outcome in &outcomes {
        let result = outcome.as_ref().unwrap().as_ref().unwrap();
        assert!(!result.acknowledged);
    }
    assert_eq!(
        metrics.counter(
            names::ACKNOWLEDGE_COUNT,
            &[(tags::STATUS, tags::FAILURE), (tags::REASON, tags::ACK_FAILURE)]
        ),
        2
    );
    assert_eq!(
        metrics.counter(names::SUBSCRIBER_PROCESS_COUNT, &[(tags::STATUS, tags::SUCCESS)]),
        2
    );
    assert_eq!(
        metrics.counter(names::SUBSCRIBER_PROCESS_COUNT, &[(tags::MESSAGING_TYPE, "gcp_pubsub")]),
        2
    );
}

#[tokio::test]
async fn test_task_failure_skips_acknowledgment() {
    let ack = TestAck::succeeding();
    let metrics = Arc::new(RecordingMetrics::new());
    let task: Arc<dyn Task<Record, Record>> = Arc::new(
        TaskBuilder::new("reject_even")
            .sync(|record: Record| {
                if record.data % 2 == 0 {
                    Err(TaskError::permanent("even"))
                } else {
                    Ok(Some(record))
                }
            })
            .unwrap(),
    );
    let processor = Processor::new(
        MessagingType::AwsSqs,
        Arc::new(VecFlow::new("mixed", records(0..4u32, &ack))),
        task,
    )
    .with_metrics(metrics.clone());

    let outcomes: Vec<_> = processor.process().collect().await;

    assert_eq!(outcomes.len(), 4);
    assert!(outcomes[0].is_err());
    assert!(outcomes[1].is_ok());
    assert_eq!(ack.calls(), 2);
    assert_eq!(
        metrics.counter(
            names::SUBSCRIBER_PROCESS_COUNT,
            &[(tags::STATUS, tags::FAILURE), (tags::REASON, "permanent_error")]
        ),
        2
    );
}

#[tokio::test]
async fn test_open_circuit_fails_fast_without_acknowledging() {
    let registry = ResourceRegistry::default().with_task(
        "guarded",
        TaskSetting::new().with_circuit_breaker(
            CircuitBreakerSetting::new()
                .with_sliding_window_size(2)
                .with_minimum_number_of_calls(2)
                .with_wait_duration_in_open_state_ms(60_000),
        ),
    );
    let invoked = Arc::new(AtomicUsize::new(0));
    let counter = invoked.clone();
    let task = registry
        .task_builder::<Record, Record>("guarded")
        .unwrap()
        .sync(move |_: Record| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(TaskError::transient("downstream unavailable"))
        })
        .unwrap();
    let ack = TestAck::succeeding();
    let processor = Processor::new(
        MessagingType::Kafka,
        Arc::new(VecFlow::new("guarded", records(0..5u32, &ack))),
        Arc::new(task),
    );

    let outcomes: Vec<_> = processor.process().collect().await;

    assert_eq!(invoked.load(Ordering::SeqCst), 2);
    assert!(
        outcomes[2..]
            .iter()
            .all(|o| *o == Err(TaskError::CircuitOpen("guarded".into())))
    );
    assert_eq!(ack.calls(), 0);
}

#[tokio::test]
async fn test_trace_headers_do_not_change_outcomes() {
    init_test_tracing();
    let data = TestDataBuilder::from_test_name("test_trace_headers_do_not_change_outcomes");
    let ack = TestAck::succeeding();
    let items = (0..3)
        .map(|i| record(i, &ack).with_header("traceparent", data.traceparent(u64::from(i))))
        .chain(std::iter::once(record(3, &ack).with_header("traceparent", "garbage")))
        .collect();
    let processor = Processor::new(
        MessagingType::Kafka,
        Arc::new(VecFlow::new("traced", items)),
        identity("identity"),
    )
    .with_propagator(Arc::new(W3cPropagator));

    let outcomes: Vec<_> = processor.process().collect().await;

    assert_eq!(outcomes.len(), 4);
    assert!(outcomes.iter().all(|o| matches!(o, Ok(Some(r)) if r.acknowledged)));
}

/// Counts `consume` spans opened and closed.
#[derive(Clone, Default)]
struct ConsumeSpans {
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl<S> Layer<S> for ConsumeSpans
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, _id: &span::Id, _ctx: Context<'_, S>) {
        if attrs.metadata().name() == "consume" {
            self.opened.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn on_close(&self, id: span::Id, ctx: Context<'_, S>) {
        if ctx.metadata(&id).is_some_and(|meta| meta.name() == "consume") {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[tokio::test]
async fn test_consume_span_closes_on_failure_and_cancellation() {
    let spans = ConsumeSpans::default();
    let _guard =
        tracing::subscriber::set_default(tracing_subscriber::registry().with(spans.clone()));
    let data = TestDataBuilder::from_test_name("test_consume_span_closes_on_failure_and_cancellation");
    let ack = TestAck::succeeding();
    let items = (0..2)
        .map(|i| record(i, &ack).with_header("traceparent", data.traceparent(u64::from(i))))
        .collect();
    let task = TaskBuilder::new("stalls")
        .asynchronous(|record: Record| async move {
            if record.data == 0 {
                return Err(TaskError::permanent("rejected"));
            }
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Some(record))
        })
        .unwrap();
    let processor = Processor::new(
        MessagingType::Kafka,
        Arc::new(VecFlow::new("traced", items)),
        Arc::new(task),
    )
    .with_propagator(Arc::new(W3cPropagator));

    let mut stream = processor.process();
    let failed = stream.next().await.unwrap();
    assert_eq!(failed, Err(TaskError::permanent("rejected")));

    let pending = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
    assert!(pending.is_err());
    drop(stream);

    assert_eq!(spans.opened.load(Ordering::SeqCst), 2);
    assert_eq!(spans.closed.load(Ordering::SeqCst), 2);
    assert_eq!(ack.calls(), 0);
}

// =============================================================================
// Batch processing
// =============================================================================

#[tokio::test]
async fn test_partial_batch_rejection() {
    let ack = TestAck::succeeding();
    let flow = Arc::new(VecBatchFlow::new("batch", vec![records(0..5u32, &ack)]));
    let processor = BatchProcessor::new(MessagingType::GcpPubsub, flow, reject_value(3));

    let result = processor.process().next().await.unwrap().unwrap();

    assert_eq!(result.data.len(), 4);
    assert_eq!(result.failed, 1);
    assert_eq!(result.acknowledged + result.unacknowledged, 4);
    assert_accounted(&result, 5);
}

#[tokio::test]
async fn test_batch_accounting_holds_with_mixed_ack_handles() {
    let ok = TestAck::succeeding();
    let nack = TestAck::failing();
    let boom = TestAck::panicking();
    let batches = vec![
        vec![record(0, &ok), record(1, &nack), record(2, &ok), record(3, &boom)],
        vec![record(3, &ok)],
        vec![record(4, &nack), record(5, &nack), record(6, &ok)],
    ];
    let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
    let metrics = Arc::new(RecordingMetrics::new());
    let processor = BatchProcessor::new(
        MessagingType::AwsSqs,
        Arc::new(VecBatchFlow::new("mixed", batches)),
        reject_value(3),
    )
    .with_metrics(metrics.clone());

    let results: Vec<_> = processor
        .process()
        .map(|outcome| outcome.unwrap())
        .collect()
        .await;

    for (result, size) in results.iter().zip(sizes) {
        assert_accounted(result, size);
    }
    assert_eq!(results[0].acknowledged, 2);
    assert_eq!(results[0].unacknowledged, 1);
    assert_eq!(results[0].failed, 1);
    assert_eq!(results[1].failed, 1);
    assert!(results[1].data.is_empty());
    assert_eq!(results[2].unacknowledged, 2);

    assert_eq!(
        metrics.counter(names::ACKNOWLEDGE_COUNT, &[(tags::STATUS, tags::SUCCESS)]),
        3
    );
    assert_eq!(
        metrics.counter(names::ACKNOWLEDGE_COUNT, &[(tags::STATUS, tags::FAILURE)]),
        3
    );
    assert_eq!(
        metrics.counter(names::SUBSCRIBER_PROCESS_COUNT, &[(tags::REASON, tags::REJECTED)]),
        2
    );
    // Rejected records are never acknowledged
    assert_eq!(boom.calls(), 0);
}

#[tokio::test]
async fn test_batch_task_failure_acknowledges_nothing() {
    let ack = TestAck::succeeding();
    let metrics = Arc::new(RecordingMetrics::new());
    let task: Arc<dyn Task<Vec<Record>, Vec<Record>>> = Arc::new(
        TaskBuilder::new("explodes")
            .sync(|_: Vec<Record>| -> message_pipeline::TaskResult<Vec<Record>> {
                panic!("batch handler bug")
            })
            .unwrap(),
    );
    let processor = BatchProcessor::new(
        MessagingType::GcpPubsub,
        Arc::new(VecBatchFlow::new("explodes", vec![records(0..4u32, &ack)])),
        task,
    )
    .with_metrics(metrics.clone());

    let outcome = processor.process().next().await.unwrap();

    assert_eq!(outcome, Err(TaskError::Panicked("batch handler bug".into())));
    assert_eq!(ack.calls(), 0);
    assert_eq!(
        metrics.counter(
            names::SUBSCRIBER_PROCESS_COUNT,
            &[(tags::STATUS, tags::FAILURE), (tags::REASON, "panicked")]
        ),
        4
    );
    assert_eq!(metrics.counter(names::ACKNOWLEDGE_COUNT, &[]), 0);
}

#[tokio::test]
async fn test_polling_subscriber_feeds_batch_processor() {
    let ack = TestAck::succeeding();
    let metrics = Arc::new(RecordingMetrics::new());
    let puller = ScriptedPuller::new([
        Ok(records(0..3u32, &ack)),
        Ok(Vec::new()),
        Err(PullError::new("connection reset")),
        Ok(records(3..5u32, &ack)),
    ]);
    let subscriber: Arc<PollingBatchSubscriber<Record, _>> = Arc::new(PollingBatchSubscriber::new(
        puller,
        PollSetting::default()
            .with_poll_interval_ms(5)
            .with_error_backoff_ms(5),
        MessagingMetrics::new(metrics.clone(), "polling", MessagingType::AwsSqs),
    ));
    let processor = BatchProcessor::new(
        MessagingType::AwsSqs,
        subscriber.clone(),
        batch_identity("identity"),
    )
    .with_metrics(metrics.clone());

    let results: Vec<_> = processor
        .process()
        .take(2)
        .map(|outcome| outcome.unwrap())
        .collect()
        .await;
    processor.stop();

    assert_eq!(results[0].acknowledged, 3);
    assert_eq!(results[1].acknowledged, 2);
    assert!(subscriber.is_stopped());
    assert_eq!(
        metrics.counter(names::SUBSCRIBER_PULL_COUNT, &[(tags::STATUS, tags::SUCCESS)]),
        5
    );
    assert_eq!(
        metrics.counter(names::SUBSCRIBER_PULL_COUNT, &[(tags::STATUS, tags::FAILURE)]),
        1
    );
    assert_eq!(ack.calls(), 5);
}

// =============================================================================
// Queue backpressure and shutdown
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_queue_blocks_producer_until_consumed() {
    let queue = MessageQueue::<u32>::new("backpressure", 2).unwrap();
    let pushed = Arc::new(AtomicUsize::new(0));

    let producer = {
        let queue = queue.clone();
        let pushed = pushed.clone();
        std::thread::spawn(move || {
            for i in 0..5 {
                queue.push(i);
                pushed.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pushed.load(Ordering::SeqCst), 2);

    let items: Vec<Option<u32>> = queue.stream().take(5).collect().await;
    producer.join().unwrap();

    assert_eq!(items, vec![Some(0), Some(1), Some(2), Some(3), Some(4)]);
    assert_eq!(pushed.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_repeated_stop_completes_processing_once() {
    let ack = TestAck::succeeding();
    let subscriber = Arc::new(
        QueueSubscriber::new(
            "orders",
            &QueueSetting::default().with_capacity(8),
            Arc::new(RecordingMetrics::new()),
        )
        .unwrap(),
    );
    for item in records(0..3u32, &ack) {
        subscriber.push_async(item).await;
    }
    let processor = Processor::new(MessagingType::Kafka, subscriber.clone(), identity("identity"));
    let stream = processor.process();

    processor.stop();
    processor.stop();
    SubscriberFlow::stop(subscriber.as_ref());

    let outcomes: Vec<_> = stream.collect().await;
    assert_eq!(outcomes.len(), 3);
    assert_eq!(ack.calls(), 3);

    // Pushes after stop are dropped and a new subscription ends immediately
    subscriber.push_async(record(9, &ack)).await;
    let late: Vec<_> = processor.process().collect().await;
    assert!(late.is_empty());
}

#[tokio::test]
async fn test_stop_ends_idle_pipeline() {
    let subscriber = Arc::new(
        QueueSubscriber::<Record>::new(
            "idle",
            &QueueSetting::default(),
            Arc::new(RecordingMetrics::new()),
        )
        .unwrap(),
    );
    let processor = Processor::new(MessagingType::Kafka, subscriber.clone(), identity("identity"));
    let outcomes = tokio::spawn(processor.process().collect::<Vec<_>>());

    tokio::time::sleep(Duration::from_millis(20)).await;
    subscriber.queue().stop();

    let outcomes = tokio::time::timeout(Duration::from_secs(5), outcomes)
        .await
        .expect("stream did not complete after stop")
        .unwrap();
    assert!(outcomes.is_empty());
}

#[tokio::test]
async fn test_subscriber_flow_names_reach_metrics() {
    let metrics = Arc::new(RecordingMetrics::new());
    let ack = TestAck::succeeding();
    let flow: Arc<dyn BatchSubscriberFlow<Record>> =
        Arc::new(VecBatchFlow::new("named_flow", vec![records(0..2u32, &ack)]));
    let processor = BatchProcessor::new(MessagingType::Kafka, flow, batch_identity("identity"))
        .with_metrics(metrics.clone());

    assert_eq!(processor.name(), "named_flow");
    let _: Vec<_> = processor.process().collect().await;

    assert_eq!(
        metrics.counter(
            names::SUBSCRIBER_PROCESS_COUNT,
            &[(tags::NAME, "named_flow"), (tags::MESSAGING_TYPE, "kafka")]
        ),
        2
    );
}

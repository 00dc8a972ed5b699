//! Message Pipeline Framework
//!
//! Building blocks for at-least-once message processing over any broker.
//!
//! ## Features
//!
//! - **Tasks**: named units of work with retry, circuit breaker, thread pool,
//!   exception and empty-request handlers
//! - **Message queue**: bounded bridge from broker callback threads to a stream
//! - **Subscribers**: single-record and batch flows with per-record acknowledgment
//! - **Processors**: run each record or batch through a task, acknowledge it and
//!   report acknowledged / unacknowledged / failed counts
//! - **Prometheus metrics** and W3C trace context propagation
//! - **Health endpoints**: K8s-ready liveness and readiness endpoints
//!
//! ## Example
//!
//! ```ignore
//! use message_pipeline::{MessagingType, Processor, QueueSubscriber, QueueSetting, TaskBuilder};
//!
//! let subscriber = Arc::new(QueueSubscriber::new("orders", &QueueSetting::default(), metrics)?);
//!
//! // Broker listener threads hand records over
//! let feed = subscriber.clone();
//! consumer.on_message(move |record| feed.push(record));
//!
//! let task = TaskBuilder::new("orders")
//!     .with_retry(retry_policy)
//!     .sync(|record: SubscriberRecord<Order>| handle(record))?;
//!
//! let processor = Processor::new(MessagingType::Kafka, subscriber, Arc::new(task));
//! let mut outcomes = processor.process();
//! while let Some(outcome) = outcomes.next().await { /* ... */ }
//! ```

mod batch;
mod composite;
mod config;
mod error;
mod health;
pub mod metrics;
mod pool;
mod processor;
mod queue;
mod registry;
mod resilience;
mod subscriber;
mod task;
mod trace;

// Re-export main types
pub use batch::{BatchProcessOutcome, BatchProcessResult, BatchProcessor};
pub use composite::{Aggregator, ParallelTask, SequentialTask, default_aggregator};
pub use config::{
    BackoffPolicy, CircuitBreakerSetting, ENV_PREFIX, PollSetting, QueueSetting, RetrySetting,
    TaskSetting, ThreadPoolSetting,
};
pub use error::{AckError, ErrorCategory, PipelineError, PullError, TaskError};
pub use health::{HealthResponse, HealthState, QueueReport, health_router};
pub use metrics::{MessagingMetrics, MetricsRegistry, MetricsSink, Sample, init_metrics};
pub use pool::ThreadPool;
pub use processor::{ProcessOutcome, ProcessResult, Processor};
pub use queue::{MessageQueue, QueueStatus};
pub use registry::{MessagingType, ResourceRegistry};
pub use resilience::{CircuitBreaker, CircuitState, RetryPolicy};
pub use subscriber::{
    Acknowledgeable, Acknowledgment, BatchPuller, BatchSubscriberFlow, PollingBatchSubscriber,
    QueueSubscriber, SubscriberFlow, SubscriberRecord, acknowledge_all, acknowledge_quietly,
};
pub use task::{
    EmptyRequestHandler, ExceptionHandler, FunctionTask, Task, TaskBuilder, TaskExecutionContext,
    TaskResult,
};
pub use trace::{
    TRACEPARENT_HEADER, TRACESTATE_HEADER, TraceCarrier, TraceContext, TracePropagator,
    W3cPropagator, consumer_span,
};
#[cfg(feature = "opentelemetry")]
pub use trace::remote_context;

//! Subscriber contracts and the records they deliver.
//!
//! A subscriber exposes the broker as a lazy stream: [`SubscriberFlow`]
//! yields single records, [`BatchSubscriberFlow`] yields non-empty batches.
//! Records carry their own acknowledgment through [`Acknowledgeable`].
//!
//! Two adapters cover the usual broker client shapes:
//!
//! - [`QueueSubscriber`]: push-style clients invoking a callback on their own
//!   threads (Kafka listeners)
//! - [`PollingBatchSubscriber`]: pull-style clients (Pub/Sub, SQS)

use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{PollSetting, QueueSetting};
use crate::error::{AckError, PipelineError, PullError, panic_message};
use crate::metrics::{MessagingMetrics, MetricsSink};
use crate::queue::MessageQueue;
use crate::trace::TraceCarrier;

/// Lazy stream of single records from a broker.
pub trait SubscriberFlow<T>: Send + Sync {
    fn name(&self) -> &str;

    /// Start a stream of records.
    fn stream(&self) -> BoxStream<'static, T>;

    /// Ask the source to stop. Streams complete after the in-flight pull.
    fn stop(&self) {}
}

/// Lazy stream of record batches from a broker. Batches are never empty.
pub trait BatchSubscriberFlow<T>: Send + Sync {
    fn name(&self) -> &str;

    fn stream(&self) -> BoxStream<'static, Vec<T>>;

    fn stop(&self) {}
}

/// Broker-specific acknowledgment handle
#[async_trait]
pub trait Acknowledgment: Send + Sync {
    async fn acknowledge(&self) -> Result<(), AckError>;
}

/// A record that can acknowledge itself to its broker
#[async_trait]
pub trait Acknowledgeable: Send + Sync {
    async fn acknowledge(&self) -> Result<(), AckError>;
}

/// Acknowledge a record, reporting failures and panics as `false`.
pub async fn acknowledge_quietly<R>(record: &R) -> bool
where
    R: Acknowledgeable + ?Sized,
{
    match AssertUnwindSafe(record.acknowledge()).catch_unwind().await {
        Ok(Ok(())) => true,
        Ok(Err(error)) => {
            warn!(error = %error, "Failed to acknowledge record");
            false
        }
        Err(panic) => {
            warn!(panic = %panic_message(panic.as_ref()), "Acknowledgment panicked");
            false
        }
    }
}

/// Acknowledge every record concurrently, returning how many succeeded.
pub async fn acknowledge_all<R: Acknowledgeable>(records: &[R]) -> usize {
    futures::future::join_all(records.iter().map(acknowledge_quietly))
        .await
        .into_iter()
        .filter(|acknowledged| *acknowledged)
        .count()
}

/// A delivered message with its acknowledgment handle.
#[derive(Clone)]
pub struct SubscriberRecord<T> {
    pub id: String,
    pub data: T,
    pub headers: HashMap<String, String>,
    pub received_at: DateTime<Utc>,
    ack: Arc<dyn Acknowledgment>,
}

impl<T> SubscriberRecord<T> {
    pub fn new(data: T, ack: Arc<dyn Acknowledgment>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            data,
            headers: HashMap::new(),
            received_at: Utc::now(),
            ack,
        }
    }

    /// Use the broker's message id instead of a generated one
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Time since the record was received
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.received_at
    }

    /// Replace the payload, keeping id, headers and acknowledgment handle
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> SubscriberRecord<U> {
        SubscriberRecord {
            id: self.id,
            data: f(self.data),
            headers: self.headers,
            received_at: self.received_at,
            ack: self.ack,
        }
    }
}

#[async_trait]
impl<T: Send + Sync> Acknowledgeable for SubscriberRecord<T> {
    async fn acknowledge(&self) -> Result<(), AckError> {
        self.ack.acknowledge().await
    }
}

impl<T> TraceCarrier for SubscriberRecord<T> {
    fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

impl<T: PartialEq> PartialEq for SubscriberRecord<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.data == other.data && self.headers == other.headers
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for SubscriberRecord<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberRecord")
            .field("id", &self.id)
            .field("data", &self.data)
            .field("headers", &self.headers)
            .field("received_at", &self.received_at)
            .finish()
    }
}

/// Subscriber fed by broker callbacks through a [`MessageQueue`].
pub struct QueueSubscriber<R> {
    name: String,
    queue: MessageQueue<R>,
}

impl<R: Send + 'static> QueueSubscriber<R> {
    pub fn new(
        name: impl Into<String>,
        setting: &QueueSetting,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, PipelineError> {
        let name = name.into();
        let queue = MessageQueue::from_setting(name.clone(), setting, metrics)?;
        Ok(Self { name, queue })
    }

    /// Listener callback: enqueue a record, blocking while the queue is full.
    pub fn push(&self, record: R) {
        self.queue.push(record);
    }

    pub async fn push_async(&self, record: R) {
        self.queue.push_async(record).await;
    }

    pub fn queue(&self) -> &MessageQueue<R> {
        &self.queue
    }
}

impl<R: Send + 'static> SubscriberFlow<R> for QueueSubscriber<R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn stream(&self) -> BoxStream<'static, R> {
        self.queue
            .stream()
            .filter_map(futures::future::ready)
            .boxed()
    }

    fn stop(&self) {
        self.queue.stop();
    }
}

/// Source of batches for a [`PollingBatchSubscriber`]
#[async_trait]
pub trait BatchPuller<T>: Send + Sync {
    /// Pull the next batch. An empty batch means nothing is available.
    async fn pull(&self) -> Result<Vec<T>, PullError>;
}

/// Pull-loop subscriber.
///
/// Empty pulls are skipped after `poll_interval_ms`, failed pulls are logged,
/// counted and retried after `error_backoff_ms`. `stop()` lets the in-flight
/// pull finish, emits its batch and then completes the stream.
pub struct PollingBatchSubscriber<T, P> {
    name: String,
    puller: Arc<P>,
    setting: PollSetting,
    metrics: MessagingMetrics,
    stop_tx: watch::Sender<bool>,
    _record: PhantomData<fn() -> T>,
}

impl<T, P> PollingBatchSubscriber<T, P>
where
    T: Send + 'static,
    P: BatchPuller<T> + 'static,
{
    pub fn new(puller: P, setting: PollSetting, metrics: MessagingMetrics) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            name: metrics.name().to_string(),
            puller: Arc::new(puller),
            setting,
            metrics,
            stop_tx,
            _record: PhantomData,
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    fn batches(&self) -> BoxStream<'static, Vec<T>> {
        let state = PullLoop {
            puller: Arc::clone(&self.puller),
            stop: self.stop_tx.subscribe(),
            metrics: self.metrics.clone(),
            poll_interval: Duration::from_millis(self.setting.poll_interval_ms),
            error_backoff: Duration::from_millis(self.setting.error_backoff_ms),
            _record: PhantomData,
        };
        futures::stream::unfold(state, |mut state| async move {
            let batch = state.next_batch().await?;
            Some((batch, state))
        })
        .boxed()
    }

    fn signal_stop(&self) {
        if !self.stop_tx.send_replace(true) {
            info!(subscriber = %self.name, "Polling subscriber stopped");
        }
    }
}

struct PullLoop<T, P> {
    puller: Arc<P>,
    stop: watch::Receiver<bool>,
    metrics: MessagingMetrics,
    poll_interval: Duration,
    error_backoff: Duration,
    _record: PhantomData<fn() -> T>,
}

impl<T, P> PullLoop<T, P>
where
    T: Send + 'static,
    P: BatchPuller<T>,
{
    async fn next_batch(&mut self) -> Option<Vec<T>> {
        loop {
            if *self.stop.borrow() {
                debug!(subscriber = %self.metrics.name(), "Pull loop finished");
                return None;
            }

            let sample = self.metrics.sink().start_sample();
            let result = self.puller.pull().await;
            self.metrics.pull_time(sample);

            match result {
                Ok(batch) if !batch.is_empty() => {
                    self.metrics.pulled(batch.len() as u64);
                    return Some(batch);
                }
                Ok(_) => self.pause(self.poll_interval).await,
                Err(error) => {
                    warn!(subscriber = %self.metrics.name(), error = %error, "Pull failed");
                    self.metrics.pull_failed("pull_error");
                    self.pause(self.error_backoff).await;
                }
            }
        }
    }

    async fn pause(&mut self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.stop.wait_for(|stopped| *stopped) => {}
        }
    }
}

impl<T, P> BatchSubscriberFlow<T> for PollingBatchSubscriber<T, P>
where
    T: Send + 'static,
    P: BatchPuller<T> + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn stream(&self) -> BoxStream<'static, Vec<T>> {
        self.batches()
    }

    fn stop(&self) {
        self.signal_stop();
    }
}

impl<T, P> SubscriberFlow<T> for PollingBatchSubscriber<T, P>
where
    T: Send + 'static,
    P: BatchPuller<T> + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn stream(&self) -> BoxStream<'static, T> {
        self.batches().flat_map(futures::stream::iter).boxed()
    }

    fn stop(&self) {
        self.signal_stop();
    }
}

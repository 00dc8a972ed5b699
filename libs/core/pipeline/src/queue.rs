//! Bounded queue bridging producer threads to an async stream.
//!
//! Broker client libraries often deliver records on their own threads
//! through callbacks. [`MessageQueue::push`] blocks such a thread while the
//! queue is full, which is the backpressure towards the broker, and
//! [`MessageQueue::stream`] hands the records to the async side.
//!
//! ```text
//!  listener thread ──push──▶ ┌──────────────┐ ──stream──▶ processor
//!  listener thread ──push──▶ │ MessageQueue │
//!                            └──────────────┘
//! ```
//!
//! The stream yields `Option<T>`. `None` is a sentinel emitted once when
//! every producer handle was dropped without [`MessageQueue::stop`]; the
//! stream ends right after it. After `stop()` the stream drains whatever is
//! still buffered and then completes.

use std::sync::Arc;

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::QueueSetting;
use crate::error::PipelineError;
use crate::metrics::{MetricsRegistry, MetricsSink, Sample, label, names, tags};

/// Read-only view of a queue for health reporting
pub trait QueueStatus: Send + Sync {
    fn name(&self) -> &str;
    fn capacity(&self) -> usize;
    fn len(&self) -> usize;
    fn is_stopped(&self) -> bool;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Shared<T> {
    name: String,
    capacity: usize,
    receiver: Mutex<mpsc::Receiver<T>>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    metrics: Arc<dyn MetricsSink>,
}

/// Why an item was not enqueued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    Stopped,
    Closed,
}

impl Rejection {
    fn reason(&self) -> &'static str {
        match self {
            Rejection::Stopped => "stopped",
            Rejection::Closed => "closed",
        }
    }
}

/// Bounded multi-producer queue.
///
/// Cloning produces another producer handle for the same queue.
pub struct MessageQueue<T> {
    shared: Arc<Shared<T>>,
    sender: mpsc::Sender<T>,
}

impl<T> Clone for MessageQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            sender: self.sender.clone(),
        }
    }
}

impl<T: Send + 'static> MessageQueue<T> {
    pub fn new(name: impl Into<String>, capacity: usize) -> Result<Self, PipelineError> {
        Self::with_metrics(name, capacity, MetricsRegistry::shared())
    }

    pub fn from_setting(
        name: impl Into<String>,
        setting: &QueueSetting,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, PipelineError> {
        Self::with_metrics(name, setting.capacity, metrics)
    }

    pub fn with_metrics(
        name: impl Into<String>,
        capacity: usize,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, PipelineError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(PipelineError::blank_name("queue"));
        }
        if capacity == 0 {
            return Err(PipelineError::InvalidArgument(format!(
                "queue '{name}' capacity must be greater than zero"
            )));
        }

        let (sender, receiver) = mpsc::channel(capacity);
        let (stop_tx, stop_rx) = watch::channel(false);
        debug!(queue = %name, capacity, "Message queue created");

        Ok(Self {
            shared: Arc::new(Shared {
                name,
                capacity,
                receiver: Mutex::new(receiver),
                stop_tx,
                stop_rx,
                metrics,
            }),
            sender,
        })
    }

    /// Enqueue an item, blocking the calling thread while the queue is full.
    ///
    /// Meant for broker listener threads. Async code should use
    /// [`push_async`](Self::push_async) instead. Items pushed after `stop()`
    /// are logged, counted and dropped. Returns `self` so pushes can be
    /// chained.
    pub fn push(&self, item: T) -> &Self {
        let sample = self.shared.metrics.start_sample();
        let result = futures::executor::block_on(self.send(item));
        self.record_enqueue(sample, result);
        self
    }

    /// Enqueue an item, waiting asynchronously while the queue is full.
    pub async fn push_async(&self, item: T) -> &Self {
        let sample = self.shared.metrics.start_sample();
        let result = self.send(item).await;
        self.record_enqueue(sample, result);
        self
    }

    /// Stream of queued items.
    ///
    /// Streams created from clones of the same queue compete for items.
    pub fn stream(&self) -> BoxStream<'static, Option<T>> {
        let state = Drain {
            shared: Arc::clone(&self.shared),
            stop: self.shared.stop_rx.clone(),
            draining: false,
            finished: false,
        };
        futures::stream::unfold(state, |mut state| async move {
            let next = state.next().await;
            next.map(|item| (item, state))
        })
        .boxed()
    }

    /// Stop the queue. Idempotent.
    ///
    /// Blocked and future pushes are rejected, streams finish after draining
    /// the buffered items.
    pub fn stop(&self) {
        if !self.shared.stop_tx.send_replace(true) {
            info!(queue = %self.shared.name, "Message queue stopped");
        }
    }

    async fn send(&self, item: T) -> Result<(), Rejection> {
        if self.is_stopped() {
            return Err(Rejection::Stopped);
        }
        let mut stop = self.shared.stop_rx.clone();
        tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => Err(Rejection::Stopped),
            result = self.sender.send(item) => result.map_err(|_| Rejection::Closed),
        }
    }

    fn record_enqueue(&self, sample: Sample, result: Result<(), Rejection>) {
        let metrics = &self.shared.metrics;
        let name = label(tags::NAME, self.shared.name.as_str());
        let (status, reason) = match result {
            Ok(()) => (tags::SUCCESS, tags::SUCCESS),
            Err(rejection) => {
                warn!(
                    queue = %self.shared.name,
                    reason = rejection.reason(),
                    "Dropping item pushed to unavailable queue"
                );
                (tags::FAILURE, rejection.reason())
            }
        };
        metrics.increment_counter(
            names::ENQUEUE_COUNT,
            1,
            &[name.clone(), label(tags::STATUS, status), label(tags::REASON, reason)],
        );
        metrics.end_sample(sample, names::ENQUEUE_TIME, &[name.clone()]);
        metrics.set_gauge(names::QUEUE_DEPTH, self.len() as f64, &[name]);
    }
}

impl<T: Send + 'static> QueueStatus for MessageQueue<T> {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn capacity(&self) -> usize {
        self.shared.capacity
    }

    fn len(&self) -> usize {
        self.shared.capacity - self.sender.capacity()
    }

    fn is_stopped(&self) -> bool {
        *self.shared.stop_rx.borrow()
    }
}

impl<T> std::fmt::Debug for MessageQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue")
            .field("name", &self.shared.name)
            .field("capacity", &self.shared.capacity)
            .field("stopped", &*self.shared.stop_rx.borrow())
            .finish()
    }
}

/// Consumer side state of one stream
struct Drain<T> {
    shared: Arc<Shared<T>>,
    stop: watch::Receiver<bool>,
    draining: bool,
    finished: bool,
}

enum Received<T> {
    Stop,
    Item(Option<T>),
}

impl<T: Send + 'static> Drain<T> {
    /// `None` ends the stream, `Some(None)` is the sentinel.
    async fn next(&mut self) -> Option<Option<T>> {
        if self.finished {
            return None;
        }
        let mut receiver = self.shared.receiver.lock().await;
        let sample = self.shared.metrics.start_sample();

        if !self.draining {
            let received = tokio::select! {
                biased;
                _ = self.stop.wait_for(|stopped| *stopped) => Received::Stop,
                item = receiver.recv() => Received::Item(item),
            };
            match received {
                Received::Item(Some(item)) => {
                    self.record_dequeue(sample, tags::SUCCESS, tags::SUCCESS);
                    return Some(Some(item));
                }
                Received::Item(None) => {
                    warn!(queue = %self.shared.name, "All producers dropped without stop, ending stream");
                    self.finished = true;
                    self.record_dequeue(sample, tags::FAILURE, "producers_dropped");
                    return Some(None);
                }
                Received::Stop => {
                    debug!(queue = %self.shared.name, "Draining stopped queue");
                    receiver.close();
                    self.draining = true;
                }
            }
        }

        match receiver.recv().await {
            Some(item) => {
                self.record_dequeue(sample, tags::SUCCESS, tags::SUCCESS);
                Some(Some(item))
            }
            None => {
                self.finished = true;
                None
            }
        }
    }

    fn record_dequeue(&self, sample: Sample, status: &str, reason: &str) {
        let metrics = &self.shared.metrics;
        let name = label(tags::NAME, self.shared.name.as_str());
        metrics.increment_counter(
            names::DEQUEUE_COUNT,
            1,
            &[name.clone(), label(tags::STATUS, status), label(tags::REASON, reason)],
        );
        metrics.end_sample(sample, names::DEQUEUE_TIME, &[name]);
    }
}

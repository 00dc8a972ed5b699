//! Acknowledgment handles with scripted behaviour.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use message_pipeline::{AckError, Acknowledgment, SubscriberRecord};

/// How a [`TestAck`] answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    Succeed,
    Fail,
    Panic,
}

/// Acknowledgment handle that counts its calls.
#[derive(Debug)]
pub struct TestAck {
    mode: AckMode,
    calls: AtomicUsize,
}

impl TestAck {
    pub fn new(mode: AckMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn succeeding() -> Arc<Self> {
        Self::new(AckMode::Succeed)
    }

    pub fn failing() -> Arc<Self> {
        Self::new(AckMode::Fail)
    }

    pub fn panicking() -> Arc<Self> {
        Self::new(AckMode::Panic)
    }

    /// Number of acknowledge calls so far, whatever their outcome
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Acknowledgment for TestAck {
    async fn acknowledge(&self) -> Result<(), AckError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            AckMode::Succeed => Ok(()),
            AckMode::Fail => Err(AckError::new("acknowledgment rejected by test broker")),
            AckMode::Panic => panic!("test acknowledgment panicked"),
        }
    }
}

/// A record acknowledged through `ack`
pub fn record<T>(data: T, ack: &Arc<TestAck>) -> SubscriberRecord<T> {
    SubscriberRecord::new(data, ack.clone())
}

/// One record per item, all sharing `ack`
pub fn records<T>(data: impl IntoIterator<Item = T>, ack: &Arc<TestAck>) -> Vec<SubscriberRecord<T>> {
    data.into_iter().map(|item| record(item, ack)).collect()
}

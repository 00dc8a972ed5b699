//! Finite subscriber flows and scripted pullers.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use message_pipeline::{BatchPuller, BatchSubscriberFlow, PullError, SubscriberFlow};

/// Single-record flow over a fixed list. Every stream replays the list.
#[derive(Debug)]
pub struct VecFlow<T> {
    name: String,
    items: Vec<T>,
    stops: AtomicUsize,
}

impl<T> VecFlow<T> {
    pub fn new(name: impl Into<String>, items: Vec<T>) -> Self {
        Self {
            name: name.into(),
            items,
            stops: AtomicUsize::new(0),
        }
    }

    /// How many times `stop()` was called
    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl<T> SubscriberFlow<T> for VecFlow<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn stream(&self) -> BoxStream<'static, T> {
        stream::iter(self.items.clone()).boxed()
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Batch flow over fixed batches. Empty batches are skipped.
#[derive(Debug)]
pub struct VecBatchFlow<T> {
    name: String,
    batches: Vec<Vec<T>>,
}

impl<T> VecBatchFlow<T> {
    pub fn new(name: impl Into<String>, batches: Vec<Vec<T>>) -> Self {
        Self {
            name: name.into(),
            batches,
        }
    }
}

impl<T> BatchSubscriberFlow<T> for VecBatchFlow<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn stream(&self) -> BoxStream<'static, Vec<T>> {
        let batches: Vec<Vec<T>> = self
            .batches
            .iter()
            .filter(|batch| !batch.is_empty())
            .cloned()
            .collect();
        stream::iter(batches).boxed()
    }
}

/// Puller answering from a script, then with empty pulls.
#[derive(Debug, Default)]
pub struct ScriptedPuller<T> {
    script: Mutex<VecDeque<Result<Vec<T>, PullError>>>,
    pulls: AtomicUsize,
}

impl<T> ScriptedPuller<T> {
    pub fn new(script: impl IntoIterator<Item = Result<Vec<T>, PullError>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            pulls: AtomicUsize::new(0),
        }
    }

    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T: Send + 'static> BatchPuller<T> for ScriptedPuller<T> {
    async fn pull(&self) -> Result<Vec<T>, PullError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .script
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front();
        next.unwrap_or_else(|| Ok(Vec::new()))
    }
}

//! Tasks composed from other tasks.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, warn};

use crate::error::TaskError;
use crate::metrics::{MetricsRegistry, MetricsSink, label, names, tags};
use crate::task::{ExceptionHandler, Task, TaskResult, record_task_result};

/// Feeds the result of one task into the next.
///
/// A failure of the first task reaches the second as a pre-failed input,
/// so the second task's exception handler decides what happens to it.
pub struct SequentialTask<A, B, C> {
    name: String,
    first: Arc<dyn Task<A, B>>,
    second: Arc<dyn Task<B, C>>,
    metrics: Arc<dyn MetricsSink>,
}

impl<A, B, C> SequentialTask<A, B, C>
where
    A: Send + 'static,
    B: Send + 'static,
    C: Send + 'static,
{
    pub fn new(first: Arc<dyn Task<A, B>>, second: Arc<dyn Task<B, C>>) -> Self {
        let name = format!("seq_{}_{}", first.name(), second.name());
        Self {
            name,
            first,
            second,
            metrics: MetricsRegistry::shared(),
        }
    }

    /// Override the generated `seq_<first>_<second>` name. Blank names are ignored.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !name.trim().is_empty() {
            self.name = name;
        }
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }
}

#[async_trait]
impl<A, B, C> Task<A, C> for SequentialTask<A, B, C>
where
    A: Send + 'static,
    B: Send + 'static,
    C: Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, request: TaskResult<A>) -> TaskResult<C> {
        let sample = self.metrics.start_sample();
        let intermediate = self.first.execute(request).await;
        let result = self.second.execute(intermediate).await;

        // Outcome counts belong to the inner tasks; only time the whole chain.
        self.metrics
            .end_sample(sample, names::TASK_EXECUTION_TIME, &[label(tags::NAME, self.name.as_str())]);
        result
    }
}

/// Combines per-element results into the parallel task's result
pub type Aggregator<Resp> = Arc<dyn Fn(Vec<TaskResult<Resp>>) -> TaskResult<Vec<Resp>> + Send + Sync>;

/// Fails with the first error only when no element succeeded; otherwise
/// keeps the present responses of successful elements in request order.
pub fn default_aggregator<Resp>(results: Vec<TaskResult<Resp>>) -> TaskResult<Vec<Resp>> {
    if !results.is_empty() && results.iter().all(Result::is_err) {
        let first_error = results.into_iter().find_map(Result::err);
        return Err(first_error.unwrap_or_else(|| TaskError::permanent("no element succeeded")));
    }
    Ok(Some(results.into_iter().filter_map(|r| r.ok().flatten()).collect()))
}

/// Runs one element task over every request of a list concurrently.
pub struct ParallelTask<Req, Resp> {
    name: String,
    element: Arc<dyn Task<Req, Resp>>,
    aggregator: Aggregator<Resp>,
    exception_handler: Option<ExceptionHandler<Vec<Resp>>>,
    metrics: Arc<dyn MetricsSink>,
}

impl<Req, Resp> ParallelTask<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub fn new(element: Arc<dyn Task<Req, Resp>>) -> Self {
        Self {
            name: format!("homogeneous_parallel_{}", element.name()),
            element,
            aggregator: Arc::new(default_aggregator::<Resp>),
            exception_handler: None,
            metrics: MetricsRegistry::shared(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !name.trim().is_empty() {
            self.name = name;
        }
        self
    }

    pub fn with_aggregator<F>(mut self, aggregator: F) -> Self
    where
        F: Fn(Vec<TaskResult<Resp>>) -> TaskResult<Vec<Resp>> + Send + Sync + 'static,
    {
        self.aggregator = Arc::new(aggregator);
        self
    }

    /// Handles a pre-failed list input
    pub fn with_exception_handler<H>(mut self, handler: H) -> Self
    where
        H: Fn(&TaskError) -> Option<Vec<Resp>> + Send + Sync + 'static,
    {
        self.exception_handler = Some(Arc::new(handler));
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    async fn run(&self, requests: Vec<Req>) -> TaskResult<Vec<Resp>> {
        debug!(task = %self.name, size = requests.len(), "Executing elements in parallel");
        let results = join_all(requests.into_iter().map(|request| self.element.execute_value(request))).await;
        (self.aggregator)(results)
    }
}

#[async_trait]
impl<Req, Resp> Task<Vec<Req>, Vec<Resp>> for ParallelTask<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, request: TaskResult<Vec<Req>>) -> TaskResult<Vec<Resp>> {
        let sample = self.metrics.start_sample();
        let result = match request {
            Ok(requests) => self.run(requests.unwrap_or_default()).await,
            Err(error) => match &self.exception_handler {
                Some(handler) => Ok(handler(&error)),
                None => {
                    warn!(task = %self.name, error = %error, "Input failed and no exception handler is set");
                    Err(error)
                }
            },
        };
        record_task_result(self.metrics.as_ref(), &self.name, sample, &result);
        result
    }
}

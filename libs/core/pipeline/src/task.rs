//! Tasks: named units of work run under execution policies.
//!
//! A [`FunctionTask`] wraps a processing function (blocking or async) and
//! applies, from the outside in:
//!
//! 1. the circuit breaker, one permit per invocation
//! 2. the retry policy, re-invoking on transient failures
//! 3. the thread pool the function runs on
//!
//! Whatever happens, `execute` returns a [`TaskResult`]. Panics in the
//! processing function become [`TaskError::Panicked`], and a configured
//! exception handler can turn any failure into a fallback response.
//!
//! ## Example
//!
//! ```rust,ignore
//! use message_pipeline::{TaskBuilder, TaskError, Task};
//!
//! let parse = TaskBuilder::new("parse_order")
//!     .with_retry(retry_policy)
//!     .with_exception_handler(|_err| Some(Order::rejected()))
//!     .sync(|raw: String| {
//!         serde_json::from_str::<Order>(&raw)
//!             .map(Some)
//!             .map_err(|e| TaskError::permanent(e.to_string()))
//!     })?;
//!
//! let order = parse.execute_value(raw).await?;
//! ```

use std::future::Future;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::error::{PipelineError, TaskError};
use crate::metrics::{MetricsRegistry, MetricsSink, Sample, label, names, tags};
use crate::pool::ThreadPool;
use crate::resilience::{CircuitBreaker, RetryPolicy};

/// Outcome of a task: a response, an absent response, or a failure
pub type TaskResult<T> = Result<Option<T>, TaskError>;

/// Converts a failure into a fallback response instead of propagating it
pub type ExceptionHandler<Resp> = Arc<dyn Fn(&TaskError) -> Option<Resp> + Send + Sync>;

/// Produces the response for an absent request
pub type EmptyRequestHandler<Resp> = Arc<dyn Fn() -> Option<Resp> + Send + Sync>;

type SyncFn<Req, Resp> = Arc<dyn Fn(Req) -> TaskResult<Resp> + Send + Sync>;
type AsyncFn<Req, Resp> = Arc<dyn Fn(Req) -> BoxFuture<'static, TaskResult<Resp>> + Send + Sync>;

/// A named unit of work.
///
/// Implementations are built once when the pipeline is wired and shared
/// between concurrent invocations.
#[async_trait]
pub trait Task<Req, Resp>: Send + Sync
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Name used for logs, metrics and policy lookup
    fn name(&self) -> &str;

    /// Execute the task.
    ///
    /// - `Ok(Some(request))`: run the processing function
    /// - `Ok(None)`: no input, answered by the empty-request handler
    /// - `Err(error)`: the input already failed upstream
    async fn execute(&self, request: TaskResult<Req>) -> TaskResult<Resp>;

    async fn execute_value(&self, request: Req) -> TaskResult<Resp> {
        self.execute(Ok(Some(request))).await
    }
}

/// Policies and metrics a task runs with.
///
/// The thread pool and circuit breaker are shared handles, typically owned
/// by a [`ResourceRegistry`](crate::ResourceRegistry).
#[derive(Clone)]
pub struct TaskExecutionContext {
    pub thread_pool: Option<Arc<ThreadPool>>,
    pub retry: Option<RetryPolicy>,
    pub circuit_breaker: Option<Arc<CircuitBreaker>>,
    pub metrics: Arc<dyn MetricsSink>,
}

impl TaskExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thread_pool(mut self, pool: Arc<ThreadPool>) -> Self {
        self.thread_pool = Some(pool);
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }
}

impl Default for TaskExecutionContext {
    fn default() -> Self {
        Self {
            thread_pool: None,
            retry: None,
            circuit_breaker: None,
            metrics: MetricsRegistry::shared(),
        }
    }
}

impl std::fmt::Debug for TaskExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutionContext")
            .field("thread_pool", &self.thread_pool.as_ref().map(|p| p.name()))
            .field("retry", &self.retry)
            .field("circuit_breaker", &self.circuit_breaker.as_ref().map(|b| b.name()))
            .finish()
    }
}

enum ProcessingFn<Req, Resp> {
    Sync(SyncFn<Req, Resp>),
    Async(AsyncFn<Req, Resp>),
}

/// Builder for [`FunctionTask`].
pub struct TaskBuilder<Req, Resp> {
    name: String,
    context: TaskExecutionContext,
    exception_handler: Option<ExceptionHandler<Resp>>,
    empty_request_handler: Option<EmptyRequestHandler<Resp>>,
    _request: PhantomData<fn(Req)>,
}

impl<Req, Resp> TaskBuilder<Req, Resp>
where
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            context: TaskExecutionContext::default(),
            exception_handler: None,
            empty_request_handler: None,
            _request: PhantomData,
        }
    }

    /// Replace the whole execution context
    pub fn with_context(mut self, context: TaskExecutionContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_thread_pool(mut self, pool: Arc<ThreadPool>) -> Self {
        self.context.thread_pool = Some(pool);
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.context.retry = Some(policy);
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.context.circuit_breaker = Some(breaker);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.context.metrics = metrics;
        self
    }

    pub fn with_exception_handler<H>(mut self, handler: H) -> Self
    where
        H: Fn(&TaskError) -> Option<Resp> + Send + Sync + 'static,
    {
        self.exception_handler = Some(Arc::new(handler));
        self
    }

    pub fn with_empty_request_handler<H>(mut self, handler: H) -> Self
    where
        H: Fn() -> Option<Resp> + Send + Sync + 'static,
    {
        self.empty_request_handler = Some(Arc::new(handler));
        self
    }

    /// Build a task around a blocking processing function.
    ///
    /// With a thread pool the function runs on one of the pool's threads,
    /// otherwise on the calling task.
    pub fn sync<F>(self, processor: F) -> Result<FunctionTask<Req, Resp>, PipelineError>
    where
        F: Fn(Req) -> TaskResult<Resp> + Send + Sync + 'static,
    {
        self.build(ProcessingFn::Sync(Arc::new(processor)))
    }

    /// Build a task around an async processing function.
    pub fn asynchronous<F, Fut>(self, processor: F) -> Result<FunctionTask<Req, Resp>, PipelineError>
    where
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult<Resp>> + Send + 'static,
    {
        let processor: AsyncFn<Req, Resp> = Arc::new(move |request| processor(request).boxed());
        self.build(ProcessingFn::Async(processor))
    }

    fn build(self, processing: ProcessingFn<Req, Resp>) -> Result<FunctionTask<Req, Resp>, PipelineError> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::blank_name("task"));
        }
        Ok(FunctionTask {
            name: self.name,
            processing,
            context: self.context,
            exception_handler: self.exception_handler,
            empty_request_handler: self.empty_request_handler,
        })
    }
}

/// A task backed by a processing function.
pub struct FunctionTask<Req, Resp> {
    name: String,
    processing: ProcessingFn<Req, Resp>,
    context: TaskExecutionContext,
    exception_handler: Option<ExceptionHandler<Resp>>,
    empty_request_handler: Option<EmptyRequestHandler<Resp>>,
}

impl<Req, Resp> FunctionTask<Req, Resp>
where
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    pub fn context(&self) -> &TaskExecutionContext {
        &self.context
    }

    pub fn is_async(&self) -> bool {
        matches!(self.processing, ProcessingFn::Async(_))
    }

    async fn invoke(&self, request: Req) -> TaskResult<Resp> {
        let Some(breaker) = &self.context.circuit_breaker else {
            return self.invoke_with_retry(request).await;
        };

        if !breaker.try_acquire() {
            debug!(task = %self.name, circuit_breaker = %breaker.name(), "Call not permitted");
            return Err(TaskError::CircuitOpen(breaker.name().to_string()));
        }

        let permit = BreakerPermit::new(breaker);
        let result = self.invoke_with_retry(request).await;
        permit.settle(result.is_ok());
        result
    }

    async fn invoke_with_retry(&self, request: Req) -> TaskResult<Resp> {
        let Some(policy) = self.context.retry else {
            return self.dispatch(request).await;
        };

        let mut retries = 0;
        loop {
            let error = match self.dispatch(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };
            if !policy.should_retry(&error, retries) {
                return Err(error);
            }
            retries += 1;
            let delay = policy.delay_for_retry(retries);
            debug!(
                task = %self.name,
                retry = retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying task"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn dispatch(&self, request: Req) -> TaskResult<Resp> {
        match (&self.processing, &self.context.thread_pool) {
            (ProcessingFn::Sync(processor), Some(pool)) => {
                let processor = Arc::clone(processor);
                pool.run_blocking(move || processor(request)).await?
            }
            (ProcessingFn::Sync(processor), None) => catch_unwind(AssertUnwindSafe(|| processor(request)))
                .unwrap_or_else(|panic| Err(TaskError::from_panic(panic))),
            (ProcessingFn::Async(processor), Some(pool)) => pool.spawn(processor(request)).await?,
            (ProcessingFn::Async(processor), None) => AssertUnwindSafe(processor(request))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(TaskError::from_panic(panic))),
        }
    }

    fn handle_failure(&self, error: TaskError) -> TaskResult<Resp> {
        match &self.exception_handler {
            Some(handler) => {
                debug!(task = %self.name, error = %error, "Failure converted by exception handler");
                Ok(handler(&error))
            }
            None => {
                warn!(task = %self.name, error = %error, reason = error.reason(), "Task failed");
                Err(error)
            }
        }
    }
}

#[async_trait]
impl<Req, Resp> Task<Req, Resp> for FunctionTask<Req, Resp>
where
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, request: TaskResult<Req>) -> TaskResult<Resp> {
        let sample = self.context.metrics.start_sample();

        let result = match request {
            Ok(Some(request)) => match self.invoke(request).await {
                Ok(response) => Ok(response),
                Err(error) => self.handle_failure(error),
            },
            Ok(None) => {
                debug!(task = %self.name, "Empty request");
                Ok(self.empty_request_handler.as_ref().and_then(|handler| handler()))
            }
            Err(error) => self.handle_failure(error),
        };

        record_task_result(self.context.metrics.as_ref(), &self.name, sample, &result);
        result
    }
}

impl<Req, Resp> std::fmt::Debug for FunctionTask<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionTask")
            .field("name", &self.name)
            .field("context", &self.context)
            .finish()
    }
}

/// Record `task_result_count` and `task_execution_time` for one execution
pub(crate) fn record_task_result<T>(
    metrics: &dyn MetricsSink,
    name: &str,
    sample: Sample,
    result: &TaskResult<T>,
) {
    let (status, reason) = match result {
        Ok(_) => (tags::SUCCESS, tags::SUCCESS),
        Err(error) => (tags::FAILURE, error.reason()),
    };
    metrics.increment_counter(
        names::TASK_RESULT_COUNT,
        1,
        &[
            label(tags::NAME, name),
            label(tags::STATUS, status),
            label(tags::REASON, reason),
        ],
    );
    metrics.end_sample(sample, names::TASK_EXECUTION_TIME, &[label(tags::NAME, name)]);
}

/// Circuit breaker permit held for the duration of one invocation.
///
/// Dropped without an outcome (the invocation was cancelled) it hands the
/// permit back so a half-open circuit cannot run out of trial calls.
struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(breaker: &'a CircuitBreaker) -> Self {
        Self {
            breaker,
            settled: false,
        }
    }

    fn settle(mut self, success: bool) {
        if success {
            self.breaker.record_success();
        } else {
            self.breaker.record_failure();
        }
        self.settled = true;
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release();
        }
    }
}

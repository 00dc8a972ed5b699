//! Named thread pools.
//!
//! Each pool owns a dedicated multi-thread tokio runtime, so a slow task
//! cannot starve the runtime that delivers messages. Admission is bounded:
//! at most `max_size` executions run at once and at most `queue_size` more
//! wait for a slot. Anything beyond that is rejected immediately.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

use crate::config::ThreadPoolSetting;
use crate::error::{PipelineError, TaskError};

pub struct ThreadPool {
    name: String,
    setting: ThreadPoolSetting,
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
    admission: Arc<Semaphore>,
    running: Arc<Semaphore>,
    shut_down: AtomicBool,
}

impl ThreadPool {
    pub fn new(name: impl Into<String>, setting: ThreadPoolSetting) -> Result<Self, PipelineError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(PipelineError::blank_name("thread pool"));
        }
        let setting = setting.normalized();

        let thread_prefix = name.clone();
        let thread_id = AtomicUsize::new(0);
        let runtime = Builder::new_multi_thread()
            .worker_threads(setting.core_size)
            .max_blocking_threads(setting.max_size)
            .thread_name_fn(move || {
                let id = thread_id.fetch_add(1, Ordering::Relaxed);
                format!("{thread_prefix}-{id}")
            })
            .enable_all()
            .build()
            .map_err(|source| PipelineError::ThreadPoolBuild {
                name: name.clone(),
                source,
            })?;

        info!(
            thread_pool = %name,
            core_size = setting.core_size,
            max_size = setting.max_size,
            queue_size = setting.queue_size,
            "Thread pool started"
        );

        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            admission: Arc::new(Semaphore::new(setting.max_size.saturating_add(setting.queue_size))),
            running: Arc::new(Semaphore::new(setting.max_size)),
            shut_down: AtomicBool::new(false),
            name,
            setting,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn setting(&self) -> &ThreadPoolSetting {
        &self.setting
    }

    /// Number of executions currently running
    pub fn active(&self) -> usize {
        self.setting.max_size - self.running.available_permits()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Run a blocking closure on one of the pool's threads.
    pub async fn run_blocking<F, R>(&self, f: F) -> Result<R, TaskError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let _permits = self.admit().await?;
        let handle = self.handle.spawn_blocking(f);
        self.join(handle).await
    }

    /// Drive a future to completion on the pool's runtime.
    pub async fn spawn<Fut>(&self, future: Fut) -> Result<Fut::Output, TaskError>
    where
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        let _permits = self.admit().await?;
        let handle = self.handle.spawn(future);
        self.join(handle).await
    }

    /// Stop accepting work and release the pool's threads.
    ///
    /// Running executions are not waited for. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.admission.close();
        self.running.close();
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
        info!(thread_pool = %self.name, "Thread pool shut down");
    }

    async fn admit(&self) -> Result<(OwnedSemaphorePermit, OwnedSemaphorePermit), TaskError> {
        if self.is_shut_down() {
            return Err(self.shut_down_error());
        }
        let queued = self.admission.clone().try_acquire_owned().map_err(|_| {
            warn!(thread_pool = %self.name, "Thread pool queue full, rejecting execution");
            TaskError::ThreadPool(format!("thread pool '{}' rejected execution", self.name))
        })?;
        let running = self
            .running
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| self.shut_down_error())?;
        Ok((queued, running))
    }

    async fn join<R>(&self, handle: JoinHandle<R>) -> Result<R, TaskError> {
        handle.await.map_err(|e| self.join_error(e))
    }

    fn join_error(&self, error: JoinError) -> TaskError {
        if error.is_panic() {
            debug!(thread_pool = %self.name, "Execution panicked");
            TaskError::from_panic(error.into_panic())
        } else {
            TaskError::ThreadPool(format!(
                "execution on thread pool '{}' was cancelled",
                self.name
            ))
        }
    }

    fn shut_down_error(&self) -> TaskError {
        TaskError::ThreadPool(format!("thread pool '{}' is shut down", self.name))
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("name", &self.name)
            .field("setting", &self.setting)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

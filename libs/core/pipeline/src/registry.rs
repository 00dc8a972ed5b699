//! Messaging types and the per-task resource registry.
//!
//! This module provides:
//! - `MessagingType` for the brokers a subscriber can sit on
//! - `ResourceRegistry`, which builds and caches the thread pools, retry
//!   policies and circuit breakers of named tasks

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};
use tracing::{debug, info};

use crate::config::TaskSetting;
use crate::error::PipelineError;
use crate::metrics::{MetricsRegistry, MetricsSink};
use crate::pool::ThreadPool;
use crate::resilience::{CircuitBreaker, RetryPolicy};
use crate::task::{TaskBuilder, TaskExecutionContext};

/// Broker kinds, used as the `messaging_type` metric tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MessagingType {
    Kafka,
    GcpPubsub,
    AwsSqs,
    /// In-process queues and tests
    InMemory,
}

impl MessagingType {
    pub fn all() -> impl Iterator<Item = Self> {
        Self::iter()
    }
}

/// Builds execution resources for named tasks from their settings.
///
/// Pools and breakers are created on first use and shared by every task
/// built for the same name.
///
/// # Example
///
/// ```rust,ignore
/// let registry = ResourceRegistry::from_env(&["order_events"], MetricsRegistry::shared())?;
/// let task = registry
///     .task_builder::<Order, Order>("order_events")?
///     .sync(handle_order)?;
/// ```
pub struct ResourceRegistry {
    settings: HashMap<String, TaskSetting>,
    metrics: Arc<dyn MetricsSink>,
    pools: Mutex<HashMap<String, Arc<ThreadPool>>>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl ResourceRegistry {
    pub fn new(metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            settings: HashMap::new(),
            metrics,
            pools: Mutex::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Register the settings of task `name`
    pub fn with_task(mut self, name: impl Into<String>, setting: TaskSetting) -> Self {
        self.settings.insert(name.into(), setting);
        self
    }

    /// Load the settings of every named task from `PIPELINE_<NAME>_*` variables.
    pub fn from_env(names: &[&str], metrics: Arc<dyn MetricsSink>) -> Result<Self, PipelineError> {
        let mut registry = Self::new(metrics);
        for name in names {
            let setting = TaskSetting::from_env(name)?;
            debug!(task = %name, ?setting, "Loaded task setting");
            registry.settings.insert((*name).to_string(), setting);
        }
        Ok(registry)
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    /// Settings of task `name`; unknown tasks run without policies.
    pub fn setting(&self, name: &str) -> TaskSetting {
        self.settings.get(name).copied().unwrap_or_default()
    }

    pub fn thread_pool(&self, name: &str) -> Result<Option<Arc<ThreadPool>>, PipelineError> {
        let Some(setting) = self.setting(name).thread_pool else {
            return Ok(None);
        };
        let mut pools = lock(&self.pools);
        if let Some(pool) = pools.get(name) {
            return Ok(Some(Arc::clone(pool)));
        }
        let pool = Arc::new(ThreadPool::new(name, setting)?);
        pools.insert(name.to_string(), Arc::clone(&pool));
        Ok(Some(pool))
    }

    pub fn retry_policy(&self, name: &str) -> Option<RetryPolicy> {
        self.setting(name)
            .retry
            .as_ref()
            .and_then(RetryPolicy::from_setting)
    }

    pub fn circuit_breaker(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        let setting = self.setting(name).circuit_breaker?;
        let mut breakers = lock(&self.breakers);
        let breaker = breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, setting)));
        Some(Arc::clone(breaker))
    }

    /// Execution context with every policy configured for `name`
    pub fn context(&self, name: &str) -> Result<TaskExecutionContext, PipelineError> {
        Ok(TaskExecutionContext {
            thread_pool: self.thread_pool(name)?,
            retry: self.retry_policy(name),
            circuit_breaker: self.circuit_breaker(name),
            metrics: Arc::clone(&self.metrics),
        })
    }

    /// Task builder pre-configured with the resources of `name`
    pub fn task_builder<Req, Resp>(&self, name: &str) -> Result<TaskBuilder<Req, Resp>, PipelineError>
    where
        Req: Clone + Send + 'static,
        Resp: Send + 'static,
    {
        Ok(TaskBuilder::new(name).with_context(self.context(name)?))
    }

    /// Shut down every pool created so far
    pub fn shutdown(&self) {
        let pools = lock(&self.pools);
        for pool in pools.values() {
            pool.shutdown();
        }
        info!(pools = pools.len(), "Resource registry shut down");
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new(MetricsRegistry::shared())
    }
}

impl std::fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("settings", &self.settings)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

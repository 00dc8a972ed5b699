//! Settings for thread pools, retry, circuit breakers, queues and pull loops.
//!
//! Every setting has a `Default`, `with_*` builder methods and a
//! `from_env(name)` loader reading `PIPELINE_<NAME>_<FIELD>` variables.
//! Out-of-range values are replaced by the defaults instead of failing, so a
//! half-configured deployment still runs with sane policies.

use core_config::{ConfigError, env_parse, env_parse_optional, scoped_key};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Prefix for every pipeline environment variable
pub const ENV_PREFIX: &str = "PIPELINE";

fn key(name: &str, field: &str) -> String {
    scoped_key(ENV_PREFIX, name, field)
}

/// Sizing of a named thread pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadPoolSetting {
    /// Worker threads kept alive by the pool
    pub core_size: usize,
    /// Maximum number of executions running at once
    pub max_size: usize,
    /// Submissions allowed to wait for a free slot before new ones are rejected
    pub queue_size: usize,
}

impl ThreadPoolSetting {
    pub const DEFAULT_CORE_SIZE: usize = 10;
    pub const DEFAULT_MAX_SIZE: usize = 20;
    pub const DEFAULT_QUEUE_SIZE: usize = 100;
    /// Upper bound for `core_size` and `max_size`
    pub const MAX_POOL_SIZE: usize = 4_096;
    /// Upper bound for `queue_size`
    pub const MAX_QUEUE_SIZE: usize = 1_000_000;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_core_size(mut self, core_size: usize) -> Self {
        self.core_size = core_size;
        self
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    /// Replace unusable values with defaults and clamp oversized ones.
    /// `max_size` never drops below `core_size`.
    pub fn normalized(self) -> Self {
        let core_size = if self.core_size == 0 {
            Self::DEFAULT_CORE_SIZE
        } else {
            self.core_size.min(Self::MAX_POOL_SIZE)
        };
        let max_size = if self.max_size == 0 {
            Self::DEFAULT_MAX_SIZE.max(core_size)
        } else {
            self.max_size.clamp(core_size, Self::MAX_POOL_SIZE)
        };
        Self {
            core_size,
            max_size,
            queue_size: self.queue_size.min(Self::MAX_QUEUE_SIZE),
        }
    }

    pub fn from_env(name: &str) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            core_size: env_parse(&key(name, "core_size"), defaults.core_size)?,
            max_size: env_parse(&key(name, "max_size"), defaults.max_size)?,
            queue_size: env_parse(&key(name, "queue_size"), defaults.queue_size)?,
        }
        .normalized())
    }
}

impl Default for ThreadPoolSetting {
    fn default() -> Self {
        Self {
            core_size: Self::DEFAULT_CORE_SIZE,
            max_size: Self::DEFAULT_MAX_SIZE,
            queue_size: Self::DEFAULT_QUEUE_SIZE,
        }
    }
}

/// How the delay between retries grows
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum BackoffPolicy {
    /// `initial * attempt`
    #[default]
    Linear,
    /// `initial * 2^(attempt - 1)`
    Exponential,
}

/// Retry policy setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySetting {
    /// Retries after the first failed attempt. `0` disables retry.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub backoff_policy: BackoffPolicy,
}

impl RetrySetting {
    pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 100;
    pub const MINIMUM_INITIAL_BACKOFF_MS: u64 = 1;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_backoff_ms(mut self, initial_backoff_ms: u64) -> Self {
        self.initial_backoff_ms = initial_backoff_ms;
        self
    }

    pub fn with_backoff_policy(mut self, backoff_policy: BackoffPolicy) -> Self {
        self.backoff_policy = backoff_policy;
        self
    }

    /// Whether this setting describes an active retry policy
    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 0
    }

    pub fn normalized(mut self) -> Self {
        if self.initial_backoff_ms < Self::MINIMUM_INITIAL_BACKOFF_MS {
            self.initial_backoff_ms = Self::DEFAULT_INITIAL_BACKOFF_MS;
        }
        self
    }

    pub fn from_env(name: &str) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            max_attempts: env_parse(&key(name, "max_attempts"), defaults.max_attempts)?,
            initial_backoff_ms: env_parse(
                &key(name, "initial_backoff_ms"),
                defaults.initial_backoff_ms,
            )?,
            backoff_policy: env_parse(&key(name, "backoff_policy"), defaults.backoff_policy)?,
        }
        .normalized())
    }
}

impl Default for RetrySetting {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_backoff_ms: Self::DEFAULT_INITIAL_BACKOFF_MS,
            backoff_policy: BackoffPolicy::Linear,
        }
    }
}

/// Failure-rate circuit breaker setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSetting {
    /// Failure percentage (1-100) at which the circuit opens
    pub failure_rate_threshold: u32,
    /// Number of most recent calls the failure rate is computed over
    pub sliding_window_size: u32,
    /// Calls that must be recorded before the failure rate is evaluated
    pub minimum_number_of_calls: u32,
    /// How long the circuit stays open before allowing trial calls
    pub wait_duration_in_open_state_ms: u64,
    /// Trial calls allowed while half-open
    pub permitted_calls_in_half_open_state: u32,
}

impl CircuitBreakerSetting {
    pub const DEFAULT_FAILURE_RATE_THRESHOLD: u32 = 50;
    pub const DEFAULT_SLIDING_WINDOW_SIZE: u32 = 100;
    pub const DEFAULT_MINIMUM_NUMBER_OF_CALLS: u32 = 100;
    pub const DEFAULT_WAIT_DURATION_IN_OPEN_STATE_MS: u64 = 60_000;
    pub const DEFAULT_PERMITTED_CALLS_IN_HALF_OPEN_STATE: u32 = 10;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_rate_threshold(mut self, threshold: u32) -> Self {
        self.failure_rate_threshold = threshold;
        self
    }

    pub fn with_sliding_window_size(mut self, size: u32) -> Self {
        self.sliding_window_size = size;
        self
    }

    pub fn with_minimum_number_of_calls(mut self, calls: u32) -> Self {
        self.minimum_number_of_calls = calls;
        self
    }

    pub fn with_wait_duration_in_open_state_ms(mut self, millis: u64) -> Self {
        self.wait_duration_in_open_state_ms = millis;
        self
    }

    pub fn with_permitted_calls_in_half_open_state(mut self, calls: u32) -> Self {
        self.permitted_calls_in_half_open_state = calls;
        self
    }

    pub fn normalized(self) -> Self {
        let defaults = Self::default();
        let or_default = |value: u32, default: u32| if value == 0 { default } else { value };
        Self {
            failure_rate_threshold: if (1..=100).contains(&self.failure_rate_threshold) {
                self.failure_rate_threshold
            } else {
                defaults.failure_rate_threshold
            },
            sliding_window_size: or_default(self.sliding_window_size, defaults.sliding_window_size),
            minimum_number_of_calls: or_default(
                self.minimum_number_of_calls,
                defaults.minimum_number_of_calls,
            ),
            wait_duration_in_open_state_ms: if self.wait_duration_in_open_state_ms == 0 {
                defaults.wait_duration_in_open_state_ms
            } else {
                self.wait_duration_in_open_state_ms
            },
            permitted_calls_in_half_open_state: or_default(
                self.permitted_calls_in_half_open_state,
                defaults.permitted_calls_in_half_open_state,
            ),
        }
    }

    pub fn from_env(name: &str) -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            failure_rate_threshold: env_parse(
                &key(name, "failure_rate_threshold"),
                d.failure_rate_threshold,
            )?,
            sliding_window_size: env_parse(&key(name, "sliding_window_size"), d.sliding_window_size)?,
            minimum_number_of_calls: env_parse(
                &key(name, "minimum_number_of_calls"),
                d.minimum_number_of_calls,
            )?,
            wait_duration_in_open_state_ms: env_parse(
                &key(name, "wait_duration_in_open_state_ms"),
                d.wait_duration_in_open_state_ms,
            )?,
            permitted_calls_in_half_open_state: env_parse(
                &key(name, "permitted_calls_in_half_open_state"),
                d.permitted_calls_in_half_open_state,
            )?,
        }
        .normalized())
    }
}

impl Default for CircuitBreakerSetting {
    fn default() -> Self {
        Self {
            failure_rate_threshold: Self::DEFAULT_FAILURE_RATE_THRESHOLD,
            sliding_window_size: Self::DEFAULT_SLIDING_WINDOW_SIZE,
            minimum_number_of_calls: Self::DEFAULT_MINIMUM_NUMBER_OF_CALLS,
            wait_duration_in_open_state_ms: Self::DEFAULT_WAIT_DURATION_IN_OPEN_STATE_MS,
            permitted_calls_in_half_open_state: Self::DEFAULT_PERMITTED_CALLS_IN_HALF_OPEN_STATE,
        }
    }
}

/// Message queue setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSetting {
    pub capacity: usize,
}

impl QueueSetting {
    pub const DEFAULT_CAPACITY: usize = 1000;

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Zero is kept as-is so queue construction can reject it.
    pub fn from_env(name: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            capacity: env_parse(&key(name, "capacity"), Self::DEFAULT_CAPACITY)?,
        })
    }
}

impl Default for QueueSetting {
    fn default() -> Self {
        Self {
            capacity: Self::DEFAULT_CAPACITY,
        }
    }
}

/// Pull loop setting for polling subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSetting {
    /// Pause after an empty pull
    pub poll_interval_ms: u64,
    /// Pause after a failed pull
    pub error_backoff_ms: u64,
}

impl PollSetting {
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
    pub const DEFAULT_ERROR_BACKOFF_MS: u64 = 5000;

    pub fn with_poll_interval_ms(mut self, millis: u64) -> Self {
        self.poll_interval_ms = millis;
        self
    }

    pub fn with_error_backoff_ms(mut self, millis: u64) -> Self {
        self.error_backoff_ms = millis;
        self
    }

    pub fn from_env(name: &str) -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            poll_interval_ms: env_parse(&key(name, "poll_interval_ms"), d.poll_interval_ms)?,
            error_backoff_ms: env_parse(&key(name, "error_backoff_ms"), d.error_backoff_ms)?,
        })
    }
}

impl Default for PollSetting {
    fn default() -> Self {
        Self {
            poll_interval_ms: Self::DEFAULT_POLL_INTERVAL_MS,
            error_backoff_ms: Self::DEFAULT_ERROR_BACKOFF_MS,
        }
    }
}

/// Execution policies for one named task. Absent parts are not applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSetting {
    pub thread_pool: Option<ThreadPoolSetting>,
    pub retry: Option<RetrySetting>,
    pub circuit_breaker: Option<CircuitBreakerSetting>,
}

impl TaskSetting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thread_pool(mut self, setting: ThreadPoolSetting) -> Self {
        self.thread_pool = Some(setting);
        self
    }

    pub fn with_retry(mut self, setting: RetrySetting) -> Self {
        self.retry = Some(setting);
        self
    }

    pub fn with_circuit_breaker(mut self, setting: CircuitBreakerSetting) -> Self {
        self.circuit_breaker = Some(setting);
        self
    }

    /// Load the policies of task `name`.
    ///
    /// - thread pool: enabled by `PIPELINE_<NAME>_THREAD_POOL=true`
    /// - retry: enabled when `PIPELINE_<NAME>_MAX_ATTEMPTS` is above zero
    /// - circuit breaker: enabled by `PIPELINE_<NAME>_CIRCUIT_BREAKER=true`
    pub fn from_env(name: &str) -> Result<Self, ConfigError> {
        let thread_pool = match env_parse_optional::<bool>(&key(name, "thread_pool"))? {
            Some(true) => Some(ThreadPoolSetting::from_env(name)?),
            _ => None,
        };
        let retry = Some(RetrySetting::from_env(name)?).filter(RetrySetting::is_enabled);
        let circuit_breaker = match env_parse_optional::<bool>(&key(name, "circuit_breaker"))? {
            Some(true) => Some(CircuitBreakerSetting::from_env(name)?),
            _ => None,
        };
        Ok(Self {
            thread_pool,
            retry,
            circuit_breaker,
        })
    }
}

//! Resilience policies applied around a task's processing function.
//!
//! - **Circuit Breaker**: stops invoking the processing function while the
//!   recent failure rate is too high
//! - **Retry Policy**: re-invokes the processing function on transient
//!   failures with linear or exponential backoff
//!
//! ## Circuit Breaker States
//!
//! ```text
//! ┌─────────┐  failure rate >= threshold  ┌────────┐
//! │ CLOSED  │ ──────────────────────────> │  OPEN  │
//! └─────────┘                             └────────┘
//!      ^                                       │
//!      │                                       │ wait duration elapsed
//!      │                                       v
//!      │   trial failure rate < threshold ┌─────────────┐
//!      └───────────────────────────────── │ HALF-OPEN   │
//!                                         └─────────────┘
//!                                               │ trial failure rate >= threshold
//!                                               └──────────> OPEN
//! ```
//!
//! The failure rate is computed over a count-based sliding window of the
//! most recent calls and only once `minimum_number_of_calls` have been
//! recorded.
//!
//! ## Example
//!
//! ```rust,ignore
//! use message_pipeline::{CircuitBreaker, CircuitBreakerSetting};
//!
//! let breaker = CircuitBreaker::new("payments", CircuitBreakerSetting::default());
//!
//! if breaker.try_acquire() {
//!     match charge().await {
//!         Ok(_) => breaker.record_success(),
//!         Err(_) => breaker.record_failure(),
//!     }
//! } else {
//!     // Circuit is open, fail fast
//! }
//! ```

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use strum::{AsRefStr, Display};
use tracing::{info, warn};

use crate::config::{BackoffPolicy, CircuitBreakerSetting, RetrySetting};
use crate::error::TaskError;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected immediately.
    Open,
    /// A limited number of trial calls test whether the dependency recovered.
    HalfOpen,
}

struct BreakerState {
    state: CircuitState,
    /// Outcomes of the most recent closed-state calls, `true` for failure.
    window: VecDeque<bool>,
    window_failures: u32,
    opened_at: Option<Instant>,
    trial_permits: u32,
    trial_successes: u32,
    trial_failures: u32,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            window: VecDeque::new(),
            window_failures: 0,
            opened_at: None,
            trial_permits: 0,
            trial_successes: 0,
            trial_failures: 0,
        }
    }

    fn reset_trials(&mut self) {
        self.trial_permits = 0;
        self.trial_successes = 0;
        self.trial_failures = 0;
    }
}

/// Thread-safe failure-rate circuit breaker shared by every invocation of a task.
pub struct CircuitBreaker {
    name: String,
    setting: CircuitBreakerSetting,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, setting: CircuitBreakerSetting) -> Self {
        let setting = setting.normalized();
        let mut state = BreakerState::closed();
        state.window.reserve(setting.sliding_window_size as usize);
        Self {
            name: name.into(),
            setting,
            inner: Mutex::new(state),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn setting(&self) -> &CircuitBreakerSetting {
        &self.setting
    }

    /// Get the current state of the circuit breaker.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Ask for permission to invoke the protected function.
    ///
    /// Moves an open circuit to half-open once the wait duration has elapsed.
    /// While half-open only `permitted_calls_in_half_open_state` permits are
    /// handed out until the trial outcomes decide the next state.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.lock();

        if inner.state == CircuitState::Open {
            let waited = inner
                .opened_at
                .map(|at| at.elapsed() >= self.wait_duration())
                .unwrap_or(true);
            if !waited {
                return false;
            }
            self.transition(&mut inner, CircuitState::HalfOpen);
        }

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                if inner.trial_permits < self.setting.permitted_calls_in_half_open_state {
                    inner.trial_permits += 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::Open => false,
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        self.record(false);
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        self.record(true);
    }

    /// Failure rate (0-100) of the sliding window, `None` until enough calls
    /// were recorded to evaluate it.
    pub fn failure_rate(&self) -> Option<f32> {
        let inner = self.lock();
        self.window_failure_rate(&inner)
    }

    /// Give back a permit from [`try_acquire`](Self::try_acquire) whose call
    /// was abandoned before an outcome could be recorded.
    pub fn release(&self) {
        let mut inner = self.lock();
        let completed = inner.trial_successes + inner.trial_failures;
        if inner.state == CircuitState::HalfOpen && inner.trial_permits > completed {
            inner.trial_permits -= 1;
        }
    }

    /// Reset the circuit breaker to closed state and forget recorded calls.
    pub fn reset(&self) {
        let mut inner = self.lock();
        self.transition(&mut inner, CircuitState::Closed);
    }

    fn record(&self, is_failure: bool) {
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.window.push_back(is_failure);
                if is_failure {
                    inner.window_failures += 1;
                }
                if inner.window.len() > self.setting.sliding_window_size as usize
                    && inner.window.pop_front() == Some(true)
                {
                    inner.window_failures -= 1;
                }

                if let Some(rate) = self.window_failure_rate(&inner) {
                    if rate >= self.setting.failure_rate_threshold as f32 {
                        warn!(
                            circuit_breaker = %self.name,
                            failure_rate = rate,
                            threshold = self.setting.failure_rate_threshold,
                            "Failure rate exceeded threshold"
                        );
                        self.transition(&mut inner, CircuitState::Open);
                    }
                }
            }
            CircuitState::HalfOpen => {
                if is_failure {
                    inner.trial_failures += 1;
                } else {
                    inner.trial_successes += 1;
                }

                let completed = inner.trial_successes + inner.trial_failures;
                if completed >= self.setting.permitted_calls_in_half_open_state {
                    let rate = inner.trial_failures as f32 * 100.0 / completed as f32;
                    if rate >= self.setting.failure_rate_threshold as f32 {
                        self.transition(&mut inner, CircuitState::Open);
                    } else {
                        self.transition(&mut inner, CircuitState::Closed);
                    }
                }
            }
            // Outcome of a call that started before the circuit opened
            CircuitState::Open => {}
        }
    }

    fn window_failure_rate(&self, inner: &BreakerState) -> Option<f32> {
        let required = self
            .setting
            .minimum_number_of_calls
            .min(self.setting.sliding_window_size) as usize;
        let total = inner.window.len();
        if total == 0 || total < required {
            return None;
        }
        Some(inner.window_failures as f32 * 100.0 / total as f32)
    }

    fn wait_duration(&self) -> Duration {
        Duration::from_millis(self.setting.wait_duration_in_open_state_ms)
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        match to {
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
                inner.reset_trials();
                warn!(circuit_breaker = %self.name, "Circuit breaker OPENED");
            }
            CircuitState::HalfOpen => {
                inner.reset_trials();
                info!(circuit_breaker = %self.name, "Circuit breaker HALF-OPEN (testing recovery)");
            }
            CircuitState::Closed => {
                let was = inner.state;
                *inner = BreakerState::closed();
                if was != CircuitState::Closed {
                    info!(circuit_breaker = %self.name, "Circuit breaker CLOSED (recovered)");
                }
                return;
            }
        }
        inner.state = to;
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Upper bound for a single backoff delay
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Bounded retry with linear or exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    initial_backoff: Duration,
    backoff_policy: BackoffPolicy,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff: Duration, backoff_policy: BackoffPolicy) -> Self {
        Self {
            max_retries,
            initial_backoff,
            backoff_policy,
        }
    }

    /// Build a policy from its setting, `None` when retry is disabled.
    pub fn from_setting(setting: &RetrySetting) -> Option<Self> {
        let setting = setting.normalized();
        setting.is_enabled().then(|| {
            Self::new(
                setting.max_attempts,
                Duration::from_millis(setting.initial_backoff_ms),
                setting.backoff_policy,
            )
        })
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether a failure observed after `retries_done` retries is retried again.
    pub fn should_retry(&self, error: &TaskError, retries_done: u32) -> bool {
        retries_done < self.max_retries && error.should_retry()
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        let delay = match self.backoff_policy {
            BackoffPolicy::Linear => self.initial_backoff.saturating_mul(retry),
            BackoffPolicy::Exponential => {
                let factor = 2u32.checked_pow(retry - 1).unwrap_or(u32::MAX);
                self.initial_backoff.saturating_mul(factor)
            }
        };
        delay.min(MAX_BACKOFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(setting: CircuitBreakerSetting) -> CircuitBreaker {
        CircuitBreaker::new("test", setting)
    }

    fn small_setting() -> CircuitBreakerSetting {
        CircuitBreakerSetting::new()
            .with_failure_rate_threshold(50)
            .with_sliding_window_size(4)
            .with_minimum_number_of_calls(4)
            .with_wait_duration_in_open_state_ms(50)
            .with_permitted_calls_in_half_open_state(2)
    }

    #[test]
    fn test_circuit_breaker_initial_state() {
        let breaker = breaker(CircuitBreakerSetting::default());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire());
        assert_eq!(breaker.failure_rate(), None);
    }

    #[test]
    fn test_circuit_breaker_waits_for_minimum_calls() {
        let breaker = breaker(small_setting());

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_rate(), None);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn test_circuit_breaker_stays_closed_below_threshold() {
        let breaker = breaker(small_setting());

        breaker.record_failure();
        breaker.record_success();
        breaker.record_success();
        breaker.record_success();
        assert_eq!(breaker.failure_rate(), Some(25.0));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_sliding_window_forgets_old_calls() {
        let breaker = breaker(small_setting().with_failure_rate_threshold(75));

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_success();
        assert_eq!(breaker.failure_rate(), Some(50.0));

        breaker.record_success();
        breaker.record_success();
        assert_eq!(breaker.failure_rate(), Some(0.0));
    }

    #[test]
    fn test_circuit_breaker_half_open_after_wait() {
        let breaker = breaker(small_setting());
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert!(!breaker.try_acquire());

        std::thread::sleep(Duration::from_millis(80));

        assert!(breaker.try_acquire());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire());
        // Only two trial calls are permitted
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn test_circuit_breaker_closes_after_successful_trials() {
        let breaker = breaker(small_setting());
        for _ in 0..4 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(80));

        assert!(breaker.try_acquire());
        assert!(breaker.try_acquire());
        breaker.record_success();
        breaker.record_success();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_rate(), None);
    }

    #[test]
    fn test_circuit_breaker_reopens_on_failed_trials() {
        let breaker = breaker(small_setting());
        for _ in 0..4 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(80));

        assert!(breaker.try_acquire());
        assert!(breaker.try_acquire());
        breaker.record_failure();
        breaker.record_success();

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn test_release_returns_trial_permit() {
        let breaker = breaker(small_setting());
        for _ in 0..4 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(80));

        assert!(breaker.try_acquire());
        assert!(breaker.try_acquire());
        assert!(!breaker.try_acquire());

        breaker.release();
        assert!(breaker.try_acquire());
    }

    #[test]
    fn test_circuit_breaker_reset() {
        let breaker = breaker(small_setting());
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire());
    }

    #[test]
    fn test_retry_policy_from_setting() {
        assert!(RetryPolicy::from_setting(&RetrySetting::default()).is_none());

        let policy = RetryPolicy::from_setting(&RetrySetting::new().with_max_attempts(2)).unwrap();
        assert_eq!(policy.max_retries(), 2);
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(100));
    }

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), BackoffPolicy::Linear);
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(300));
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = RetryPolicy::new(50, Duration::from_millis(100), BackoffPolicy::Exponential);
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for_retry(40), MAX_BACKOFF);
    }

    #[test]
    fn test_should_retry_respects_budget_and_category() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1), BackoffPolicy::Linear);
        let transient = TaskError::transient("timeout");

        assert!(policy.should_retry(&transient, 0));
        assert!(policy.should_retry(&transient, 1));
        assert!(!policy.should_retry(&transient, 2));
        assert!(!policy.should_retry(&TaskError::permanent("invalid"), 0));
    }
}

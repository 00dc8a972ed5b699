//! Shared test utilities for pipeline testing
//!
//! This crate provides in-memory stand-ins for the broker side of a
//! pipeline:
//! - `TestAck`: acknowledgment handle that succeeds, fails or panics
//! - `VecFlow` / `VecBatchFlow`: finite subscriber flows
//! - `ScriptedPuller`: pull source answering from a script
//! - `RecordingMetrics`: metrics sink with label-filtered queries
//! - `TestDataBuilder`: deterministic trace headers
//! - `assertions`: batch accounting checks
//!
//! # Usage
//!
//! ```rust,ignore
//! use test_utils::{TestAck, VecFlow, RecordingMetrics, records};
//!
//! #[tokio::test]
//! async fn my_pipeline_test() {
//!     let ack = TestAck::succeeding();
//!     let flow = Arc::new(VecFlow::new("orders", records(0..5, &ack)));
//!     let metrics = Arc::new(RecordingMetrics::new());
//!
//!     let processor = Processor::new(MessagingType::InMemory, flow, task)
//!         .with_metrics(metrics.clone());
//! }
//! ```

mod ack;
mod flows;
mod metrics;

pub use ack::{AckMode, TestAck, record, records};
pub use flows::{ScriptedPuller, VecBatchFlow, VecFlow};
pub use metrics::RecordingMetrics;

use core_config::Environment;

/// Install the development tracing subscriber for a test binary.
///
/// Honours `RUST_LOG`; calling it from several tests is fine.
pub fn init_test_tracing() {
    core_config::tracing::init_tracing(&Environment::Development);
}

/// Builder for test data with deterministic randomization
///
/// This ensures tests are reproducible by deriving ids from a seed.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    /// Create a new builder with a seed (for deterministic tests)
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_batch_accounting");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Sampled `traceparent` header value unique to this builder and `index`
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let header = TestDataBuilder::new(7).traceparent(1);
    /// assert!(header.starts_with("00-"));
    /// assert!(header.ends_with("-01"));
    /// ```
    pub fn traceparent(&self, index: u64) -> String {
        let trace_id = format!("{:016x}{:016x}", self.seed, index.wrapping_add(1));
        let span_id = format!("{:016x}", (self.seed ^ index) | 1);
        format!("00-{trace_id}-{span_id}-01")
    }
}

/// Test assertion helpers
pub mod assertions {
    use message_pipeline::BatchProcessResult;

    /// Assert that a batch result accounts for every pulled record
    pub fn assert_accounted<T>(result: &BatchProcessResult<T>, batch_size: usize) {
        assert_eq!(
            result.acknowledged + result.unacknowledged + result.failed,
            batch_size,
            "acknowledged ({}) + unacknowledged ({}) + failed ({}) must equal batch size {}",
            result.acknowledged,
            result.unacknowledged,
            result.failed,
            batch_size
        );
        assert_eq!(
            result.acknowledged + result.unacknowledged,
            result.data.len(),
            "acknowledged + unacknowledged must equal the returned records"
        );
    }
}

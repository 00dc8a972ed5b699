//! Trace context propagation from broker records to processing spans.
//!
//! Producers put a W3C `traceparent` header on each message. The processor
//! asks its [`TracePropagator`] for the context of every record (or the last
//! record of a batch), opens a consumer span parented to it, and runs the
//! task and acknowledgment inside that span. The span is closed when that
//! work finishes, fails or is dropped.
//!
//! With the `opentelemetry` feature the consumer span is parented to the
//! remote context through `tracing-opentelemetry`. Without it the parsed ids
//! are only recorded as span fields.

use tracing::{Span, field, info_span};

use crate::registry::MessagingType;

/// Header carrying the W3C trace context
pub const TRACEPARENT_HEADER: &str = "traceparent";

/// Header carrying vendor-specific trace state
pub const TRACESTATE_HEADER: &str = "tracestate";

/// Anything that exposes message headers
pub trait TraceCarrier {
    fn header(&self, key: &str) -> Option<&str>;
}

/// Parsed W3C trace context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub parent_span_id: String,
    pub sampled: bool,
}

impl TraceContext {
    /// Parse a `traceparent` header value
    /// (`00-<32 hex trace id>-<16 hex span id>-<2 hex flags>`).
    ///
    /// Returns `None` for malformed values and all-zero ids.
    pub fn parse(traceparent: &str) -> Option<Self> {
        let mut parts = traceparent.trim().split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let flags = parts.next()?;

        if version != "00" || parts.next().is_some() {
            return None;
        }
        if !is_hex_id(trace_id, 32) || !is_hex_id(span_id, 16) || !is_hex_id(flags, 2) {
            return None;
        }
        let flags = u8::from_str_radix(flags, 16).ok()?;
        if is_zero(trace_id) || is_zero(span_id) {
            return None;
        }

        Some(Self {
            trace_id: trace_id.to_ascii_lowercase(),
            parent_span_id: span_id.to_ascii_lowercase(),
            sampled: flags & 0x01 == 0x01,
        })
    }

    pub fn to_traceparent(&self) -> String {
        format!(
            "00-{}-{}-{:02x}",
            self.trace_id,
            self.parent_span_id,
            u8::from(self.sampled)
        )
    }
}

fn is_hex_id(value: &str, len: usize) -> bool {
    value.len() == len && value.chars().all(|c| c.is_ascii_hexdigit())
}

fn is_zero(value: &str) -> bool {
    value.chars().all(|c| c == '0')
}

/// Extracts trace context from records and opens the processing span.
pub trait TracePropagator<T>: Send + Sync {
    fn extract(&self, record: &T) -> Option<TraceContext>;

    /// Open the consumer span for `record`.
    fn start_span(&self, record: &T, subscription: &str, messaging_type: MessagingType) -> Span {
        consumer_span(self.extract(record).as_ref(), subscription, messaging_type)
    }
}

/// [`TracePropagator`] reading the `traceparent` header
#[derive(Debug, Clone, Copy, Default)]
pub struct W3cPropagator;

impl<T: TraceCarrier> TracePropagator<T> for W3cPropagator {
    fn extract(&self, record: &T) -> Option<TraceContext> {
        record
            .header(TRACEPARENT_HEADER)
            .and_then(TraceContext::parse)
    }

    #[cfg(feature = "opentelemetry")]
    fn start_span(&self, record: &T, subscription: &str, messaging_type: MessagingType) -> Span {
        use tracing_opentelemetry::OpenTelemetrySpanExt;

        let span = consumer_span(self.extract(record).as_ref(), subscription, messaging_type);
        span.set_parent(remote_context(record));
        span
    }
}

/// OpenTelemetry context of the producer, read from the record headers
#[cfg(feature = "opentelemetry")]
pub fn remote_context<T: TraceCarrier>(record: &T) -> opentelemetry::Context {
    use opentelemetry::propagation::TextMapPropagator;
    use opentelemetry_sdk::propagation::TraceContextPropagator;

    TraceContextPropagator::new().extract(&CarrierExtractor(record))
}

/// Adapts a [`TraceCarrier`] to the OpenTelemetry extractor interface
#[cfg(feature = "opentelemetry")]
struct CarrierExtractor<'a, T>(&'a T);

#[cfg(feature = "opentelemetry")]
impl<T: TraceCarrier> opentelemetry::propagation::Extractor for CarrierExtractor<'_, T> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.header(key)
    }

    fn keys(&self) -> Vec<&str> {
        [TRACEPARENT_HEADER, TRACESTATE_HEADER]
            .into_iter()
            .filter(|key| self.0.header(key).is_some())
            .collect()
    }
}

/// Consumer span for one record or batch, linked to the producer's trace
/// when a context was extracted.
pub fn consumer_span(
    context: Option<&TraceContext>,
    subscription: &str,
    messaging_type: MessagingType,
) -> Span {
    let span = info_span!(
        "consume",
        otel.kind = "consumer",
        messaging.system = %messaging_type,
        messaging.destination = %subscription,
        trace_id = field::Empty,
        parent_span_id = field::Empty,
    );
    if let Some(context) = context {
        span.record("trace_id", context.trace_id.as_str());
        span.record("parent_span_id", context.parent_span_id.as_str());
    }
    span
}

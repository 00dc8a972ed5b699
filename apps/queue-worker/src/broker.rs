//! In-memory stand-in for a push broker.
//!
//! A listener thread publishes order events into a [`QueueSubscriber`],
//! blocking whenever the queue is full, until the queue is stopped.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use message_pipeline::{
    AckError, Acknowledgment, QueueStatus, QueueSubscriber, SubscriberRecord, TRACEPARENT_HEADER,
};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::orders::{OrderEvent, OrderRecord};

/// Every n-th published order carries an invalid amount
const INVALID_EVERY: u64 = 10;

/// Acknowledgment that only logs, standing in for a broker ack call.
#[derive(Debug)]
pub struct LoggingAck {
    message_id: String,
}

#[async_trait]
impl Acknowledgment for LoggingAck {
    async fn acknowledge(&self) -> Result<(), AckError> {
        debug!(message_id = %self.message_id, "Message acknowledged");
        Ok(())
    }
}

/// Random sampled `traceparent`, as an upstream producer would attach it.
fn new_traceparent() -> String {
    let trace_id = Uuid::new_v4().simple().to_string();
    let span_id = &Uuid::new_v4().simple().to_string()[..16];
    format!("00-{trace_id}-{span_id}-01")
}

fn order_record(sequence: u64) -> Result<OrderRecord, serde_json::Error> {
    let amount_cents = if sequence % INVALID_EVERY == 0 {
        -1
    } else {
        (sequence as i64 % 97 + 1) * 100
    };
    let event = OrderEvent {
        order_id: Uuid::now_v7(),
        customer: format!("customer-{}", sequence % 7),
        amount_cents,
    };
    let message_id = Uuid::now_v7().to_string();
    let payload = serde_json::to_string(&event)?;
    let ack = Arc::new(LoggingAck {
        message_id: message_id.clone(),
    });
    Ok(SubscriberRecord::new(payload, ack)
        .with_id(message_id)
        .with_header(TRACEPARENT_HEADER, new_traceparent()))
}

/// Start the listener thread. It returns the number of published records.
pub fn spawn_publisher(
    subscriber: Arc<QueueSubscriber<OrderRecord>>,
    interval: Duration,
) -> std::io::Result<JoinHandle<u64>> {
    std::thread::Builder::new()
        .name("broker-listener".to_string())
        .spawn(move || {
            let mut published = 0;
            while !subscriber.queue().is_stopped() {
                match order_record(published + 1) {
                    Ok(record) => {
                        subscriber.push(record);
                        published += 1;
                    }
                    Err(e) => error!(error = %e, "Failed to encode order event"),
                }
                std::thread::sleep(interval);
            }
            info!(published, "Broker listener finished");
            published
        })
}

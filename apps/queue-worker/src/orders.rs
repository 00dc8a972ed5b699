//! Order events and the task that validates them.

use message_pipeline::{SubscriberRecord, TaskError, TaskResult};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

pub type OrderRecord = SubscriberRecord<String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderEvent {
    pub order_id: Uuid,
    pub customer: String,
    pub amount_cents: i64,
}

/// Validate one delivered order.
///
/// Undecodable payloads and non-positive amounts fail permanently; the record
/// is left unacknowledged for the broker to redeliver or dead-letter.
pub fn handle_order(record: OrderRecord) -> TaskResult<OrderRecord> {
    let event: OrderEvent = serde_json::from_str(&record.data)
        .map_err(|e| TaskError::permanent(format!("undecodable order event: {e}")))?;

    if event.amount_cents <= 0 {
        warn!(order_id = %event.order_id, amount_cents = event.amount_cents, "Rejecting order");
        return Err(TaskError::permanent(format!(
            "order {} has non-positive amount {}",
            event.order_id, event.amount_cents
        )));
    }

    info!(
        order_id = %event.order_id,
        customer = %event.customer,
        amount_cents = event.amount_cents,
        message_id = %record.id,
        "Order accepted"
    );
    Ok(Some(record))
}

//! Realtime notifications for connected clients.
//!
//! The engine publishes; it never manages room membership. Clients join the room for their user, `user_{id}`, and
//! receive every event published to it. Delivery is best-effort: a publish to a room with nobody in it is simply
//! dropped.
use std::fmt::Display;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::db_types::Payment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RealtimeEvent {
    PaymentSettled,
    InvoiceSettled,
    InvoicePaid,
    InvoiceFailed,
}

impl RealtimeEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            RealtimeEvent::PaymentSettled => "payment_settled",
            RealtimeEvent::InvoiceSettled => "invoice_settled",
            RealtimeEvent::InvoicePaid => "invoice_paid",
            RealtimeEvent::InvoiceFailed => "invoice_failed",
        }
    }
}

impl Display for RealtimeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait RealtimeNotifier: Send + Sync {
    /// Publish an event to everyone in `room`. This must not block, and must not fail.
    fn publish(&self, room: &str, event: RealtimeEvent, payload: Value);
}

/// The room name for a user.
pub fn user_room(user_id: i64) -> String {
    format!("user_{user_id}")
}

/// The payload that accompanies every payment-related event.
pub fn payment_payload(payment: &Payment) -> Value {
    json!({
        "payment_id": payment.id,
        "payment_hash": payment.payment_hash,
        "order_id": payment.order_id,
        "status": payment.status,
        "amount_sats": payment.amount_sats,
    })
}

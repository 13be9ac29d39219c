use bitmarket_engine::db_types::PaymentReference;
use serde::{Deserialize, Serialize};

/// The body of `POST /api/invoice`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceRequest {
    pub amount_sats: i64,
    #[serde(default)]
    pub memo: Option<String>,
    #[serde(default)]
    pub order_id: Option<i64>,
    #[serde(default)]
    pub user_id: Option<i64>,
}

impl InvoiceRequest {
    pub fn reference(&self) -> PaymentReference {
        PaymentReference { order_id: self.order_id, user_id: self.user_id }
    }
}

/// The body of `POST /api/invoice/pay`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayInvoiceRequest {
    pub payment_request: String,
    #[serde(default)]
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayInvoiceResponse {
    pub payment_hash: String,
    pub payment_preimage: String,
    pub status: String,
}

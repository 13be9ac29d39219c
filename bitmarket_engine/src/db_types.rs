use std::{fmt::Display, str::FromStr};

pub use bitmarket_common::Sats;
use chrono::{DateTime, Utc};
use log::error;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[error("Invalid conversion: {0}")]
pub struct ConversionError(String);

//--------------------------------------    PaymentStatus     ---------------------------------------------------------
/// The lifecycle of an invoice payment. Transitions only ever leave `Pending`; the other three states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Type, Serialize, Deserialize)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    /// The invoice has been issued and is waiting to be paid
    Pending,
    /// The node has reported the invoice as paid, and the wallet has been credited
    Settled,
    /// The node cancelled the invoice
    Failed,
    /// The invoice was not paid in time
    Expired,
}

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }

    /// The only legal transitions are from `Pending` to one of the terminal states.
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        matches!(self, PaymentStatus::Pending) && next.is_terminal()
    }
}

impl Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentStatus::Pending => write!(f, "pending"),
            PaymentStatus::Settled => write!(f, "settled"),
            PaymentStatus::Failed => write!(f, "failed"),
            PaymentStatus::Expired => write!(f, "expired"),
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "settled" => Ok(Self::Settled),
            "failed" => Ok(Self::Failed),
            "expired" => Ok(Self::Expired),
            s => Err(ConversionError(format!("Invalid payment status: {s}"))),
        }
    }
}

//--------------------------------------        Payment       ---------------------------------------------------------
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct Payment {
    pub id: i64,
    /// The order this invoice was issued for, if any
    pub order_id: Option<i64>,
    /// The user whose wallet is credited on settlement. If absent, the order's buyer is used.
    pub user_id: Option<i64>,
    /// The BOLT11 payment request handed to the payer
    pub invoice: String,
    /// Hex-encoded payment hash. Globally unique.
    pub payment_hash: String,
    /// Hex-encoded preimage. Only known once the invoice has been paid.
    pub payment_preimage: Option<String>,
    pub provider: String,
    pub memo: Option<String>,
    pub amount_sats: Sats,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

/// The explicit owner references captured when an invoice is issued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReference {
    pub order_id: Option<i64>,
    pub user_id: Option<i64>,
}

impl PaymentReference {
    pub fn for_order(order_id: i64) -> Self {
        Self { order_id: Some(order_id), user_id: None }
    }

    pub fn for_user(user_id: i64) -> Self {
        Self { order_id: None, user_id: Some(user_id) }
    }

    pub fn with_user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.order_id.is_none() && self.user_id.is_none()
    }
}

impl Display for PaymentReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.order_id, self.user_id) {
            (Some(order), _) => write!(f, "order {order}"),
            (None, Some(user)) => write!(f, "user {user}"),
            (None, None) => write!(f, "unreferenced"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub reference: PaymentReference,
    pub invoice: String,
    pub payment_hash: String,
    pub provider: String,
    pub memo: Option<String>,
    pub amount_sats: Sats,
}

impl NewPayment {
    pub fn new(invoice: String, payment_hash: String, amount_sats: Sats, reference: PaymentReference) -> Self {
        Self { reference, invoice, payment_hash, provider: "lnd".to_string(), memo: None, amount_sats }
    }

    pub fn with_memo<S: Into<String>>(mut self, memo: S) -> Self {
        self.memo = Some(memo.into());
        self
    }

    pub fn with_provider<S: Into<String>>(mut self, provider: S) -> Self {
        self.provider = provider.into();
        self
    }
}

//--------------------------------------   TransactionEvent   ---------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Type, Serialize, Deserialize)]
#[sqlx(rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum TransactionEvent {
    InvoiceGenerated,
    PaymentSettled,
    PaymentFailed,
    PaymentExpired,
}

impl Display for TransactionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionEvent::InvoiceGenerated => write!(f, "invoice-generated"),
            TransactionEvent::PaymentSettled => write!(f, "payment-settled"),
            TransactionEvent::PaymentFailed => write!(f, "payment-failed"),
            TransactionEvent::PaymentExpired => write!(f, "payment-expired"),
        }
    }
}

impl From<PaymentStatus> for TransactionEvent {
    fn from(status: PaymentStatus) -> Self {
        match status {
            PaymentStatus::Pending => TransactionEvent::InvoiceGenerated,
            PaymentStatus::Settled => TransactionEvent::PaymentSettled,
            PaymentStatus::Failed => TransactionEvent::PaymentFailed,
            PaymentStatus::Expired => TransactionEvent::PaymentExpired,
        }
    }
}

//--------------------------------------      Transaction     ---------------------------------------------------------
/// An append-only audit log entry for a payment. Ordering by `created_at`, then `id`, recovers the payment history.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub payment_id: i64,
    pub event_type: TransactionEvent,
    /// JSON-encoded context for the event
    pub metadata: Option<String>,
    pub created_at: DateTime<Utc>,
}

//--------------------------------------         Wallet       ---------------------------------------------------------
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct Wallet {
    pub id: i64,
    pub user_id: i64,
    pub balance_sats: Sats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

//--------------------------------------   OrderStatusType     ---------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Type, Serialize, Deserialize)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OrderStatusType {
    /// The order has been placed, and is waiting for payment
    Pending,
    /// Payment for the order has settled and checkout is complete
    Paid,
    /// The order was cancelled by the buyer or an admin
    Cancelled,
}

impl Display for OrderStatusType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderStatusType::Pending => write!(f, "pending"),
            OrderStatusType::Paid => write!(f, "paid"),
            OrderStatusType::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl From<String> for OrderStatusType {
    fn from(value: String) -> Self {
        value.parse().unwrap_or_else(|_| {
            error!("Invalid order status: {value}. But this conversion cannot fail. Defaulting to Pending");
            OrderStatusType::Pending
        })
    }
}

impl FromStr for OrderStatusType {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "paid" => Ok(Self::Paid),
            "cancelled" => Ok(Self::Cancelled),
            s => Err(ConversionError(format!("Invalid order status: {s}"))),
        }
    }
}

//--------------------------------------         Order        ---------------------------------------------------------
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub buyer_id: i64,
    pub status: OrderStatusType,
    pub total_sats: Sats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct ProductOrder {
    pub id: i64,
    pub order_id: i64,
    pub product_id: i64,
    pub quantity: i64,
    pub price_sats: Sats,
    pub status: OrderStatusType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProductOrder {
    pub product_id: i64,
    pub quantity: i64,
    pub price_sats: Sats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrder {
    pub buyer_id: i64,
    pub lines: Vec<NewProductOrder>,
}

impl NewOrder {
    pub fn new(buyer_id: i64) -> Self {
        Self { buyer_id, lines: vec![] }
    }

    pub fn with_line(mut self, product_id: i64, quantity: i64, price_sats: Sats) -> Self {
        self.lines.push(NewProductOrder { product_id, quantity, price_sats });
        self
    }

    /// The order total. Line totals are whole satoshis, so this is exact. Returns `None` if the total does not fit in
    /// an `i64`.
    pub fn total(&self) -> Option<Sats> {
        self.lines
            .iter()
            .try_fold(Sats::default(), |total, l| l.price_sats.checked_mul(l.quantity).and_then(|t| total.checked_add(t)))
    }
}

//--------------------------------------        CartItem      ---------------------------------------------------------
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct CartItem {
    pub id: i64,
    pub user_id: i64,
    pub product_id: i64,
    pub quantity: i64,
    pub created_at: DateTime<Utc>,
}

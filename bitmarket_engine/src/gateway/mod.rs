//! # Lightning gateway
//!
//! The payment engine never talks to a Lightning node directly. Instead, it is handed an implementation of
//! [`LightningGateway`] when it is constructed. The server provides one backed by the LND REST interface; tests use
//! [`crate::test_utils::MockGateway`].
//!
//! Gateways deal in hex-encoded payment hashes and preimages, and in whole satoshis.
use std::{fmt::Display, future::Future, time::Duration};

use bitmarket_common::Sats;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The stream of invoice updates from a settlement subscription. The stream ends when the subscription is dropped by
/// the node.
pub type SettlementStream = BoxStream<'static, Result<InvoiceUpdate, GatewayError>>;

pub trait LightningGateway: Clone + Send + Sync + 'static {
    /// The provider name that is recorded against payments created through this gateway.
    fn provider_name(&self) -> &str;

    /// Asks the node to mint a new invoice for `amount` with the given memo.
    fn create_invoice(
        &self,
        amount: Sats,
        memo: &str,
    ) -> impl Future<Output = Result<CreatedInvoice, GatewayError>> + Send;

    /// Decodes a BOLT11 payment request without paying it. Requests the node cannot make sense of are `Rejected`.
    fn decode_payment_request(
        &self,
        payment_request: &str,
    ) -> impl Future<Output = Result<DecodedPaymentRequest, GatewayError>> + Send;

    /// Pays a BOLT11 payment request from the node's own funds.
    fn pay_invoice(&self, payment_request: &str) -> impl Future<Output = Result<PaidInvoice, GatewayError>> + Send;

    /// The node's current view of one of its own invoices.
    fn lookup_invoice(&self, payment_hash: &str) -> impl Future<Output = Result<InvoiceUpdate, GatewayError>> + Send;

    /// Opens a long-lived subscription to invoice state changes.
    ///
    /// Every invoice the node settled after `settle_index` is replayed first, oldest first, followed by live updates.
    /// Pass zero to receive live updates only.
    fn subscribe_settlements(
        &self,
        settle_index: u64,
    ) -> impl Future<Output = Result<SettlementStream, GatewayError>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedInvoice {
    pub payment_request: String,
    pub payment_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedPaymentRequest {
    pub payment_hash: String,
    /// Zero for requests that leave the amount up to the payer.
    pub amount: Sats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaidInvoice {
    pub payment_hash: String,
    pub payment_preimage: String,
    /// The amount delivered to the payee, excluding routing fees.
    pub amount: Sats,
    pub fee: Sats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InvoiceState {
    Open,
    Settled,
    Canceled,
    Accepted,
}

impl Display for InvoiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvoiceState::Open => write!(f, "OPEN"),
            InvoiceState::Settled => write!(f, "SETTLED"),
            InvoiceState::Canceled => write!(f, "CANCELED"),
            InvoiceState::Accepted => write!(f, "ACCEPTED"),
        }
    }
}

/// A single element of the settlement subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceUpdate {
    pub payment_hash: String,
    pub preimage: Option<String>,
    pub settled: bool,
    pub amount_paid: Sats,
    pub memo: Option<String>,
    pub state: InvoiceState,
    /// The node's sequence number for settled invoices, starting at 1. Zero for invoices that are not settled.
    #[serde(default)]
    pub settle_index: u64,
}

impl InvoiceUpdate {
    pub fn is_settled(&self) -> bool {
        self.settled || self.state == InvoiceState::Settled
    }

    pub fn is_canceled(&self) -> bool {
        self.state == InvoiceState::Canceled
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("The Lightning node is unavailable. {0}")]
    Unavailable(String),
    #[error("The Lightning node did not respond within {0:?}")]
    Timeout(Duration),
    #[error("The Lightning node rejected the request. {0}")]
    Rejected(String),
    #[error("The settlement subscription was disconnected. {0}")]
    StreamDisconnected(String),
    #[error("Could not decode the response from the Lightning node. {0}")]
    Decode(String),
}

impl GatewayError {
    /// Transient errors are worth retrying. A rejection or an undecodable response will not go away by itself.
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Unavailable(_) | GatewayError::Timeout(_) | GatewayError::StreamDisconnected(_))
    }
}

use bitmarket_common::Sats;
use thiserror::Error;

use crate::{db::traits::LedgerError, gateway::GatewayError};

#[derive(Debug, Clone, Error)]
pub enum InvoiceApiError {
    #[error("Invoice amounts must be a positive number of sats, not {0}")]
    InvalidAmount(i64),
    #[error("An invoice must reference an order, a user, or both")]
    MissingReference,
    #[error("Invalid payment request. {0}")]
    InvalidPaymentRequest(String),
    #[error("The order {0} does not exist")]
    OrderNotFound(i64),
    #[error("The Lightning node is unavailable. {0}")]
    GatewayUnavailable(String),
    #[error("The Lightning node did not respond in time")]
    GatewayTimeout,
    #[error("The Lightning node refused the request. {0}")]
    GatewayRejected(String),
    #[error("The invoice {hash} for {amount} could not be recorded. {reason}")]
    PersistenceFailed { hash: String, amount: Sats, reason: String },
    #[error("Database error: {0}")]
    DatabaseError(String),
}

impl From<GatewayError> for InvoiceApiError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Timeout(_) => InvoiceApiError::GatewayTimeout,
            GatewayError::Unavailable(s) | GatewayError::StreamDisconnected(s) => InvoiceApiError::GatewayUnavailable(s),
            GatewayError::Rejected(s) => InvoiceApiError::GatewayRejected(s),
            GatewayError::Decode(s) => InvoiceApiError::GatewayUnavailable(format!("Invalid response: {s}")),
        }
    }
}

impl From<LedgerError> for InvoiceApiError {
    fn from(e: LedgerError) -> Self {
        InvoiceApiError::DatabaseError(e.to_string())
    }
}

#[derive(Debug, Clone, Error)]
pub enum SettlementError {
    #[error("Cannot determine whose wallet to credit for payment {0}")]
    OwnerUnresolved(String),
    #[error("Crediting wallet for user {0} would overflow the balance")]
    BalanceOverflow(i64),
    #[error("Database error: {0}")]
    DatabaseError(String),
}

impl SettlementError {
    /// Database failures may clear up by themselves, so the same settlement is worth trying again. The other errors
    /// will fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SettlementError::DatabaseError(_))
    }
}

impl From<LedgerError> for SettlementError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::OwnerUnresolved(hash) => SettlementError::OwnerUnresolved(hash),
            LedgerError::BalanceOverflow(user_id) => SettlementError::BalanceOverflow(user_id),
            e => SettlementError::DatabaseError(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum CheckoutError {
    #[error("The order {0} does not exist")]
    OrderNotFound(i64),
    #[error("Invalid order. {0}")]
    InvalidOrder(String),
    #[error("Database error: {0}")]
    DatabaseError(String),
}

impl From<LedgerError> for CheckoutError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::OrderNotFound(id) => CheckoutError::OrderNotFound(id),
            e @ LedgerError::OrderTotalOverflow(_) => CheckoutError::InvalidOrder(e.to_string()),
            e => CheckoutError::DatabaseError(e.to_string()),
        }
    }
}

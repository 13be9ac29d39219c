use std::{fmt::Debug, future::Future, sync::Arc, time::Duration};

use bitmarket_common::Sats;
use log::*;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    bme_api::errors::InvoiceApiError,
    db::traits::{LedgerDatabase, OrderManagement},
    db_types::{NewPayment, PaymentReference},
    gateway::{GatewayError, LightningGateway, PaidInvoice},
    notifier::{user_room, RealtimeEvent, RealtimeNotifier},
};

const DEFAULT_MEMO: &str = "Bitmarket invoice";

/// The result of a successful invoice issuance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedInvoice {
    pub payment_request: String,
    pub payment_id: i64,
    pub payment_hash: String,
}

/// `InvoiceApi` mints Lightning invoices for marketplace orders and records them in the ledger.
///
/// Every call to the Lightning node is bounded by the timeout given at construction. Nothing is written to the
/// ledger unless the node has successfully created the invoice.
pub struct InvoiceApi<B, G> {
    db: B,
    gateway: G,
    notifier: Arc<dyn RealtimeNotifier>,
    timeout: Duration,
}

impl<B, G> Debug for InvoiceApi<B, G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InvoiceApi (timeout: {:?})", self.timeout)
    }
}

impl<B, G> InvoiceApi<B, G> {
    pub fn new(db: B, gateway: G, notifier: Arc<dyn RealtimeNotifier>, timeout: Duration) -> Self {
        Self { db, gateway, notifier, timeout }
    }

    pub fn db(&self) -> &B {
        &self.db
    }
}

impl<B, G> InvoiceApi<B, G>
where G: LightningGateway
{
    async fn call_gateway<T, F>(&self, request: F) -> Result<T, GatewayError>
    where F: Future<Output = Result<T, GatewayError>> {
        match tokio::time::timeout(self.timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(self.timeout)),
        }
    }

    /// Pays an outgoing invoice from the node's funds.
    ///
    /// The request is decoded first, so that a malformed request is reported as such and the outcome can carry the
    /// payment hash and amount. If a user id is given, the outcome is published to that user's room as `invoice_paid`
    /// or `invoice_failed`. Outgoing payments are not recorded in the ledger.
    pub async fn pay_invoice(
        &self,
        payment_request: &str,
        user_id: Option<i64>,
    ) -> Result<PaidInvoice, InvoiceApiError> {
        let payment_request = payment_request.trim();
        if payment_request.is_empty() {
            return Err(InvoiceApiError::InvalidPaymentRequest("The payment request is empty".to_string()));
        }
        let decoded = match self.call_gateway(self.gateway.decode_payment_request(payment_request)).await {
            Ok(decoded) => decoded,
            Err(GatewayError::Rejected(reason)) => {
                warn!("⚡️ Refusing to pay an undecodable payment request. {reason}");
                return Err(InvoiceApiError::InvalidPaymentRequest(reason));
            },
            Err(e) => {
                warn!("⚡️ Could not decode the payment request. {e}");
                return Err(e.into());
            },
        };
        let result = self.call_gateway(self.gateway.pay_invoice(payment_request)).await;
        match &result {
            Ok(paid) => {
                info!("⚡️ Outgoing payment {} of {} complete. Fee: {}", paid.payment_hash, paid.amount, paid.fee);
                if let Some(id) = user_id {
                    let payload = json!({
                        "payment_hash": paid.payment_hash,
                        "status": "paid",
                        "amount_sats": paid.amount,
                        "fee_sats": paid.fee,
                    });
                    self.notifier.publish(&user_room(id), RealtimeEvent::InvoicePaid, payload);
                }
            },
            Err(e) => {
                warn!("⚡️ Outgoing payment {} of {} failed. {e}", decoded.payment_hash, decoded.amount);
                if let Some(id) = user_id {
                    let payload = json!({
                        "payment_hash": decoded.payment_hash,
                        "payment_request": payment_request,
                        "status": "failed",
                        "amount_sats": decoded.amount,
                        "error": e.to_string(),
                    });
                    self.notifier.publish(&user_room(id), RealtimeEvent::InvoiceFailed, payload);
                }
            },
        }
        result.map_err(InvoiceApiError::from)
    }
}

impl<B, G> InvoiceApi<B, G>
where
    B: LedgerDatabase + OrderManagement,
    G: LightningGateway,
{
    /// Issues a new invoice for `amount_sats`.
    ///
    /// The amount and the reference are validated before the Lightning node is contacted. The memo sent to the node is
    /// tagged with the reference so that node operators can tell invoices apart, but the reference itself is stored as
    /// explicit foreign keys on the payment.
    ///
    /// On success, the payment is stored as `Pending` along with an `invoice-generated` log entry.
    pub async fn issue_invoice(
        &self,
        amount_sats: i64,
        memo: &str,
        reference: PaymentReference,
    ) -> Result<IssuedInvoice, InvoiceApiError> {
        let amount = Sats::positive(amount_sats).map_err(|_| InvoiceApiError::InvalidAmount(amount_sats))?;
        if reference.is_empty() {
            return Err(InvoiceApiError::MissingReference);
        }
        if let Some(order_id) = reference.order_id {
            if self.db.fetch_order(order_id).await?.is_none() {
                return Err(InvoiceApiError::OrderNotFound(order_id));
            }
        }
        let memo = tag_memo(memo, &reference);
        trace!("⚡️ Requesting invoice for {amount} ({memo})");
        let invoice = self.call_gateway(self.gateway.create_invoice(amount, &memo)).await.map_err(|e| {
            warn!("⚡️ Could not create invoice for {amount} ({reference}). {e}");
            InvoiceApiError::from(e)
        })?;
        let new_payment =
            NewPayment::new(invoice.payment_request.clone(), invoice.payment_hash.clone(), amount, reference)
                .with_memo(memo)
                .with_provider(self.gateway.provider_name());
        let payment = self.db.insert_invoice_payment(new_payment).await.map_err(|e| {
            error!(
                "⚡️ The node issued invoice {} for {amount}, but it could not be recorded. It will never be credited. {e}",
                invoice.payment_hash
            );
            InvoiceApiError::PersistenceFailed { hash: invoice.payment_hash.clone(), amount, reason: e.to_string() }
        })?;
        info!("⚡️ Invoice #{} [{}] issued for {amount} ({reference})", payment.id, payment.payment_hash);
        Ok(IssuedInvoice {
            payment_request: payment.invoice,
            payment_id: payment.id,
            payment_hash: payment.payment_hash,
        })
    }
}

fn tag_memo(memo: &str, reference: &PaymentReference) -> String {
    let memo = memo.trim();
    let memo = if memo.is_empty() { DEFAULT_MEMO } else { memo };
    format!("{memo} [{reference}]")
}

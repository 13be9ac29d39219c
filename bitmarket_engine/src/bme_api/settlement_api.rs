use std::{fmt::Debug, sync::Arc, time::Duration};

use log::*;
use serde_json::json;

use crate::{
    bme_api::errors::SettlementError,
    db::traits::{LedgerDatabase, SettlementOutcome},
    db_types::{Payment, PaymentStatus, Wallet},
    events::{EventProducers, PaymentSettledEvent},
    gateway::InvoiceUpdate,
    notifier::{payment_payload, user_room, RealtimeEvent, RealtimeNotifier},
};

/// How often, and how patiently, to retry a settlement for a payment hash that is not in the ledger yet.
///
/// The node can report a settlement before the issuing request has finished writing the payment, so a miss is not
/// immediately treated as an unknown invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissRetryPolicy {
    pub retries: u32,
    pub delay: Duration,
}

impl Default for MissRetryPolicy {
    fn default() -> Self {
        Self { retries: 5, delay: Duration::from_secs(1) }
    }
}

/// `SettlementApi` applies invoice state changes reported by the Lightning node to the ledger.
///
/// Settlement is idempotent per payment hash: the first delivery settles the payment and credits the owner's wallet,
/// and every later delivery is a no-op. After a payment is newly settled, the owner's room is notified, and the
/// payment-settled hooks are called (which is where checkout finalization hangs off).
pub struct SettlementApi<B> {
    db: B,
    notifier: Arc<dyn RealtimeNotifier>,
    producers: EventProducers,
}

impl<B> Debug for SettlementApi<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SettlementApi")
    }
}

impl<B> SettlementApi<B> {
    pub fn new(db: B, notifier: Arc<dyn RealtimeNotifier>, producers: EventProducers) -> Self {
        Self { db, notifier, producers }
    }

    pub fn db(&self) -> &B {
        &self.db
    }

    async fn call_payment_settled_hook(&self, payment: &Payment, wallet: &Wallet) {
        for emitter in &self.producers.payment_settled_producer {
            debug!("🔄️⚡️ Notifying payment settled hook subscribers");
            let event = PaymentSettledEvent::new(payment.clone(), wallet.clone());
            emitter.publish_event(event).await;
        }
    }

    fn notify_settled(&self, payment: &Payment, wallet: &Wallet) {
        let room = user_room(wallet.user_id);
        let mut payload = payment_payload(payment);
        payload["balance_sats"] = json!(wallet.balance_sats);
        self.notifier.publish(&room, RealtimeEvent::PaymentSettled, payload);
        let mut invoice = payment_payload(payment);
        invoice["memo"] = json!(payment.memo);
        invoice["settled"] = json!(true);
        self.notifier.publish(&room, RealtimeEvent::InvoiceSettled, invoice);
    }
}

impl<B> SettlementApi<B>
where B: LedgerDatabase
{
    /// Settles the payment with the given hash.
    ///
    /// Unknown hashes, duplicates and payments that already failed or expired are reported through the outcome and are
    /// not errors.
    pub async fn reconcile(&self, payment_hash: &str) -> Result<SettlementOutcome, SettlementError> {
        self.reconcile_with_preimage(payment_hash, None).await
    }

    pub async fn reconcile_with_preimage(
        &self,
        payment_hash: &str,
        preimage: Option<&str>,
    ) -> Result<SettlementOutcome, SettlementError> {
        let outcome = self.db.settle_payment(payment_hash, preimage).await.map_err(|e| {
            error!("🔄️⚡️ Could not settle payment [{payment_hash}]. {e}");
            SettlementError::from(e)
        })?;
        match &outcome {
            SettlementOutcome::Settled { payment, wallet } => {
                self.notify_settled(payment, wallet);
                self.call_payment_settled_hook(payment, wallet).await;
            },
            SettlementOutcome::AlreadySettled(p) => {
                debug!("🔄️⚡️ Payment #{} [{payment_hash}] was already settled. Ignoring the repeat delivery.", p.id);
            },
            SettlementOutcome::NotSettleable(p) => {
                warn!(
                    "🔄️⚡️ The node reports payment #{} [{payment_hash}] as settled, but it is {}. It will not be \
                     credited.",
                    p.id, p.status
                );
            },
            SettlementOutcome::NotFound => {
                info!("🔄️⚡️ There is no payment with hash [{payment_hash}]");
            },
        }
        Ok(outcome)
    }

    /// Settles the invoice in a settlement update from the node, recording its preimage.
    ///
    /// If the payment hash is not found, the attempt is repeated according to `policy` before giving up.
    pub async fn reconcile_update(
        &self,
        update: &InvoiceUpdate,
        policy: MissRetryPolicy,
    ) -> Result<SettlementOutcome, SettlementError> {
        let hash = update.payment_hash.as_str();
        let mut attempt = 0;
        let outcome = loop {
            let outcome = self.reconcile_with_preimage(hash, update.preimage.as_deref()).await?;
            if outcome != SettlementOutcome::NotFound || attempt >= policy.retries {
                break outcome;
            }
            attempt += 1;
            debug!("🔄️⚡️ Payment [{hash}] not found yet. Retry {attempt} of {} in {:?}", policy.retries, policy.delay);
            tokio::time::sleep(policy.delay).await;
        };
        match &outcome {
            SettlementOutcome::Settled { payment, .. } if update.amount_paid != payment.amount_sats => {
                warn!(
                    "🔄️⚡️ Payment #{} [{hash}] was invoiced for {} but the node reports {} paid. The wallet was credited \
                     with the invoiced amount.",
                    payment.id, payment.amount_sats, update.amount_paid
                );
            },
            SettlementOutcome::NotFound => {
                warn!("🔄️⚡️ Dropping settlement for unknown payment [{hash}] after {} retries", policy.retries);
            },
            _ => {},
        }
        Ok(outcome)
    }

    /// Marks a pending payment as failed. This happens when the node cancels the invoice.
    ///
    /// Returns `None` if there is no pending payment with this hash.
    pub async fn fail_payment(&self, payment_hash: &str, reason: &str) -> Result<Option<Payment>, SettlementError> {
        let payment = self.db.annul_payment(payment_hash, PaymentStatus::Failed, reason).await?;
        match &payment {
            Some(p) => {
                info!("🔄️❌️ Payment #{} [{payment_hash}] has failed. {reason}", p.id);
                self.notify_annulled(p, reason).await;
            },
            None => debug!("🔄️❌️ No pending payment [{payment_hash}] to fail"),
        }
        Ok(payment)
    }

    /// Pending payments that were created more than `age` ago.
    pub async fn stale_payments(&self, age: chrono::Duration) -> Result<Vec<Payment>, SettlementError> {
        Ok(self.db.fetch_stale_payments(age).await?)
    }

    /// Marks a pending payment as expired. Returns `None` if there is no pending payment with this hash.
    pub async fn expire_payment(&self, payment_hash: &str, reason: &str) -> Result<Option<Payment>, SettlementError> {
        let payment = self.db.annul_payment(payment_hash, PaymentStatus::Expired, reason).await?;
        match &payment {
            Some(p) => {
                info!("🔄️⌛️ Payment #{} [{payment_hash}] has expired. {reason}", p.id);
                self.notify_annulled(p, reason).await;
            },
            None => debug!("🔄️⌛️ No pending payment [{payment_hash}] to expire"),
        }
        Ok(payment)
    }

    /// The settle index up to which every settlement from the node has been applied.
    pub async fn settle_index(&self) -> Result<u64, SettlementError> {
        Ok(self.db.fetch_settle_index().await?)
    }

    /// Records that every settlement up to and including `index` has been applied.
    pub async fn record_settle_index(&self, index: u64) -> Result<u64, SettlementError> {
        Ok(self.db.advance_settle_index(index).await?)
    }

    async fn notify_annulled(&self, payment: &Payment, reason: &str) {
        match self.db.fetch_owner_for_payment(payment).await {
            Ok(Some(user_id)) => {
                let mut payload = payment_payload(payment);
                payload["reason"] = json!(reason);
                self.notifier.publish(&user_room(user_id), RealtimeEvent::InvoiceFailed, payload);
            },
            Ok(None) => debug!("🔄️❌️ Payment #{} has no owner to notify", payment.id),
            Err(e) => warn!("🔄️❌️ Could not look up the owner of payment #{}. {e}", payment.id),
        }
    }
}

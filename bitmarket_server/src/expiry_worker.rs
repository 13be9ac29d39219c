//! The expiry worker closes out invoices that were never paid.
//!
//! A payment that is still pending after the cutoff is checked against the node before anything changes. The node
//! has the final word: a settled invoice is settled here too, a canceled one is expired, and one the node still holds
//! open stays pending. Nothing is expired while the node cannot be asked.
use std::sync::Arc;

use bitmarket_engine::{
    db_types::Payment,
    gateway::LightningGateway,
    MissRetryPolicy,
    SettlementApi,
    SettlementError,
    SettlementOutcome,
    SqliteDatabase,
};
use chrono::Duration;
use log::*;
use tokio::task::JoinHandle;

const EXPIRY_REASON: &str = "The invoice expired before it was paid";

/// Starts the invoice expiry worker. Do not await the returned JoinHandle, as it will run indefinitely.
pub fn start_expiry_worker<G: LightningGateway>(
    gateway: G,
    api: Arc<SettlementApi<SqliteDatabase>>,
    cutoff: Duration,
    policy: MissRetryPolicy,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(std::time::Duration::from_secs(60));
        info!("🕰️ Invoice expiry worker started. Pending invoices are checked after {}s", cutoff.num_seconds());
        loop {
            timer.tick().await;
            trace!("🕰️ Running invoice expiry job");
            match expire_unpaid_invoices(&gateway, &api, cutoff, policy).await {
                Ok(expired) if expired.is_empty() => trace!("🕰️ No invoices expired"),
                Ok(expired) => {
                    info!("🕰️ {} invoices expired", expired.len());
                    debug!("🕰️ Expired invoices: {}", payment_list(&expired));
                },
                Err(e) => {
                    error!("🕰️ Error running invoice expiry job: {e}");
                },
            }
        }
    })
}

/// One pass of the expiry worker. Returns the payments that were expired.
pub async fn expire_unpaid_invoices<G: LightningGateway>(
    gateway: &G,
    api: &SettlementApi<SqliteDatabase>,
    cutoff: Duration,
    policy: MissRetryPolicy,
) -> Result<Vec<Payment>, SettlementError> {
    let stale = api.stale_payments(cutoff).await?;
    let mut expired = Vec::with_capacity(stale.len());
    for payment in stale {
        let hash = payment.payment_hash.as_str();
        let update = match gateway.lookup_invoice(hash).await {
            Ok(update) => update,
            Err(e) => {
                warn!("🕰️ Could not look up invoice {hash} on the node. It stays pending for now. {e}");
                continue;
            },
        };
        if update.is_settled() {
            match api.reconcile_update(&update, policy).await {
                Ok(SettlementOutcome::Settled { payment, .. }) => {
                    info!("🕰️ Payment #{} was settled on the node after its deadline here", payment.id)
                },
                Ok(outcome) => debug!("🕰️ Late settlement for {hash} needed no action: {outcome:?}"),
                Err(e) => warn!("🕰️ Could not settle payment {hash}. {e}"),
            }
        } else if update.is_canceled() {
            match api.expire_payment(hash, EXPIRY_REASON).await {
                Ok(Some(p)) => expired.push(p),
                Ok(None) => trace!("🕰️ Payment {hash} was no longer pending"),
                Err(e) => warn!("🕰️ Could not expire payment {hash}. {e}"),
            }
        } else {
            debug!("🕰️ Invoice {hash} is still {} on the node", update.state);
        }
    }
    Ok(expired)
}

fn payment_list(payments: &[Payment]) -> String {
    payments
        .iter()
        .map(|p| format!("[{}] hash: {} amount: {}", p.id, p.payment_hash, p.amount_sats))
        .collect::<Vec<String>>()
        .join(", ")
}

#[cfg(test)]
mod test {
    use std::time::Duration as StdDuration;

    use bitmarket_engine::{
        db_types::{PaymentReference, PaymentStatus},
        events::EventProducers,
        gateway::GatewayError,
        notifier::RealtimeEvent,
        test_utils::{
            prepare_env::{backdate_payment, prepare_test_env, random_db_path},
            MockGateway,
            RecordingNotifier,
        },
        InvoiceApi,
        LedgerQueries,
    };

    use super::*;

    const POLICY: MissRetryPolicy = MissRetryPolicy { retries: 0, delay: StdDuration::from_millis(10) };

    struct Fixture {
        db: SqliteDatabase,
        gateway: MockGateway,
        notifier: Arc<RecordingNotifier>,
        invoices: InvoiceApi<SqliteDatabase, MockGateway>,
        settlements: SettlementApi<SqliteDatabase>,
    }

    async fn fixture() -> Fixture {
        let url = random_db_path();
        prepare_test_env(&url).await;
        let db = SqliteDatabase::new_with_url(&url, 5).await.expect("Error creating database");
        let gateway = MockGateway::new();
        let notifier = Arc::new(RecordingNotifier::new());
        let invoices = InvoiceApi::new(db.clone(), gateway.clone(), notifier.clone(), StdDuration::from_secs(1));
        let settlements = SettlementApi::new(db.clone(), notifier.clone(), EventProducers::default());
        Fixture { db, gateway, notifier, invoices, settlements }
    }

    async fn status(db: &SqliteDatabase, payment_id: i64) -> PaymentStatus {
        db.fetch_payment(payment_id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn the_node_decides_what_happens_to_old_invoices() {
        let f = fixture().await;
        let still_open = f.invoices.issue_invoice(100, "", PaymentReference::for_user(1)).await.unwrap();
        let paid_late = f.invoices.issue_invoice(200, "", PaymentReference::for_user(1)).await.unwrap();
        let canceled = f.invoices.issue_invoice(300, "", PaymentReference::for_user(1)).await.unwrap();
        let fresh = f.invoices.issue_invoice(400, "", PaymentReference::for_user(1)).await.unwrap();
        f.gateway.settle_invoice(&paid_late.payment_hash, 200);
        f.gateway.cancel_invoice(&canceled.payment_hash);
        f.gateway.cancel_invoice(&fresh.payment_hash);
        for p in [&still_open, &paid_late, &canceled] {
            backdate_payment(&f.db, p.payment_id, 7_200).await;
        }

        let expired = expire_unpaid_invoices(&f.gateway, &f.settlements, Duration::hours(1), POLICY).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, canceled.payment_id);
        assert_eq!(status(&f.db, canceled.payment_id).await, PaymentStatus::Expired);
        assert_eq!(status(&f.db, paid_late.payment_id).await, PaymentStatus::Settled);
        assert_eq!(status(&f.db, still_open.payment_id).await, PaymentStatus::Pending);
        assert_eq!(status(&f.db, fresh.payment_id).await, PaymentStatus::Pending);
        assert_eq!(f.db.fetch_wallet_for_user(1).await.unwrap().unwrap().balance_sats.value(), 200);
        assert_eq!(f.notifier.count(RealtimeEvent::PaymentSettled), 1);
    }

    #[tokio::test]
    async fn nothing_expires_while_the_node_is_unreachable() {
        let f = fixture().await;
        let issued = f.invoices.issue_invoice(100, "", PaymentReference::for_user(2)).await.unwrap();
        backdate_payment(&f.db, issued.payment_id, 7_200).await;
        f.gateway.cancel_invoice(&issued.payment_hash);
        f.gateway.set_failure(Some(GatewayError::Unavailable("connection refused".into())));
        let expired = expire_unpaid_invoices(&f.gateway, &f.settlements, Duration::hours(1), POLICY).await.unwrap();
        assert!(expired.is_empty());
        assert_eq!(status(&f.db, issued.payment_id).await, PaymentStatus::Pending);

        f.gateway.set_failure(None);
        let expired = expire_unpaid_invoices(&f.gateway, &f.settlements, Duration::hours(1), POLICY).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(status(&f.db, issued.payment_id).await, PaymentStatus::Expired);
    }
}

use std::fmt::Debug;

use chrono::Duration;
use log::*;
use serde_json::json;
use sqlx::{migrate, SqliteConnection, SqlitePool};

use super::{db_url, new_pool, orders, payments, settlement_cursor, transactions, wallets};
use crate::{
    db::traits::{
        CheckoutResult,
        LedgerDatabase,
        LedgerError,
        LedgerQueries,
        OrderManagement,
        SettlementOutcome,
    },
    db_types::{
        CartItem,
        NewOrder,
        NewPayment,
        Order,
        Payment,
        PaymentStatus,
        ProductOrder,
        Transaction,
        TransactionEvent,
        Wallet,
    },
};

#[derive(Clone)]
pub struct SqliteDatabase {
    url: String,
    pool: SqlitePool,
}

impl Debug for SqliteDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SqliteDatabase ({})", self.url)
    }
}

impl LedgerDatabase for SqliteDatabase {
    fn url(&self) -> &str {
        self.url.as_str()
    }

    async fn insert_invoice_payment(&self, payment: NewPayment) -> Result<Payment, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let payment = payments::insert_payment(payment, &mut tx).await?;
        let metadata = json!({
            "invoice": payment.invoice,
            "amount_sats": payment.amount_sats,
            "order_id": payment.order_id,
            "user_id": payment.user_id,
        });
        transactions::append(payment.id, TransactionEvent::InvoiceGenerated, Some(metadata.to_string()), &mut tx)
            .await?;
        tx.commit().await?;
        debug!("🗃️ Payment #{} [{}] for {} saved as pending", payment.id, payment.payment_hash, payment.amount_sats);
        Ok(payment)
    }

    async fn settle_payment(
        &self,
        payment_hash: &str,
        preimage: Option<&str>,
    ) -> Result<SettlementOutcome, LedgerError> {
        let mut tx = self.pool.begin().await?;
        // The conditional update must be the first statement, so that this transaction holds the write lock before it
        // reads anything.
        let payment = match payments::mark_settled(payment_hash, preimage, &mut tx).await? {
            Some(p) => p,
            None => {
                let outcome = match payments::fetch_payment_by_hash(payment_hash, &mut tx).await? {
                    None => SettlementOutcome::NotFound,
                    Some(p) if p.status == PaymentStatus::Settled => SettlementOutcome::AlreadySettled(p),
                    Some(p) => SettlementOutcome::NotSettleable(p),
                };
                tx.rollback().await?;
                return Ok(outcome);
            },
        };
        let user_id = match resolve_owner(&payment, &mut tx).await? {
            Some(id) => id,
            None => {
                error!(
                    "🗃️ Payment #{} [{payment_hash}] has no user and no order buyer. Refusing to settle it into an \
                     arbitrary wallet.",
                    payment.id
                );
                // Dropping the transaction rolls back the status change
                return Err(LedgerError::OwnerUnresolved(payment_hash.to_string()));
            },
        };
        let metadata = json!({
            "user_id": user_id,
            "amount_sats": payment.amount_sats,
            "preimage": payment.payment_preimage,
        });
        transactions::append(payment.id, TransactionEvent::PaymentSettled, Some(metadata.to_string()), &mut tx).await?;
        let wallet = wallets::credit(user_id, payment.amount_sats, &mut tx).await?;
        tx.commit().await?;
        info!(
            "🗃️ Payment #{} [{payment_hash}] settled. Wallet for user {user_id} credited with {}. New balance: {}",
            payment.id, payment.amount_sats, wallet.balance_sats
        );
        Ok(SettlementOutcome::Settled { payment, wallet })
    }

    async fn annul_payment(
        &self,
        payment_hash: &str,
        status: PaymentStatus,
        reason: &str,
    ) -> Result<Option<Payment>, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let payment = match payments::mark_annulled(payment_hash, status, &mut tx).await? {
            Some(p) => p,
            None => {
                tx.rollback().await?;
                return Ok(None);
            },
        };
        let metadata = json!({ "reason": reason });
        transactions::append(payment.id, TransactionEvent::from(status), Some(metadata.to_string()), &mut tx).await?;
        tx.commit().await?;
        Ok(Some(payment))
    }

    async fn fetch_stale_payments(&self, age: Duration) -> Result<Vec<Payment>, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        payments::fetch_pending_older_than(age.num_seconds(), &mut conn).await
    }

    async fn fetch_settle_index(&self) -> Result<u64, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        settlement_cursor::fetch_settle_index(&mut conn).await
    }

    async fn advance_settle_index(&self, index: u64) -> Result<u64, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        settlement_cursor::advance_settle_index(index, &mut conn).await
    }

    async fn close(&mut self) -> Result<(), LedgerError> {
        self.pool.close().await;
        Ok(())
    }
}

impl LedgerQueries for SqliteDatabase {
    async fn fetch_payment(&self, id: i64) -> Result<Option<Payment>, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        payments::fetch_payment(id, &mut conn).await
    }

    async fn fetch_payment_by_hash(&self, payment_hash: &str) -> Result<Option<Payment>, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        payments::fetch_payment_by_hash(payment_hash, &mut conn).await
    }

    async fn fetch_payments_for_order(&self, order_id: i64) -> Result<Vec<Payment>, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        payments::fetch_payments_for_order(order_id, &mut conn).await
    }

    async fn fetch_transactions_for_payment(&self, payment_id: i64) -> Result<Vec<Transaction>, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        transactions::fetch_for_payment(payment_id, &mut conn).await
    }

    async fn fetch_wallet_for_user(&self, user_id: i64) -> Result<Option<Wallet>, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        wallets::fetch_wallet_for_user(user_id, &mut conn).await
    }

    async fn fetch_owner_for_payment(&self, payment: &Payment) -> Result<Option<i64>, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        resolve_owner(payment, &mut conn).await
    }
}

impl OrderManagement for SqliteDatabase {
    async fn fetch_order(&self, order_id: i64) -> Result<Option<Order>, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        orders::fetch_order(order_id, &mut conn).await
    }

    async fn fetch_product_orders(&self, order_id: i64) -> Result<Vec<ProductOrder>, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        orders::fetch_product_orders(order_id, &mut conn).await
    }

    async fn insert_order(&self, order: NewOrder) -> Result<Order, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let order = orders::insert_order(order, &mut tx).await?;
        tx.commit().await?;
        Ok(order)
    }

    async fn add_cart_item(&self, user_id: i64, product_id: i64, quantity: i64) -> Result<CartItem, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        orders::add_cart_item(user_id, product_id, quantity, &mut conn).await
    }

    async fn fetch_cart(&self, user_id: i64) -> Result<Vec<CartItem>, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        orders::fetch_cart(user_id, &mut conn).await
    }

    async fn finalize_checkout(&self, order_id: i64) -> Result<CheckoutResult, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let order = match orders::mark_paid(order_id, &mut tx).await? {
            Some(order) => order,
            None => {
                let order = orders::fetch_order(order_id, &mut tx).await?.ok_or(LedgerError::OrderNotFound(order_id))?;
                tx.rollback().await?;
                return Ok(CheckoutResult { order, newly_finalized: false, lines_paid: 0, cart_items_cleared: 0 });
            },
        };
        let lines_paid = orders::mark_lines_paid(order_id, &mut tx).await?;
        let cart_items_cleared = orders::clear_cart(order.buyer_id, &mut tx).await?;
        tx.commit().await?;
        debug!(
            "🗃️ Checkout for order #{order_id} complete. {lines_paid} lines paid, {cart_items_cleared} cart items cleared"
        );
        Ok(CheckoutResult { order, newly_finalized: true, lines_paid, cart_items_cleared })
    }
}

/// The owner of a payment is its explicit user, or else the buyer of its order. There is no fallback beyond that.
async fn resolve_owner(payment: &Payment, conn: &mut SqliteConnection) -> Result<Option<i64>, LedgerError> {
    if let Some(user_id) = payment.user_id {
        return Ok(Some(user_id));
    }
    match payment.order_id {
        Some(order_id) => {
            let order = orders::fetch_order(order_id, conn).await?;
            if order.is_none() {
                warn!("🗃️ Payment #{} refers to order #{order_id}, which does not exist", payment.id);
            }
            Ok(order.map(|o| o.buyer_id))
        },
        None => Ok(None),
    }
}

impl SqliteDatabase {
    /// Creates a new database API object
    pub async fn new(max_connections: u32) -> Result<Self, sqlx::Error> {
        let url = db_url();
        SqliteDatabase::new_with_url(url.as_str(), max_connections).await
    }

    pub async fn new_with_url(url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        trace!("Creating new database connection pool with url {url}");
        let pool = new_pool(url, max_connections).await?;
        let url = url.to_string();
        Ok(Self { url, pool })
    }

    /// Runs the embedded schema migrations.
    pub async fn migrate(&self) -> Result<(), LedgerError> {
        migrate!("./src/db/sqlite/migrations")
            .run(&self.pool)
            .await
            .map_err(|e| LedgerError::DatabaseError(format!("Could not run migrations: {e}")))?;
        info!("🗃️ Database migrations complete");
        Ok(())
    }

    /// Returns a reference to the database connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::{
        db_types::{PaymentReference, Sats},
        test_utils::prepare_env::{backdate_payment, prepare_test_env, random_db_path},
    };

    async fn new_db() -> SqliteDatabase {
        let url = random_db_path();
        prepare_test_env(&url).await;
        SqliteDatabase::new_with_url(&url, 5).await.expect("Error creating database")
    }

    fn new_payment(hash: &str, amount: i64, reference: PaymentReference) -> NewPayment {
        NewPayment::new(format!("lnbcrt{amount}n1{hash}"), hash.to_string(), Sats::from(amount), reference)
            .with_memo("test invoice")
    }

    #[tokio::test]
    async fn insert_invoice_payment_logs_invoice_generated() {
        let db = new_db().await;
        let p = db.insert_invoice_payment(new_payment("aa01", 50_000, PaymentReference::for_user(1))).await.unwrap();
        assert_eq!(p.status, PaymentStatus::Pending);
        assert_eq!(p.amount_sats, Sats::from(50_000));
        assert!(p.settled_at.is_none());
        let txs = db.fetch_transactions_for_payment(p.id).await.unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].event_type, TransactionEvent::InvoiceGenerated);
    }

    #[tokio::test]
    async fn duplicate_hash_is_rejected_without_side_effects() {
        let db = new_db().await;
        let p = db.insert_invoice_payment(new_payment("aa02", 1_000, PaymentReference::for_user(1))).await.unwrap();
        let err = db.insert_invoice_payment(new_payment("aa02", 9_000, PaymentReference::for_user(2))).await;
        assert!(matches!(err, Err(LedgerError::PaymentAlreadyExists(h)) if h == "aa02"));
        let stored = db.fetch_payment_by_hash("aa02").await.unwrap().unwrap();
        assert_eq!(stored, p);
        assert_eq!(db.fetch_transactions_for_payment(p.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn settle_credits_wallet_once() {
        let db = new_db().await;
        db.insert_invoice_payment(new_payment("aa03", 50_000, PaymentReference::for_user(7))).await.unwrap();
        let outcome = db.settle_payment("aa03", Some("beef")).await.unwrap();
        let (payment, wallet) = match outcome {
            SettlementOutcome::Settled { payment, wallet } => (payment, wallet),
            o => panic!("Unexpected outcome {o:?}"),
        };
        assert_eq!(payment.status, PaymentStatus::Settled);
        assert_eq!(payment.payment_preimage.as_deref(), Some("beef"));
        assert!(payment.settled_at.is_some());
        assert_eq!(wallet.user_id, 7);
        assert_eq!(wallet.balance_sats, Sats::from(50_000));

        let again = db.settle_payment("aa03", None).await.unwrap();
        assert!(matches!(again, SettlementOutcome::AlreadySettled(p) if p.payment_preimage.as_deref() == Some("beef")));
        let wallet = db.fetch_wallet_for_user(7).await.unwrap().unwrap();
        assert_eq!(wallet.balance_sats, Sats::from(50_000));
        let events = db.fetch_transactions_for_payment(payment.id).await.unwrap();
        let events = events.into_iter().map(|t| t.event_type).collect::<Vec<_>>();
        assert_eq!(events, vec![TransactionEvent::InvoiceGenerated, TransactionEvent::PaymentSettled]);
    }

    #[tokio::test]
    async fn settle_unknown_hash() {
        let db = new_db().await;
        let outcome = db.settle_payment("not-a-hash", None).await.unwrap();
        assert_eq!(outcome, SettlementOutcome::NotFound);
    }

    #[tokio::test]
    async fn settle_resolves_owner_through_order() {
        let db = new_db().await;
        let order = db.insert_order(NewOrder::new(42).with_line(1, 1, Sats::from(25_000))).await.unwrap();
        db.insert_invoice_payment(new_payment("aa04", 25_000, PaymentReference::for_order(order.id))).await.unwrap();
        let outcome = db.settle_payment("aa04", None).await.unwrap();
        assert!(outcome.is_newly_settled());
        let wallet = db.fetch_wallet_for_user(42).await.unwrap().unwrap();
        assert_eq!(wallet.balance_sats, Sats::from(25_000));
    }

    #[tokio::test]
    async fn unresolved_owner_changes_nothing() {
        let db = new_db().await;
        let p = db.insert_invoice_payment(new_payment("aa05", 10_000, PaymentReference::default())).await.unwrap();
        let err = db.settle_payment("aa05", None).await;
        assert!(matches!(err, Err(LedgerError::OwnerUnresolved(h)) if h == "aa05"));
        let stored = db.fetch_payment(p.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Pending);
        assert_eq!(db.fetch_transactions_for_payment(p.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn annulled_payments_cannot_settle() {
        let db = new_db().await;
        db.insert_invoice_payment(new_payment("aa06", 10_000, PaymentReference::for_user(3))).await.unwrap();
        let failed = db.annul_payment("aa06", PaymentStatus::Failed, "canceled by node").await.unwrap().unwrap();
        assert_eq!(failed.status, PaymentStatus::Failed);
        // A second annulment is a no-op
        assert!(db.annul_payment("aa06", PaymentStatus::Expired, "too old").await.unwrap().is_none());
        let outcome = db.settle_payment("aa06", None).await.unwrap();
        assert!(matches!(outcome, SettlementOutcome::NotSettleable(p) if p.status == PaymentStatus::Failed));
        assert!(db.fetch_wallet_for_user(3).await.unwrap().is_none());
        let events = db.fetch_transactions_for_payment(failed.id).await.unwrap();
        let events = events.into_iter().map(|t| t.event_type).collect::<Vec<_>>();
        assert_eq!(events, vec![TransactionEvent::InvoiceGenerated, TransactionEvent::PaymentFailed]);
    }

    #[tokio::test]
    async fn cannot_annul_as_settled() {
        let db = new_db().await;
        db.insert_invoice_payment(new_payment("aa07", 10_000, PaymentReference::for_user(3))).await.unwrap();
        let err = db.annul_payment("aa07", PaymentStatus::Settled, "nope").await;
        assert!(matches!(err, Err(LedgerError::PaymentStatusUpdateError(_))));
    }

    #[tokio::test]
    async fn stale_payments_are_listed_but_not_changed() {
        let db = new_db().await;
        let old = db.insert_invoice_payment(new_payment("aa08", 1_000, PaymentReference::for_user(1))).await.unwrap();
        db.insert_invoice_payment(new_payment("aa09", 1_000, PaymentReference::for_user(1))).await.unwrap();
        let settled = db.insert_invoice_payment(new_payment("aa11", 1_000, PaymentReference::for_user(1))).await.unwrap();
        backdate_payment(&db, old.id, 7200).await;
        backdate_payment(&db, settled.id, 7200).await;
        db.settle_payment("aa11", None).await.unwrap();
        let stale = db.fetch_stale_payments(Duration::seconds(3600)).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, old.id);
        assert_eq!(stale[0].status, PaymentStatus::Pending);
        assert_eq!(db.fetch_payment(old.id).await.unwrap().unwrap().status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn settle_index_only_moves_forward() {
        let db = new_db().await;
        assert_eq!(db.fetch_settle_index().await.unwrap(), 0);
        assert_eq!(db.advance_settle_index(7).await.unwrap(), 7);
        assert_eq!(db.advance_settle_index(3).await.unwrap(), 7);
        assert_eq!(db.advance_settle_index(12).await.unwrap(), 12);
        assert_eq!(db.fetch_settle_index().await.unwrap(), 12);
    }

    #[tokio::test]
    async fn oversized_orders_are_rejected() {
        let db = new_db().await;
        let order = NewOrder::new(5).with_line(100, 4, Sats::from(i64::MAX / 3));
        assert!(matches!(db.insert_order(order).await, Err(LedgerError::OrderTotalOverflow(5))));
    }

    #[tokio::test]
    async fn concurrent_duplicate_settlements_credit_once() {
        let db = new_db().await;
        db.insert_invoice_payment(new_payment("aa10", 50_000, PaymentReference::for_user(9))).await.unwrap();
        let db = Arc::new(db);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let db = Arc::clone(&db);
            handles.push(tokio::spawn(async move { db.settle_payment("aa10", None).await }));
        }
        let mut settled = 0;
        for h in handles {
            match h.await.unwrap().unwrap() {
                SettlementOutcome::Settled { .. } => settled += 1,
                SettlementOutcome::AlreadySettled(_) => {},
                o => panic!("Unexpected outcome {o:?}"),
            }
        }
        assert_eq!(settled, 1);
        let wallet = db.fetch_wallet_for_user(9).await.unwrap().unwrap();
        assert_eq!(wallet.balance_sats, Sats::from(50_000));
    }

    #[tokio::test]
    async fn checkout_finalization() {
        let db = new_db().await;
        let order = db
            .insert_order(NewOrder::new(5).with_line(100, 2, Sats::from(1_000)).with_line(101, 1, Sats::from(500)))
            .await
            .unwrap();
        assert_eq!(order.total_sats, Sats::from(2_500));
        db.add_cart_item(5, 100, 2).await.unwrap();
        db.add_cart_item(5, 101, 1).await.unwrap();
        db.add_cart_item(6, 100, 1).await.unwrap();

        let result = db.finalize_checkout(order.id).await.unwrap();
        assert!(result.newly_finalized);
        assert_eq!(result.order.status, crate::db_types::OrderStatusType::Paid);
        assert_eq!(result.lines_paid, 2);
        assert_eq!(result.cart_items_cleared, 2);
        assert!(db.fetch_cart(5).await.unwrap().is_empty());
        assert_eq!(db.fetch_cart(6).await.unwrap().len(), 1);

        let again = db.finalize_checkout(order.id).await.unwrap();
        assert!(!again.newly_finalized);
        assert!(matches!(db.finalize_checkout(999).await, Err(LedgerError::OrderNotFound(999))));
    }
}

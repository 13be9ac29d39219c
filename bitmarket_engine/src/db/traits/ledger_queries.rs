use crate::{
    db::traits::LedgerError,
    db_types::{Payment, Transaction, Wallet},
};

/// The `LedgerQueries` trait provides read-only access to payments, their transaction history, and wallets.
#[allow(async_fn_in_trait)]
pub trait LedgerQueries {
    async fn fetch_payment(&self, id: i64) -> Result<Option<Payment>, LedgerError>;

    async fn fetch_payment_by_hash(&self, payment_hash: &str) -> Result<Option<Payment>, LedgerError>;

    async fn fetch_payments_for_order(&self, order_id: i64) -> Result<Vec<Payment>, LedgerError>;

    /// The transaction log for the payment, oldest first.
    async fn fetch_transactions_for_payment(&self, payment_id: i64) -> Result<Vec<Transaction>, LedgerError>;

    async fn fetch_wallet_for_user(&self, user_id: i64) -> Result<Option<Wallet>, LedgerError>;

    /// Resolves the user that owns the payment: the explicit user id if there is one, or else the buyer of the
    /// linked order. Returns `None` if neither is available.
    async fn fetch_owner_for_payment(&self, payment: &Payment) -> Result<Option<i64>, LedgerError>;
}

use std::fmt::Debug;

use crate::{
    db::traits::{LedgerError, LedgerQueries},
    db_types::{Payment, Transaction, Wallet},
};

/// Read-only access to the ledger: payments, their histories and wallet balances.
pub struct LedgerApi<B> {
    db: B,
}

impl<B> Debug for LedgerApi<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LedgerApi")
    }
}

impl<B> LedgerApi<B>
where B: LedgerQueries
{
    pub fn new(db: B) -> Self {
        Self { db }
    }

    pub async fn payment(&self, id: i64) -> Result<Option<Payment>, LedgerError> {
        self.db.fetch_payment(id).await
    }

    pub async fn payment_by_hash(&self, payment_hash: &str) -> Result<Option<Payment>, LedgerError> {
        self.db.fetch_payment_by_hash(payment_hash).await
    }

    pub async fn payments_for_order(&self, order_id: i64) -> Result<Vec<Payment>, LedgerError> {
        self.db.fetch_payments_for_order(order_id).await
    }

    /// The full history of a payment, oldest entry first.
    pub async fn history(&self, payment_id: i64) -> Result<Vec<Transaction>, LedgerError> {
        self.db.fetch_transactions_for_payment(payment_id).await
    }

    pub async fn wallet_for_user(&self, user_id: i64) -> Result<Option<Wallet>, LedgerError> {
        self.db.fetch_wallet_for_user(user_id).await
    }
}

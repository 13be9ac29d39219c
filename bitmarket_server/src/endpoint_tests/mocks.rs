use bitmarket_engine::{
    db_types::{Payment, Transaction, Wallet},
    LedgerError,
    LedgerQueries,
};
use mockall::mock;

mock! {
    pub Ledger {}
    impl LedgerQueries for Ledger {
        async fn fetch_payment(&self, id: i64) -> Result<Option<Payment>, LedgerError>;
        async fn fetch_payment_by_hash(&self, payment_hash: &str) -> Result<Option<Payment>, LedgerError>;
        async fn fetch_payments_for_order(&self, order_id: i64) -> Result<Vec<Payment>, LedgerError>;
        async fn fetch_transactions_for_payment(&self, payment_id: i64) -> Result<Vec<Transaction>, LedgerError>;
        async fn fetch_wallet_for_user(&self, user_id: i64) -> Result<Option<Wallet>, LedgerError>;
        async fn fetch_owner_for_payment(&self, payment: &Payment) -> Result<Option<i64>, LedgerError>;
    }
}

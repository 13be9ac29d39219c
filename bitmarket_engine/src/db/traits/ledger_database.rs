use chrono::Duration;
use thiserror::Error;

use crate::{
    db::traits::{data_objects::SettlementOutcome, LedgerQueries},
    db_types::{NewPayment, Payment, PaymentStatus},
};

/// This trait defines the state-changing behaviour that backends supporting the Bitmarket payment engine must provide.
///
/// Every method here is atomic. Either all of its effects are persisted, or none are.
///
/// This behaviour includes:
/// * Recording freshly issued invoices
/// * Settling payments and crediting the owner's wallet
/// * Failing and expiring unpaid invoices
/// * Tracking how far into the node's settlement feed the ledger has been brought up to date
#[allow(async_fn_in_trait)]
pub trait LedgerDatabase: Clone + LedgerQueries {
    /// The URL of the database
    fn url(&self) -> &str;

    /// Stores a new `Pending` payment along with its `invoice-generated` transaction entry, in a single atomic
    /// transaction.
    ///
    /// If a payment with the same payment hash already exists, nothing is written and
    /// [`LedgerError::PaymentAlreadyExists`] is returned.
    async fn insert_invoice_payment(&self, payment: NewPayment) -> Result<Payment, LedgerError>;

    /// Settles the payment with the given hash. In a single atomic transaction:
    /// * The payment status moves from `Pending` to `Settled`, and `settled_at` is set. The preimage is recorded if
    ///   given.
    /// * A `payment-settled` transaction entry is appended.
    /// * The owner is resolved, using the explicit user id on the payment, or else the buyer of the linked order.
    /// * The owner's wallet is credited with exactly the payment amount. The wallet is created if it doesn't exist.
    ///
    /// The status change is a conditional update and is the first write of the transaction, so concurrent calls for
    /// the same hash are serialized by the database and at most one of them observes a `Pending` payment.
    ///
    /// ## Failure modes
    /// * If the owner cannot be resolved, [`LedgerError::OwnerUnresolved`] is returned and nothing is persisted.
    ///
    /// Missing, already-settled and annulled payments are not errors. They are reported through
    /// [`SettlementOutcome`].
    async fn settle_payment(
        &self,
        payment_hash: &str,
        preimage: Option<&str>,
    ) -> Result<SettlementOutcome, LedgerError>;

    /// Moves a `Pending` payment to `Failed` or `Expired`, and appends the matching transaction entry with the given
    /// reason.
    ///
    /// Returns `None` if the payment does not exist or is not pending. In that case nothing is changed.
    async fn annul_payment(
        &self,
        payment_hash: &str,
        status: PaymentStatus,
        reason: &str,
    ) -> Result<Option<Payment>, LedgerError>;

    /// Every `Pending` payment created more than `age` ago, oldest first. Nothing is changed; expiring them is up to
    /// the caller, via [`LedgerDatabase::annul_payment`].
    async fn fetch_stale_payments(&self, age: Duration) -> Result<Vec<Payment>, LedgerError>;

    /// The node's settle index up to which every settlement has been applied. Zero if nothing has been recorded yet.
    async fn fetch_settle_index(&self) -> Result<u64, LedgerError>;

    /// Moves the settle index forward to `index`. The index never moves backwards, so an older value is ignored.
    /// Returns the stored index.
    async fn advance_settle_index(&self, index: u64) -> Result<u64, LedgerError>;

    /// Closes the database connection.
    async fn close(&mut self) -> Result<(), LedgerError>;
}

#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    #[error("We have an internal database engine (configuration/uptime etc.) : {0}")]
    DatabaseError(String),
    #[error("Cannot insert payment, since it already exists with hash {0}")]
    PaymentAlreadyExists(String),
    #[error("The requested payment does not exist: {0}")]
    PaymentNotFound(String),
    #[error("Cannot determine whose wallet to credit for payment {0}")]
    OwnerUnresolved(String),
    #[error("Illegal payment status change. {0}")]
    PaymentStatusUpdateError(String),
    #[error("The requested order {0} does not exist")]
    OrderNotFound(i64),
    #[error("Crediting wallet for user {0} would overflow the balance")]
    BalanceOverflow(i64),
    #[error("The order total for buyer {0} is too large")]
    OrderTotalOverflow(i64),
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        LedgerError::DatabaseError(e.to_string())
    }
}

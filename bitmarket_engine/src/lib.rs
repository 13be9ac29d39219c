//! Bitmarket Payment Engine
//!
//! The Bitmarket Payment Engine is the settlement core of the Bitmarket marketplace. Buyers pay for orders with
//! Lightning invoices; this library issues those invoices, records them in a ledger, and applies the settlement events
//! reported by the Lightning node: the payment is marked settled, the owner's wallet is credited exactly once, and
//! connected clients are notified. It is provider-agnostic.
//!
//! The library is divided into these main sections:
//! 1. Database management and control ([`mod@db`]). SQLite is the supported backend. You should never need to access
//!    the database directly. Instead, use the public API provided by the payment engine. The exception is the data
//!    types used in the database. These are defined in the `db_types` module and are public.
//! 2. The payment engine public API ([`mod@bme_api`]). Invoice issuance, settlement, ledger queries and checkout.
//! 3. The collaborator seams: [`gateway::LightningGateway`] for the Lightning node, and
//!    [`notifier::RealtimeNotifier`] for pushing events to clients. Implementations are injected when the APIs are
//!    constructed.
//!
//! The engine also provides a set of events that can be subscribed to. For example, when a payment settles, a
//! `PaymentSettledEvent` is emitted. A simple Actor framework is used so that you can easily hook into these events and
//! perform custom actions.
mod db;

mod bme_api;
pub mod db_types;
pub mod events;
pub mod gateway;
pub mod notifier;

#[cfg(any(feature = "test_utils", test))]
pub mod test_utils;

pub use bme_api::{
    checkout_api::CheckoutApi,
    errors::{CheckoutError, InvoiceApiError, SettlementError},
    invoice_api::{InvoiceApi, IssuedInvoice},
    ledger_api::LedgerApi,
    settlement_api::{MissRetryPolicy, SettlementApi},
};
#[cfg(feature = "sqlite")]
pub use db::sqlite::SqliteDatabase;
pub use db::traits::{
    CheckoutResult,
    LedgerDatabase,
    LedgerError,
    LedgerQueries,
    OrderManagement,
    SettlementOutcome,
};

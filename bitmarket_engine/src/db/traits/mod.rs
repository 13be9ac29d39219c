//! #  Database management and control.
//!
//! This module provides the interfaces that define the interface contracts of the payment engine database *backends*.
//!
//! ## Ledger
//! The ledger is the record of every invoice the marketplace has issued (payments), the append-only log of what
//! happened to each of them (transactions), and the wallet balances that settled payments are credited to.
//!
//! ## Traits
//! * [`LedgerDatabase`] defines the state-changing behaviour: recording invoices, settling, failing and expiring them.
//!   Each method is a single atomic unit.
//! * [`LedgerQueries`] provides read-only access to payments, transactions and wallets.
//! * [`OrderManagement`] covers the order and cart records that the settlement flow consumes, and checkout
//!   finalization.
mod ledger_database;
mod ledger_queries;
mod order_management;

mod data_objects;

pub use data_objects::{CheckoutResult, SettlementOutcome};
pub use ledger_database::{LedgerDatabase, LedgerError};
pub use ledger_queries::LedgerQueries;
pub use order_management::OrderManagement;

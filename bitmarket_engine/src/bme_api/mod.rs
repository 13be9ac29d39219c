//! # Bitmarket payment engine public API
//!
//! The `bme_api` module exposes the programmatic API for the payment engine.
//! The API is modular, so that clients of the API can pick and choose the functionality they want.
//!
//! * [`invoice_api`] mints Lightning invoices for orders and users, and pays outgoing invoices.
//! * [`settlement_api`] turns settlement events from the Lightning node into ledger changes and client notifications.
//! * [`ledger_api`] provides read access to payments, their transaction history and wallet balances.
//! * [`checkout_api`] completes checkout for orders once they have been paid.
//!
//! # API usage
//!
//! The pattern for using all the APIs is the same. An API instance is created by supplying a database backend that
//! implements the backend traits required by the API, along with any other collaborators it needs.
//!
//! ```rust,ignore
//! use bitmarket_engine::{LedgerApi, SqliteDatabase};
//! let db = SqliteDatabase::new_with_url(...).await?;
//! // SqliteDatabase implements LedgerQueries
//! let api = LedgerApi::new(db);
//! let wallet = api.wallet_for_user(42).await?;
//! ```
pub mod checkout_api;
pub mod errors;
pub mod invoice_api;
pub mod ledger_api;
pub mod settlement_api;

//! # Bitmarket payment server
//! This module hosts the server code for the Bitmarket payment engine. It is responsible for:
//! Issuing Lightning invoices for orders, through the LND node.
//! Listening to the node for settled and canceled invoices, and applying them to the ledger.
//! Pushing payment events to connected clients, in per-user rooms.
//!
//! ## Configuration
//! The server is configured via environment variables. See [config](config/index.html) for more information.
//!
//! ## Routes
//! The server exposes the following routes:
//! * `/health`: A health check route that returns a 200 OK response.
//! * `/api/invoice`: Issues an invoice for an order or a user.
//! * `/api/invoice/pay`: Pays an outgoing invoice from the node's funds.
//! * `/api/payments/...`, `/api/orders/{id}/payments`, `/api/wallets/user/{id}`: Ledger queries.
//! * `/api/events/{room}`: The Server-Sent Events stream for a user's room.

pub mod cli;
pub mod config;
pub mod data_objects;
pub mod errors;
pub mod expiry_worker;
pub mod integrations;
pub mod notifier;
pub mod routes;
pub mod server;
pub mod settlement_listener;

#[cfg(test)]
mod endpoint_tests;

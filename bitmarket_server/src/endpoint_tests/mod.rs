mod events;
mod helpers;
mod invoices;
mod ledger;
mod mocks;

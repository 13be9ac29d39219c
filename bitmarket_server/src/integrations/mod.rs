pub mod lnd;

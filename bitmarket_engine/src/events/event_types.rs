use serde::{Deserialize, Serialize};

use crate::db_types::{Payment, Wallet};

/// Emitted once, after a payment has been settled and its owner's wallet credited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSettledEvent {
    pub payment: Payment,
    pub wallet: Wallet,
}

impl PaymentSettledEvent {
    pub fn new(payment: Payment, wallet: Wallet) -> Self {
        Self { payment, wallet }
    }
}

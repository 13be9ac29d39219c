use serde::{Deserialize, Serialize};

use crate::db_types::{Order, Payment, Wallet};

/// The result of attempting to move a payment into the `Settled` state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementOutcome {
    /// The payment moved from `Pending` to `Settled` and the owner's wallet was credited.
    Settled { payment: Payment, wallet: Wallet },
    /// The payment was settled by an earlier delivery. Nothing was changed.
    AlreadySettled(Payment),
    /// The payment has already failed or expired, and cannot be settled.
    NotSettleable(Payment),
    /// There is no payment with the given hash.
    NotFound,
}

impl SettlementOutcome {
    pub fn payment(&self) -> Option<&Payment> {
        match self {
            SettlementOutcome::Settled { payment, .. } => Some(payment),
            SettlementOutcome::AlreadySettled(p) | SettlementOutcome::NotSettleable(p) => Some(p),
            SettlementOutcome::NotFound => None,
        }
    }

    pub fn is_newly_settled(&self) -> bool {
        matches!(self, SettlementOutcome::Settled { .. })
    }
}

/// The result of finalizing checkout for an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutResult {
    pub order: Order,
    /// False if the order had already been finalized by an earlier call
    pub newly_finalized: bool,
    pub lines_paid: u64,
    pub cart_items_cleared: u64,
}

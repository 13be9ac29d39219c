use std::fmt::Debug;

use log::*;

use crate::{
    bme_api::errors::CheckoutError,
    db::traits::{CheckoutResult, OrderManagement},
    db_types::{CartItem, NewOrder, Order, Payment},
};

/// `CheckoutApi` covers the order records that payments are issued against, and completes checkout once an order's
/// payment has settled.
pub struct CheckoutApi<B> {
    db: B,
}

impl<B> Debug for CheckoutApi<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CheckoutApi")
    }
}

impl<B> CheckoutApi<B>
where B: OrderManagement
{
    pub fn new(db: B) -> Self {
        Self { db }
    }

    pub async fn place_order(&self, order: NewOrder) -> Result<Order, CheckoutError> {
        let order = self.db.insert_order(order).await?;
        Ok(order)
    }

    pub async fn order(&self, order_id: i64) -> Result<Option<Order>, CheckoutError> {
        let order = self.db.fetch_order(order_id).await?;
        Ok(order)
    }

    pub async fn add_to_cart(&self, user_id: i64, product_id: i64, quantity: i64) -> Result<CartItem, CheckoutError> {
        let item = self.db.add_cart_item(user_id, product_id, quantity).await?;
        Ok(item)
    }

    pub async fn cart(&self, user_id: i64) -> Result<Vec<CartItem>, CheckoutError> {
        let items = self.db.fetch_cart(user_id).await?;
        Ok(items)
    }

    /// Marks the order and its lines as paid, and empties the buyer's cart. Idempotent.
    pub async fn finalize_checkout(&self, order_id: i64) -> Result<CheckoutResult, CheckoutError> {
        let result = self.db.finalize_checkout(order_id).await?;
        if result.newly_finalized {
            info!(
                "🛒️ Checkout for order #{order_id} complete. {} lines paid, {} cart items cleared for buyer {}",
                result.lines_paid, result.cart_items_cleared, result.order.buyer_id
            );
        } else {
            debug!("🛒️ Order #{order_id} is already {}. Nothing to finalize.", result.order.status);
        }
        Ok(result)
    }

    /// Finalizes checkout for the order a settled payment was issued for. Payments that are not linked to an order
    /// (e.g. wallet top-ups) have nothing to finalize.
    pub async fn finalize_for_payment(&self, payment: &Payment) -> Result<Option<CheckoutResult>, CheckoutError> {
        match payment.order_id {
            Some(order_id) => self.finalize_checkout(order_id).await.map(Some),
            None => {
                trace!("🛒️ Payment #{} is not linked to an order", payment.id);
                Ok(None)
            },
        }
    }
}

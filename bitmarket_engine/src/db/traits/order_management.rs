use crate::{
    db::traits::{data_objects::CheckoutResult, LedgerError},
    db_types::{CartItem, NewOrder, Order, ProductOrder},
};

/// The `OrderManagement` trait defines the behaviour for the order and cart records that the payment pipeline reads,
/// and for completing checkout once an order has been paid.
#[allow(async_fn_in_trait)]
pub trait OrderManagement {
    async fn fetch_order(&self, order_id: i64) -> Result<Option<Order>, LedgerError>;

    async fn fetch_product_orders(&self, order_id: i64) -> Result<Vec<ProductOrder>, LedgerError>;

    /// Stores a new `Pending` order and its product lines in a single atomic transaction.
    async fn insert_order(&self, order: NewOrder) -> Result<Order, LedgerError>;

    async fn add_cart_item(&self, user_id: i64, product_id: i64, quantity: i64) -> Result<CartItem, LedgerError>;

    async fn fetch_cart(&self, user_id: i64) -> Result<Vec<CartItem>, LedgerError>;

    /// Completes checkout for a paid order. In a single atomic transaction the order and its product lines are marked
    /// `Paid`, and the buyer's cart is emptied.
    ///
    /// Calling this for an order that is already paid changes nothing and reports `newly_finalized = false`.
    async fn finalize_checkout(&self, order_id: i64) -> Result<CheckoutResult, LedgerError>;
}

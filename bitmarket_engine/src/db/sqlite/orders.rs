use log::{debug, trace};
use sqlx::SqliteConnection;

use crate::{
    db::traits::LedgerError,
    db_types::{CartItem, NewOrder, Order, OrderStatusType, ProductOrder},
};

const ORDER_COLUMNS: &str = "id, buyer_id, status, total_sats, created_at, updated_at";

/// Inserts a new order and its product lines. This is not atomic. You can embed this call inside a transaction if
/// you need to ensure atomicity, and pass `&mut *tx` as the connection argument.
pub async fn insert_order(order: NewOrder, conn: &mut SqliteConnection) -> Result<Order, LedgerError> {
    let total = order.total().ok_or(LedgerError::OrderTotalOverflow(order.buyer_id))?;
    let record: Order =
        sqlx::query_as(&format!("INSERT INTO orders (buyer_id, total_sats) VALUES ($1, $2) RETURNING {ORDER_COLUMNS}"))
            .bind(order.buyer_id)
            .bind(total)
            .fetch_one(&mut *conn)
            .await?;
    for line in order.lines {
        sqlx::query("INSERT INTO product_orders (order_id, product_id, quantity, price_sats) VALUES ($1, $2, $3, $4)")
            .bind(record.id)
            .bind(line.product_id)
            .bind(line.quantity)
            .bind(line.price_sats)
            .execute(&mut *conn)
            .await?;
    }
    debug!("📦️ Order #{} for buyer {} saved. Total: {total}", record.id, record.buyer_id);
    Ok(record)
}

pub async fn fetch_order(order_id: i64, conn: &mut SqliteConnection) -> Result<Option<Order>, LedgerError> {
    let order = sqlx::query_as(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
        .bind(order_id)
        .fetch_optional(conn)
        .await?;
    Ok(order)
}

pub async fn fetch_product_orders(order_id: i64, conn: &mut SqliteConnection) -> Result<Vec<ProductOrder>, LedgerError> {
    let lines = sqlx::query_as(
        "SELECT id, order_id, product_id, quantity, price_sats, status FROM product_orders WHERE order_id = $1 ORDER \
         BY id",
    )
    .bind(order_id)
    .fetch_all(conn)
    .await?;
    Ok(lines)
}

/// Conditionally moves the order from `Pending` to `Paid`. Returns `None` if the order is not pending.
pub async fn mark_paid(order_id: i64, conn: &mut SqliteConnection) -> Result<Option<Order>, LedgerError> {
    let order = sqlx::query_as(&format!(
        "UPDATE orders SET status = $1, updated_at = CURRENT_TIMESTAMP WHERE id = $2 AND status = 'pending' RETURNING \
         {ORDER_COLUMNS}"
    ))
    .bind(OrderStatusType::Paid)
    .bind(order_id)
    .fetch_optional(conn)
    .await?;
    Ok(order)
}

pub async fn mark_lines_paid(order_id: i64, conn: &mut SqliteConnection) -> Result<u64, LedgerError> {
    let result = sqlx::query("UPDATE product_orders SET status = 'paid' WHERE order_id = $1 AND status = 'pending'")
        .bind(order_id)
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}

pub async fn add_cart_item(
    user_id: i64,
    product_id: i64,
    quantity: i64,
    conn: &mut SqliteConnection,
) -> Result<CartItem, LedgerError> {
    let item = sqlx::query_as(
        "INSERT INTO carts (user_id, product_id, quantity) VALUES ($1, $2, $3) RETURNING id, user_id, product_id, \
         quantity, created_at",
    )
    .bind(user_id)
    .bind(product_id)
    .bind(quantity)
    .fetch_one(conn)
    .await?;
    Ok(item)
}

pub async fn fetch_cart(user_id: i64, conn: &mut SqliteConnection) -> Result<Vec<CartItem>, LedgerError> {
    let items =
        sqlx::query_as("SELECT id, user_id, product_id, quantity, created_at FROM carts WHERE user_id = $1 ORDER BY id")
            .bind(user_id)
            .fetch_all(conn)
            .await?;
    Ok(items)
}

pub async fn clear_cart(user_id: i64, conn: &mut SqliteConnection) -> Result<u64, LedgerError> {
    let result = sqlx::query("DELETE FROM carts WHERE user_id = $1").bind(user_id).execute(conn).await?;
    trace!("🛒️ Cleared {} cart items for user {user_id}", result.rows_affected());
    Ok(result.rows_affected())
}

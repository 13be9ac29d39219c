use log::{debug, trace};
use sqlx::SqliteConnection;

use crate::{
    db::traits::LedgerError,
    db_types::{NewPayment, Payment, PaymentStatus},
};

const PAYMENT_COLUMNS: &str = "id, order_id, user_id, invoice, payment_hash, payment_preimage, provider, memo, \
                               amount_sats, status, created_at, updated_at, settled_at";

/// Inserts a new `Pending` payment. This is not atomic. Embed this call inside a transaction along with the
/// `invoice-generated` log entry, and pass `&mut *tx` as the connection argument.
pub async fn insert_payment(payment: NewPayment, conn: &mut SqliteConnection) -> Result<Payment, LedgerError> {
    let hash = payment.payment_hash.clone();
    let result = sqlx::query_as(&format!(
        r#"INSERT INTO payments (order_id, user_id, invoice, payment_hash, provider, memo, amount_sats)
           VALUES ($1, $2, $3, $4, $5, $6, $7)
           RETURNING {PAYMENT_COLUMNS}"#
    ))
    .bind(payment.reference.order_id)
    .bind(payment.reference.user_id)
    .bind(payment.invoice)
    .bind(payment.payment_hash)
    .bind(payment.provider)
    .bind(payment.memo)
    .bind(payment.amount_sats)
    .fetch_one(conn)
    .await;
    match result {
        Ok(p) => Ok(p),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(LedgerError::PaymentAlreadyExists(hash)),
        Err(e) => Err(e.into()),
    }
}

pub async fn fetch_payment(id: i64, conn: &mut SqliteConnection) -> Result<Option<Payment>, LedgerError> {
    let payment = sqlx::query_as(&format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1"))
        .bind(id)
        .fetch_optional(conn)
        .await?;
    Ok(payment)
}

pub async fn fetch_payment_by_hash(
    payment_hash: &str,
    conn: &mut SqliteConnection,
) -> Result<Option<Payment>, LedgerError> {
    let payment = sqlx::query_as(&format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE payment_hash = $1"))
        .bind(payment_hash)
        .fetch_optional(conn)
        .await?;
    Ok(payment)
}

pub async fn fetch_payments_for_order(order_id: i64, conn: &mut SqliteConnection) -> Result<Vec<Payment>, LedgerError> {
    let payments =
        sqlx::query_as(&format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE order_id = $1 ORDER BY id ASC"))
            .bind(order_id)
            .fetch_all(conn)
            .await?;
    Ok(payments)
}

/// Conditionally moves a payment from `Pending` to `Settled`. If the payment is not pending (or does not exist),
/// nothing is changed and `None` is returned.
///
/// When called as the first statement of a transaction, this takes the database write lock, so that concurrent
/// settlement attempts for the same hash are serialized.
pub async fn mark_settled(
    payment_hash: &str,
    preimage: Option<&str>,
    conn: &mut SqliteConnection,
) -> Result<Option<Payment>, LedgerError> {
    let payment: Option<Payment> = sqlx::query_as(&format!(
        r#"UPDATE payments SET
            status = 'settled',
            payment_preimage = COALESCE($2, payment_preimage),
            settled_at = CURRENT_TIMESTAMP,
            updated_at = CURRENT_TIMESTAMP
        WHERE payment_hash = $1 AND status = 'pending'
        RETURNING {PAYMENT_COLUMNS}"#
    ))
    .bind(payment_hash)
    .bind(preimage)
    .fetch_optional(conn)
    .await?;
    if let Some(p) = &payment {
        trace!("🧾️ Payment #{} [{payment_hash}] marked as settled", p.id);
    }
    Ok(payment)
}

/// Conditionally moves a payment from `Pending` to `Failed` or `Expired`.
pub async fn mark_annulled(
    payment_hash: &str,
    status: PaymentStatus,
    conn: &mut SqliteConnection,
) -> Result<Option<Payment>, LedgerError> {
    if !matches!(status, PaymentStatus::Failed | PaymentStatus::Expired) {
        return Err(LedgerError::PaymentStatusUpdateError(format!(
            "Payments can only be annulled as failed or expired, not {status}"
        )));
    }
    let payment: Option<Payment> = sqlx::query_as(&format!(
        r#"UPDATE payments SET status = $2, updated_at = CURRENT_TIMESTAMP
        WHERE payment_hash = $1 AND status = 'pending'
        RETURNING {PAYMENT_COLUMNS}"#
    ))
    .bind(payment_hash)
    .bind(status)
    .fetch_optional(conn)
    .await?;
    if let Some(p) = &payment {
        debug!("🧾️ Payment #{} [{payment_hash}] marked as {status}", p.id);
    }
    Ok(payment)
}

/// Fetches every `Pending` payment that was created more than `age_secs` seconds ago, oldest first.
pub async fn fetch_pending_older_than(age_secs: i64, conn: &mut SqliteConnection) -> Result<Vec<Payment>, LedgerError> {
    let modifier = format!("-{age_secs} seconds");
    let payments = sqlx::query_as(&format!(
        r#"SELECT {PAYMENT_COLUMNS} FROM payments
        WHERE status = 'pending' AND created_at < datetime('now', $1)
        ORDER BY created_at ASC, id ASC"#
    ))
    .bind(modifier)
    .fetch_all(conn)
    .await?;
    Ok(payments)
}

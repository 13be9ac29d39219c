use sqlx::SqliteConnection;

use crate::{
    db::traits::LedgerError,
    db_types::{Transaction, TransactionEvent},
};

/// Appends an entry to the payment's transaction log. Entries are never updated or deleted.
pub async fn append(
    payment_id: i64,
    event_type: TransactionEvent,
    metadata: Option<String>,
    conn: &mut SqliteConnection,
) -> Result<Transaction, LedgerError> {
    let tx = sqlx::query_as(
        r#"INSERT INTO transactions (payment_id, event_type, metadata) VALUES ($1, $2, $3)
        RETURNING id, payment_id, event_type, metadata, created_at"#,
    )
    .bind(payment_id)
    .bind(event_type)
    .bind(metadata)
    .fetch_one(conn)
    .await?;
    Ok(tx)
}

pub async fn fetch_for_payment(payment_id: i64, conn: &mut SqliteConnection) -> Result<Vec<Transaction>, LedgerError> {
    let txs = sqlx::query_as(
        r#"SELECT id, payment_id, event_type, metadata, created_at FROM transactions
        WHERE payment_id = $1
        ORDER BY created_at ASC, id ASC"#,
    )
    .bind(payment_id)
    .fetch_all(conn)
    .await?;
    Ok(txs)
}

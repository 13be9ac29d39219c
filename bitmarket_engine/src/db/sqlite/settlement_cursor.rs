use log::trace;
use sqlx::SqliteConnection;

use crate::db::traits::LedgerError;

pub async fn fetch_settle_index(conn: &mut SqliteConnection) -> Result<u64, LedgerError> {
    let index: Option<i64> = sqlx::query_scalar("SELECT settle_index FROM settlement_cursor WHERE id = 1")
        .fetch_optional(conn)
        .await?;
    to_index(index.unwrap_or_default())
}

/// Moves the settle index forward. Smaller values than the stored one leave it unchanged.
pub async fn advance_settle_index(index: u64, conn: &mut SqliteConnection) -> Result<u64, LedgerError> {
    let value = i64::try_from(index)
        .map_err(|_| LedgerError::DatabaseError(format!("Settle index {index} is out of range")))?;
    let stored: i64 = sqlx::query_scalar(
        r#"INSERT INTO settlement_cursor (id, settle_index) VALUES (1, $1)
        ON CONFLICT (id) DO UPDATE SET
            settle_index = MAX(settle_index, excluded.settle_index),
            updated_at = CURRENT_TIMESTAMP
        RETURNING settle_index"#,
    )
    .bind(value)
    .fetch_one(conn)
    .await?;
    trace!("🧭️ Settle index is now {stored}");
    to_index(stored)
}

fn to_index(value: i64) -> Result<u64, LedgerError> {
    u64::try_from(value).map_err(|_| LedgerError::DatabaseError(format!("Stored settle index {value} is negative")))
}

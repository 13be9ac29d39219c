use log::trace;
use sqlx::SqliteConnection;

use crate::{
    db::traits::LedgerError,
    db_types::{Sats, Wallet},
};

pub async fn fetch_wallet_for_user(user_id: i64, conn: &mut SqliteConnection) -> Result<Option<Wallet>, LedgerError> {
    let wallet = sqlx::query_as(
        "SELECT id, user_id, balance_sats, created_at, updated_at FROM wallets WHERE user_id = $1",
    )
    .bind(user_id)
    .fetch_optional(conn)
    .await?;
    Ok(wallet)
}

/// Credits the user's wallet with `amount`, creating the wallet if the user does not have one yet.
///
/// This is not atomic on its own. The only caller is settlement, which runs it inside the settlement transaction.
pub async fn credit(user_id: i64, amount: Sats, conn: &mut SqliteConnection) -> Result<Wallet, LedgerError> {
    let current = fetch_wallet_for_user(user_id, conn).await?.map(|w| w.balance_sats).unwrap_or_default();
    if current.checked_add(amount).is_none() {
        return Err(LedgerError::BalanceOverflow(user_id));
    }
    let wallet: Wallet = sqlx::query_as(
        r#"INSERT INTO wallets (user_id, balance_sats) VALUES ($1, $2)
        ON CONFLICT (user_id) DO UPDATE SET
            balance_sats = balance_sats + excluded.balance_sats,
            updated_at = CURRENT_TIMESTAMP
        RETURNING id, user_id, balance_sats, created_at, updated_at"#,
    )
    .bind(user_id)
    .bind(amount)
    .fetch_one(conn)
    .await?;
    trace!("👛️ Wallet #{} for user {user_id} credited with {amount}. Balance: {}", wallet.id, wallet.balance_sats);
    Ok(wallet)
}

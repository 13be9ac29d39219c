use actix_web::{http::StatusCode, web, web::ServiceConfig};
use bitmarket_engine::{
    db_types::{Payment, PaymentStatus, Sats, Transaction, TransactionEvent, Wallet},
    LedgerApi,
    LedgerError,
};
use chrono::{DateTime, TimeZone, Utc};

use super::{
    helpers::{get_request, json},
    mocks::MockLedger,
};
use crate::routes::{OrderPaymentsRoute, PaymentByHashRoute, PaymentByIdRoute, PaymentHistoryRoute, UserWalletRoute};

const HASH: &str = "5d2b1a4c0e1f4b8a9c3d2e1f0a9b8c7d6e5f4a3b2c1d0e9f8a7b6c5d4e3f2a1b";

fn timestamp() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

fn settled_payment() -> Payment {
    Payment {
        id: 1,
        order_id: Some(42),
        user_id: None,
        invoice: "lnbcrt500u1pexample".to_string(),
        payment_hash: HASH.to_string(),
        payment_preimage: None,
        provider: "lnd".to_string(),
        memo: Some("Order 42 [order 42]".to_string()),
        amount_sats: Sats::from(50_000),
        status: PaymentStatus::Settled,
        created_at: timestamp(),
        updated_at: timestamp(),
        settled_at: Some(timestamp()),
    }
}

fn history() -> Vec<Transaction> {
    vec![
        Transaction {
            id: 1,
            payment_id: 1,
            event_type: TransactionEvent::InvoiceGenerated,
            metadata: None,
            created_at: timestamp(),
        },
        Transaction {
            id: 2,
            payment_id: 1,
            event_type: TransactionEvent::PaymentSettled,
            metadata: Some("{\"user_id\":7}".to_string()),
            created_at: timestamp(),
        },
    ]
}

fn configure(cfg: &mut ServiceConfig) {
    let mut ledger = MockLedger::new();
    ledger.expect_fetch_payment().returning(|id| Ok((id == 1).then(settled_payment)));
    ledger.expect_fetch_payment_by_hash().returning(|hash| Ok((hash == HASH).then(settled_payment)));
    ledger.expect_fetch_transactions_for_payment().returning(|_| Ok(history()));
    ledger.expect_fetch_payments_for_order().returning(|id| match id {
        42 => Ok(vec![settled_payment()]),
        13 => Err(LedgerError::DatabaseError("database is locked".to_string())),
        _ => Ok(vec![]),
    });
    ledger.expect_fetch_wallet_for_user().returning(|user_id| {
        Ok((user_id == 7).then(|| Wallet {
            id: 3,
            user_id,
            balance_sats: Sats::from(50_000),
            created_at: timestamp(),
            updated_at: timestamp(),
        }))
    });
    let api = LedgerApi::new(ledger);
    cfg.service(PaymentByHashRoute::<MockLedger>::new())
        .service(PaymentHistoryRoute::<MockLedger>::new())
        .service(PaymentByIdRoute::<MockLedger>::new())
        .service(OrderPaymentsRoute::<MockLedger>::new())
        .service(UserWalletRoute::<MockLedger>::new())
        .app_data(web::Data::new(api));
}

#[actix_web::test]
async fn fetch_payment_by_id() {
    let _ = env_logger::try_init().ok();
    let (status, body) = get_request("/payments/1", configure).await;
    assert_eq!(status, StatusCode::OK);
    let payment = json(&body);
    assert_eq!(payment["status"], "settled");
    assert_eq!(payment["amount_sats"], 50_000);
    assert_eq!(payment["order_id"], 42);
}

#[actix_web::test]
async fn missing_payment_is_404() {
    let _ = env_logger::try_init().ok();
    let (status, body) = get_request("/payments/2", configure).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json(&body)["error"], "The data was not found. Payment #2");
}

#[actix_web::test]
async fn fetch_payment_by_hash() {
    let _ = env_logger::try_init().ok();
    let (status, body) = get_request(&format!("/payments/hash/{}", HASH.to_uppercase()), configure).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)["payment_hash"], HASH);
    let (status, _) = get_request("/payments/hash/00ff", configure).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn fetch_payment_history() {
    let _ = env_logger::try_init().ok();
    let (status, body) = get_request("/payments/1/transactions", configure).await;
    assert_eq!(status, StatusCode::OK);
    let events = json(&body);
    assert_eq!(events[0]["event_type"], "invoice-generated");
    assert_eq!(events[1]["event_type"], "payment-settled");
    let (status, _) = get_request("/payments/5/transactions", configure).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn fetch_order_payments() {
    let _ = env_logger::try_init().ok();
    let (status, body) = get_request("/orders/42/payments", configure).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body).as_array().map(|a| a.len()), Some(1));
    let (status, body) = get_request("/orders/43/payments", configure).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "[]");
    let (status, _) = get_request("/orders/13/payments", configure).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[actix_web::test]
async fn fetch_user_wallet() {
    let _ = env_logger::try_init().ok();
    let (status, body) = get_request("/wallets/user/7", configure).await;
    assert_eq!(status, StatusCode::OK);
    let wallet = json(&body);
    assert_eq!(wallet["user_id"], 7);
    assert_eq!(wallet["balance_sats"], 50_000);
    let (status, _) = get_request("/wallets/user/8", configure).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

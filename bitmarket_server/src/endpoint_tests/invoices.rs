use std::{sync::Arc, time::Duration};

use actix_web::{http::StatusCode, web, web::ServiceConfig};
use bitmarket_engine::{
    db_types::{NewOrder, PaymentStatus, Sats},
    gateway::GatewayError,
    notifier::RealtimeEvent,
    test_utils::{
        prepare_env::{prepare_test_env, random_db_path},
        MockGateway,
        RecordingNotifier,
    },
    CheckoutApi,
    InvoiceApi,
    LedgerQueries,
    SqliteDatabase,
};
use serde_json::json;

use super::helpers::{json, post_request};
use crate::routes::{IssueInvoiceRoute, PayInvoiceRoute};

struct Fixture {
    db: SqliteDatabase,
    gateway: MockGateway,
    notifier: Arc<RecordingNotifier>,
}

impl Fixture {
    async fn new() -> Self {
        let url = random_db_path();
        prepare_test_env(&url).await;
        let db = SqliteDatabase::new_with_url(&url, 5).await.expect("Error creating database");
        Self { db, gateway: MockGateway::new(), notifier: Arc::new(RecordingNotifier::new()) }
    }

    fn configure(&self) -> impl FnOnce(&mut ServiceConfig) {
        let api = InvoiceApi::new(
            self.db.clone(),
            self.gateway.clone(),
            self.notifier.clone(),
            Duration::from_millis(200),
        );
        move |cfg: &mut ServiceConfig| {
            cfg.service(PayInvoiceRoute::<SqliteDatabase, MockGateway>::new())
                .service(IssueInvoiceRoute::<SqliteDatabase, MockGateway>::new())
                .app_data(web::Data::new(api));
        }
    }
}

#[actix_web::test]
async fn issue_invoice_for_an_order() {
    let f = Fixture::new().await;
    let order = CheckoutApi::new(f.db.clone())
        .place_order(NewOrder::new(42).with_line(3, 1, Sats::from(50_000)))
        .await
        .unwrap();
    let body = json!({"amount_sats": 50_000, "memo": "Order 42", "order_id": order.id});
    let (status, body) = post_request("/invoice", body, f.configure()).await;
    assert_eq!(status, StatusCode::CREATED);
    let issued = json(&body);
    assert!(issued["payment_request"].as_str().unwrap().starts_with("lnbcrt"));
    let payment_id = issued["payment_id"].as_i64().unwrap();
    let payment = f.db.fetch_payment(payment_id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert_eq!(payment.amount_sats, Sats::from(50_000));
    assert_eq!(payment.order_id, Some(order.id));
    assert_eq!(payment.payment_hash, issued["payment_hash"].as_str().unwrap());
}

#[actix_web::test]
async fn invalid_amounts_never_reach_the_node() {
    let f = Fixture::new().await;
    for amount in [0, -10] {
        let body = json!({"amount_sats": amount, "user_id": 1});
        let (status, body) = post_request("/invoice", body, f.configure()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json(&body)["error"].as_str().unwrap().contains("positive"));
    }
    assert_eq!(f.gateway.create_calls(), 0);
}

#[actix_web::test]
async fn invoices_need_a_reference() {
    let f = Fixture::new().await;
    let (status, _) = post_request("/invoice", json!({"amount_sats": 10}), f.configure()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = post_request("/invoice", json!({"amount_sats": 10, "order_id": 999}), f.configure()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(f.gateway.create_calls(), 0);
}

#[actix_web::test]
async fn malformed_bodies_are_rejected() {
    let f = Fixture::new().await;
    let (status, _) = post_request("/invoice", json!({"amount_sats": "lots", "user_id": 1}), f.configure()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[actix_web::test]
async fn gateway_timeouts_record_nothing() {
    let f = Fixture::new().await;
    f.gateway.set_delay(Some(Duration::from_secs(2)));
    let body = json!({"amount_sats": 1_000, "user_id": 5});
    let (status, _) = post_request("/invoice", body.clone(), f.configure()).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    // Safe to retry once the node is responsive again
    f.gateway.set_delay(None);
    let (status, body) = post_request("/invoice", body, f.configure()).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json(&body)["payment_id"], 1);
}

#[actix_web::test]
async fn gateway_unavailable() {
    let f = Fixture::new().await;
    f.gateway.set_failure(Some(GatewayError::Unavailable("connection refused".into())));
    let (status, _) = post_request("/invoice", json!({"amount_sats": 1_000, "user_id": 5}), f.configure()).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[actix_web::test]
async fn pay_invoice_notifies_the_user() {
    let f = Fixture::new().await;
    let body = json!({"payment_request": "lnbcrt10u1pexample", "user_id": 8});
    let (status, body) = post_request("/invoice/pay", body, f.configure()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)["status"], "paid");
    assert_eq!(f.notifier.events_for("user_8").len(), 1);
    let paid = &f.notifier.events_for("user_8")[0];
    assert_eq!(paid.payload["amount_sats"], 1_000);
    assert_eq!(paid.payload["status"], "paid");
    assert_eq!(f.notifier.count(RealtimeEvent::InvoicePaid), 1);

    f.gateway.set_failure(Some(GatewayError::Rejected("no route".into())));
    let body = json!({"payment_request": "lnbcrt10u1pexample", "user_id": 8});
    let (status, _) = post_request("/invoice/pay", body, f.configure()).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(f.notifier.count(RealtimeEvent::InvoiceFailed), 1);
}

#[actix_web::test]
async fn malformed_payment_requests_are_bad_requests() {
    let f = Fixture::new().await;
    for request in ["", "   ", "not-an-invoice"] {
        let body = json!({"payment_request": request, "user_id": 8});
        let (status, _) = post_request("/invoice/pay", body, f.configure()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{request:?}");
    }
    assert_eq!(f.gateway.pay_calls(), 0);
    assert!(f.notifier.events_for("user_8").is_empty());
}

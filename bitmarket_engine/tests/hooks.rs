use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc,
    },
};

use bitmarket_engine::{
    db_types::{NewOrder, OrderStatusType, PaymentReference, Sats},
    events::{EventHandlers, EventHooks},
    test_utils::{
        prepare_env::{prepare_test_env, random_db_path},
        MockGateway,
        RecordingNotifier,
    },
    CheckoutApi,
    InvoiceApi,
    OrderManagement,
    SettlementApi,
    SqliteDatabase,
};
use log::*;
use tokio::runtime::Runtime;

#[derive(Default, Clone)]
struct HookCalled {
    called: Arc<AtomicI32>,
}

impl HookCalled {
    pub fn called(&self) {
        let _ = self.called.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> i32 {
        self.called.load(Ordering::Relaxed)
    }
}

/// The full path from invoice to finalized checkout, with checkout hanging off the payment-settled hook the way the
/// server wires it.
#[test]
fn on_payment_settled_finalizes_checkout() {
    dotenvy::from_filename(".env.test").ok();
    let _ = env_logger::try_init();
    let rt = Runtime::new().unwrap();
    let event = HookCalled::default();
    let event_copy = event.clone();
    rt.block_on(async move {
        let url = random_db_path();
        prepare_test_env(&url).await;
        let db = SqliteDatabase::new_with_url(&url, 5).await.expect("Error creating database");
        let checkout = Arc::new(CheckoutApi::new(db.clone()));

        let mut hooks = EventHooks::default();
        let hook_checkout = Arc::clone(&checkout);
        hooks.on_payment_settled(move |ev| {
            info!("🪝️ {ev:?}");
            let checkout = Arc::clone(&hook_checkout);
            let event = event_copy.clone();
            Box::pin(async move {
                checkout.finalize_for_payment(&ev.payment).await.expect("Error finalizing checkout");
                event.called();
            }) as Pin<Box<dyn Future<Output = ()> + Send>>
        });
        let handlers = EventHandlers::new(16, hooks);
        let producers = handlers.producers();
        let on_settled = handlers.on_payment_settled.expect("hook registered");
        let handler = tokio::spawn(on_settled.start_handler());

        let notifier = Arc::new(RecordingNotifier::new());
        let gateway = MockGateway::new();
        let invoices = InvoiceApi::new(db.clone(), gateway, notifier.clone(), std::time::Duration::from_secs(5));
        let settlement = SettlementApi::new(db.clone(), notifier.clone(), producers);

        let order = checkout.place_order(NewOrder::new(42).with_line(3, 1, Sats::from(50_000))).await.unwrap();
        checkout.add_to_cart(42, 3, 1).await.unwrap();
        let issued = invoices.issue_invoice(50_000, "Order 42", PaymentReference::for_order(order.id)).await.unwrap();
        settlement.reconcile(&issued.payment_hash).await.unwrap();
        settlement.reconcile(&issued.payment_hash).await.unwrap();
        drop(settlement);
        handler.await.unwrap();

        let order = db.fetch_order(order.id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatusType::Paid);
        assert!(db.fetch_cart(42).await.unwrap().is_empty());
        let lines = db.fetch_product_orders(order.id).await.unwrap();
        assert!(lines.iter().all(|l| l.status == OrderStatusType::Paid));
    });
    assert_eq!(event.count(), 1);
    info!("🪝️ test complete");
}

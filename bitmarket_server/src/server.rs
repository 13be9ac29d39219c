use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use actix_web::{dev::Server, http::KeepAlive, middleware::Logger, web, web::ServiceConfig, App, HttpServer};
use bitmarket_engine::{
    events::{EventHandlers, EventHooks},
    gateway::LightningGateway,
    notifier::RealtimeNotifier,
    CheckoutApi,
    InvoiceApi,
    LedgerApi,
    LedgerQueries,
    SettlementApi,
    SqliteDatabase,
};
use log::*;

use crate::{
    config::ServerConfig,
    errors::ServerError,
    expiry_worker::start_expiry_worker,
    integrations::lnd::LndGateway,
    notifier::RoomHub,
    routes::{
        health,
        room_events,
        InvoiceBackend,
        IssueInvoiceRoute,
        OrderPaymentsRoute,
        PayInvoiceRoute,
        PaymentByHashRoute,
        PaymentByIdRoute,
        PaymentHistoryRoute,
        UserWalletRoute,
    },
    settlement_listener::start_settlement_listener,
};

const HOOK_BUFFER_SIZE: usize = 100;

pub async fn run_server(config: ServerConfig) -> Result<(), ServerError> {
    let db = SqliteDatabase::new_with_url(&config.database_url, 25)
        .await
        .map_err(|e| ServerError::InitializeError(e.to_string()))?;
    if config.auto_migrate {
        db.migrate().await.map_err(|e| ServerError::InitializeError(format!("Could not migrate the database. {e}")))?;
        info!("🚀️ Database migrations are up to date");
    }
    let gateway = LndGateway::new(&config.lnd, config.invoice_expiry)
        .map_err(|e| ServerError::InitializeError(format!("Could not configure the LND client. {e}")))?;
    let hub = RoomHub::default();

    let handlers = EventHandlers::new(HOOK_BUFFER_SIZE, checkout_hooks(db.clone()));
    let producers = handlers.producers();
    handlers.start_handlers().await;

    let notifier: Arc<dyn RealtimeNotifier> = Arc::new(hub.clone());
    let settlements = Arc::new(SettlementApi::new(db.clone(), notifier, producers));
    let _expiry_worker = start_expiry_worker(
        gateway.clone(),
        Arc::clone(&settlements),
        config.expiry_cutoff(),
        config.listener.miss_retry,
    );
    let listener = start_settlement_listener(gateway.clone(), settlements, config.listener);

    let srv = create_server_instance(&config, db, gateway, hub)?;
    let result = srv.await.map_err(|e| ServerError::Unspecified(e.to_string()));
    listener.shutdown().await;
    result
}

/// When an order's payment settles, the checkout is completed: the order and its lines are marked as paid and the
/// buyer's cart is emptied.
pub fn checkout_hooks(db: SqliteDatabase) -> EventHooks {
    let checkout = Arc::new(CheckoutApi::new(db));
    let mut hooks = EventHooks::default();
    hooks.on_payment_settled(move |ev| {
        let checkout = Arc::clone(&checkout);
        Box::pin(async move {
            if let Err(e) = checkout.finalize_for_payment(&ev.payment).await {
                error!("🛒️ Could not complete checkout for payment #{}. {e}", ev.payment.id);
            }
        }) as Pin<Box<dyn Future<Output = ()> + Send>>
    });
    hooks
}

pub fn create_server_instance<G: LightningGateway>(
    config: &ServerConfig,
    db: SqliteDatabase,
    gateway: G,
    hub: RoomHub,
) -> Result<Server, ServerError> {
    let gateway_timeout = config.lnd.timeout;
    let srv = HttpServer::new(move || {
        let notifier: Arc<dyn RealtimeNotifier> = Arc::new(hub.clone());
        let invoice_api = InvoiceApi::new(db.clone(), gateway.clone(), notifier, gateway_timeout);
        let ledger_api = LedgerApi::new(db.clone());
        App::new()
            .wrap(Logger::new("%t (%D ms) %s %a %{Host}i %U").log_target("bmk::access_log"))
            .app_data(web::Data::new(invoice_api))
            .app_data(web::Data::new(ledger_api))
            .app_data(web::Data::new(hub.clone()))
            .service(health)
            .service(web::scope("/api").configure(api_routes::<SqliteDatabase, G>))
    })
    .keep_alive(KeepAlive::Timeout(Duration::from_secs(600)))
    .bind((config.host.as_str(), config.port))?
    .run();
    Ok(srv)
}

/// Registers the `/api` routes. The APIs they use must already be registered as app data.
pub fn api_routes<B, G>(cfg: &mut ServiceConfig)
where
    B: InvoiceBackend + LedgerQueries + 'static,
    G: LightningGateway,
{
    cfg.service(IssueInvoiceRoute::<B, G>::new())
        .service(PayInvoiceRoute::<B, G>::new())
        .service(PaymentByHashRoute::<B>::new())
        .service(PaymentHistoryRoute::<B>::new())
        .service(PaymentByIdRoute::<B>::new())
        .service(OrderPaymentsRoute::<B>::new())
        .service(UserWalletRoute::<B>::new())
        .service(room_events);
}

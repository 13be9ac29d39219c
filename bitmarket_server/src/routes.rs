//! Request handler definitions
//!
//! Define each route and it handler here.
//! Handlers that are more than a line or two MUST go into a separate module. Keep this module neat and tidy 🙏
//!
//! A note about performance:
//! Since each worker thread processes its requests sequentially, handlers which block the current thread will cause the
//! current worker to stop processing new requests:
//! ```nocompile
//!     fn my_handler() -> impl Responder {
//!         std::thread::sleep(Duration::from_secs(5)); // <-- Bad practice! Will cause the current worker thread to
//! hang!
//!     }
//! ```
//! For this reason, any long, non-cpu-bound operation (e.g. I/O, database operations, etc.) should be expressed as
//! futures or asynchronous functions. Async handlers get executed concurrently by worker threads and thus don’t block
//! execution:
//!
//! ```nocompile
//!     async fn my_handler() -> impl Responder {
//!         tokio::time::sleep(Duration::from_secs(5)).await; // <-- Ok. Worker thread will handle other requests here
//!     }
//! ```
use actix_web::{get, http::header, web, HttpResponse, Responder};
use bitmarket_engine::{
    gateway::LightningGateway,
    InvoiceApi,
    LedgerApi,
    LedgerDatabase,
    LedgerQueries,
    OrderManagement,
};
use log::*;

use crate::{
    data_objects::{InvoiceRequest, PayInvoiceRequest, PayInvoiceResponse},
    errors::ServerError,
    notifier::RoomHub,
};

// Web-actix cannot handle generics in handlers, so it's implemented manually using the `route!` macro
#[macro_export]
macro_rules! route {
    ($name:ident => $method:ident $path:literal impl $($bounds:ty),+) => {
        paste::paste! { pub struct [<$name:camel Route>]< $( [< T $bounds:camel> ],)+ >( $( core::marker::PhantomData<fn() -> [< T $bounds:camel> ] >,)+ );}
        paste::paste! { impl< $( [< T $bounds:camel> ],)+ > [<$name:camel Route>]< $( [< T $bounds:camel> ],)+ > {
            #[allow(clippy::new_without_default)]
            pub fn new() -> Self {
                Self($( core::marker::PhantomData::<fn() -> [< T $bounds:camel> ] >,)+)
            }
        }}
        paste::paste! { impl<$( [< T $bounds:camel >] , )+> actix_web::dev::HttpServiceFactory for [<$name:camel Route>]<$([<T $bounds:camel>],)+>
        where
            $([<T $bounds:camel>]: $bounds + 'static,)+
        {
            fn register(self, config: &mut actix_web::dev::AppService) {
                let res = actix_web::Resource::new($path)
                    .name(stringify!($name))
                    .guard(actix_web::guard::$method())
                    .to($name::< $( [< T $bounds:camel >], )+>);
                actix_web::dev::HttpServiceFactory::register(res, config);
            }
        }}
    };
}

/// Everything that invoice issuance needs from the database.
pub trait InvoiceBackend: LedgerDatabase + OrderManagement {}

impl<T> InvoiceBackend for T where T: LedgerDatabase + OrderManagement {}

// ----------------------------------------------   Health  ----------------------------------------------------
#[get("/health")]
pub async fn health() -> impl Responder {
    trace!("💻️ Received health check request");
    HttpResponse::Ok().body("👍️\n")
}

//----------------------------------------------   Invoices  ----------------------------------------------------
route!(issue_invoice => Post "/invoice" impl InvoiceBackend, LightningGateway);
/// Route handler for issuing invoices
///
/// The body carries the amount in sats, an optional memo, and at least one of `order_id` and `user_id`. On success
/// the response is `201 Created` with the BOLT11 payment request, the new payment's id and its payment hash. The
/// payment stays pending until the node reports it as settled.
///
/// Nothing is recorded if the node fails or times out, so a failed request can simply be retried.
pub async fn issue_invoice<B, G>(
    body: web::Json<InvoiceRequest>,
    api: web::Data<InvoiceApi<B, G>>,
) -> Result<HttpResponse, ServerError>
where
    B: InvoiceBackend,
    G: LightningGateway,
{
    let request = body.into_inner();
    let reference = request.reference();
    debug!("💻️ POST invoice for {} sats ({reference})", request.amount_sats);
    let memo = request.memo.as_deref().unwrap_or_default();
    let issued = api.issue_invoice(request.amount_sats, memo, reference).await.map_err(|e| {
        debug!("💻️ Could not issue invoice. {e}");
        ServerError::from(e)
    })?;
    Ok(HttpResponse::Created().json(issued))
}

route!(pay_invoice => Post "/invoice/pay" impl InvoiceBackend, LightningGateway);
/// Route handler for paying an outgoing invoice from the node's funds
///
/// If a `user_id` is given, the outcome is also pushed to that user's realtime room.
pub async fn pay_invoice<B, G>(
    body: web::Json<PayInvoiceRequest>,
    api: web::Data<InvoiceApi<B, G>>,
) -> Result<HttpResponse, ServerError>
where
    B: InvoiceBackend,
    G: LightningGateway,
{
    let request = body.into_inner();
    debug!("💻️ POST pay invoice");
    let paid = api.pay_invoice(&request.payment_request, request.user_id).await?;
    let response = PayInvoiceResponse {
        payment_hash: paid.payment_hash,
        payment_preimage: paid.payment_preimage,
        status: "paid".to_string(),
    };
    Ok(HttpResponse::Ok().json(response))
}

//----------------------------------------------   Payments  ----------------------------------------------------
route!(payment_by_id => Get "/payments/{id}" impl LedgerQueries);
pub async fn payment_by_id<B: LedgerQueries>(
    path: web::Path<i64>,
    api: web::Data<LedgerApi<B>>,
) -> Result<HttpResponse, ServerError> {
    let id = path.into_inner();
    debug!("💻️ GET payment #{id}");
    let payment = api.payment(id).await?.ok_or_else(|| ServerError::NoRecordFound(format!("Payment #{id}")))?;
    Ok(HttpResponse::Ok().json(payment))
}

route!(payment_by_hash => Get "/payments/hash/{hash}" impl LedgerQueries);
pub async fn payment_by_hash<B: LedgerQueries>(
    path: web::Path<String>,
    api: web::Data<LedgerApi<B>>,
) -> Result<HttpResponse, ServerError> {
    let hash = path.into_inner().to_lowercase();
    debug!("💻️ GET payment with hash {hash}");
    let payment =
        api.payment_by_hash(&hash).await?.ok_or_else(|| ServerError::NoRecordFound(format!("Payment {hash}")))?;
    Ok(HttpResponse::Ok().json(payment))
}

route!(payment_history => Get "/payments/{id}/transactions" impl LedgerQueries);
/// The transaction log for a payment, oldest entry first.
pub async fn payment_history<B: LedgerQueries>(
    path: web::Path<i64>,
    api: web::Data<LedgerApi<B>>,
) -> Result<HttpResponse, ServerError> {
    let id = path.into_inner();
    debug!("💻️ GET transactions for payment #{id}");
    if api.payment(id).await?.is_none() {
        return Err(ServerError::NoRecordFound(format!("Payment #{id}")));
    }
    let history = api.history(id).await?;
    Ok(HttpResponse::Ok().json(history))
}

route!(order_payments => Get "/orders/{id}/payments" impl LedgerQueries);
pub async fn order_payments<B: LedgerQueries>(
    path: web::Path<i64>,
    api: web::Data<LedgerApi<B>>,
) -> Result<HttpResponse, ServerError> {
    let order_id = path.into_inner();
    debug!("💻️ GET payments for order {order_id}");
    let payments = api.payments_for_order(order_id).await?;
    Ok(HttpResponse::Ok().json(payments))
}

//----------------------------------------------   Wallets  ----------------------------------------------------
route!(user_wallet => Get "/wallets/user/{user_id}" impl LedgerQueries);
pub async fn user_wallet<B: LedgerQueries>(
    path: web::Path<i64>,
    api: web::Data<LedgerApi<B>>,
) -> Result<HttpResponse, ServerError> {
    let user_id = path.into_inner();
    debug!("💻️ GET wallet for user {user_id}");
    let wallet = api
        .wallet_for_user(user_id)
        .await?
        .ok_or_else(|| ServerError::NoRecordFound(format!("No wallet for user {user_id}")))?;
    Ok(HttpResponse::Ok().json(wallet))
}

//----------------------------------------------   Realtime  ----------------------------------------------------
/// Route handler for the realtime event stream
///
/// Clients join the room for their user, `user_{id}`, by opening this Server-Sent Events stream, and leave it by
/// closing the connection. Events that were published while a client was not connected are not replayed. Clients
/// should re-fetch the payment after reconnecting.
#[get("/events/{room}")]
pub async fn room_events(path: web::Path<String>, hub: web::Data<RoomHub>) -> Result<HttpResponse, ServerError> {
    let room = path.into_inner();
    let is_user_room = room.strip_prefix("user_").is_some_and(|id| id.parse::<i64>().is_ok());
    if !is_user_room {
        return Err(ServerError::InvalidRequestPath(format!("{room} is not a user room")));
    }
    debug!("💻️ Client joined {room}");
    Ok(HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .streaming(hub.sse_stream(&room)))
}

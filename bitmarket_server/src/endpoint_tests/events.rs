use actix_web::{
    body::MessageBody,
    http::{header, StatusCode},
    test,
    web,
    App,
};
use bitmarket_engine::notifier::{RealtimeEvent, RealtimeNotifier};
use futures::future::poll_fn;
use serde_json::json;

use crate::{notifier::RoomHub, routes::room_events};

#[actix_web::test]
async fn clients_receive_events_for_their_room() {
    let _ = env_logger::try_init().ok();
    let hub = RoomHub::default();
    let app = App::new().app_data(web::Data::new(hub.clone())).service(room_events);
    let service = test::init_service(app).await;
    let req = test::TestRequest::get().uri("/events/user_12").to_request();
    let res = test::call_service(&service, req).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers().get(header::CONTENT_TYPE).unwrap(), "text/event-stream");
    assert_eq!(hub.members("user_12"), 1);

    hub.publish("user_13", RealtimeEvent::PaymentSettled, json!({"payment_id": 1}));
    hub.publish("user_12", RealtimeEvent::PaymentSettled, json!({"payment_id": 2}));
    let mut body = res.into_body();
    let chunk = poll_fn(|cx| std::pin::Pin::new(&mut body).poll_next(cx)).await.unwrap().unwrap();
    assert_eq!(chunk, "event: payment_settled\ndata: {\"payment_id\":2}\n\n");

    // Leaving the room happens when the connection goes away
    drop(body);
    assert_eq!(hub.members("user_12"), 0);
}

#[actix_web::test]
async fn only_user_rooms_can_be_joined() {
    let hub = RoomHub::default();
    let app = App::new().app_data(web::Data::new(hub.clone())).service(room_events);
    let service = test::init_service(app).await;
    for uri in ["/events/admin", "/events/user_", "/events/user_abc"] {
        let req = test::TestRequest::get().uri(uri).to_request();
        let res = test::call_service(&service, req).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST, "{uri}");
    }
    assert_eq!(hub.members("admin"), 0);
}

//! Gateway behavior over an in-memory transport with tokio's paused clock: heartbeat,
//! reconnection, deadlines, correlation and subscription routing.

mod common;

use common::{config, MockConnector, MockServer};
use kiot::config::GatewayConfig;
use kiot::device::Device;
use kiot::gateway::{ConnectionState, Envelope, Frame, Gateway, GatewayError, Request};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

async fn start(cfg: GatewayConfig) -> (Gateway, Arc<MockConnector>, MockServer) {
    let connector = MockConnector::new();
    let server = connector.accept();
    let gw = match Gateway::connect_with(cfg, connector.clone()).await {
        Ok(gw) => gw,
        Err(e) => panic!("connect failed: {}", e),
    };
    (gw, connector, server)
}

async fn wait_state(rx: &mut watch::Receiver<ConnectionState>, target: ConnectionState) {
    rx.wait_for(|s| *s == target).await.expect("state channel closed");
}

fn assert_secs(elapsed: Duration, secs: u64) {
    let expected = Duration::from_secs(secs);
    assert!(
        elapsed >= expected && elapsed < expected + Duration::from_millis(50),
        "expected ~{}s, got {:?}",
        secs,
        elapsed
    );
}

fn get_dev1() -> Envelope {
    Request::Get {
        index: "iot".into(),
        collection: "device-info".into(),
        id: "dev-1".into(),
    }
    .into()
}

// --- connection and heartbeat ---

#[tokio::test(start_paused = true)]
async fn connect_failure_is_reported() {
    let connector = MockConnector::new();
    connector.refuse();
    let res = Gateway::connect_with(config(), connector.clone()).await;
    assert!(matches!(res, Err(GatewayError::Connect(_))));
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn acknowledged_ping_keeps_connection() {
    let (gw, connector, mut server) = start(config()).await;
    let start = Instant::now();

    let payload = match server.next_frame().await {
        Some(Frame::Ping(p)) => p,
        other => panic!("expected a ping, got {:?}", other),
    };
    assert_secs(start.elapsed(), 60);
    server.send(Frame::Pong(payload));

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(gw.state(), ConnectionState::Connected);
    assert_eq!(connector.attempts(), 1);
    assert!(server.try_next_frame().is_none(), "only one ping per quiet period");
}

#[tokio::test(start_paused = true)]
async fn unanswered_ping_reconnects_once() {
    let (gw, connector, mut server) = start(config()).await;
    let mut server2 = connector.accept();
    let mut states = gw.watch_state();
    let start = Instant::now();

    assert!(matches!(server.next_frame().await, Some(Frame::Ping(_))));
    wait_state(&mut states, ConnectionState::Reconnecting).await;
    assert_secs(start.elapsed(), 70);
    wait_state(&mut states, ConnectionState::Connected).await;
    assert_secs(start.elapsed(), 75);
    assert_eq!(connector.attempts(), 2);
    assert!(server.next_frame().await.is_none(), "old connection released");

    let gw2 = gw.clone();
    let call = tokio::spawn(async move { gw2.submit(get_dev1()).await });
    server2.answer_next(200, json!({ "_id": "dev-1", "_source": {} })).await;
    assert_eq!(call.await.unwrap().unwrap().status, 200);

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(connector.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn any_inbound_frame_counts_as_liveness() {
    let (_gw, _connector, mut server) = start(config()).await;
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_secs(50)).await;
        server.notify("someone", "create", json!({ "device_id": "nobody" }));
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(server.try_next_frame().is_none());

    let start = Instant::now();
    assert!(matches!(server.next_frame().await, Some(Frame::Ping(_))));
    assert!(start.elapsed() <= Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn reconnect_retries_at_fixed_interval() {
    let (gw, connector, server) = start(config()).await;
    connector.refuse();
    connector.refuse();
    let _server2 = connector.accept();
    let mut states = gw.watch_state();

    let lost_at = Instant::now();
    drop(server);
    wait_state(&mut states, ConnectionState::Reconnecting).await;
    wait_state(&mut states, ConnectionState::Connected).await;

    let times = connector.attempt_times();
    assert_eq!(times.len(), 4);
    for (i, t) in times[1..].iter().enumerate() {
        assert_secs(t.duration_since(lost_at), 5 * (i as u64 + 1));
    }
}

#[tokio::test(start_paused = true)]
async fn sends_refused_while_reconnecting() {
    let (gw, _connector, server) = start(config()).await;
    let mut states = gw.watch_state();
    drop(server);
    wait_state(&mut states, ConnectionState::Reconnecting).await;

    match gw.submit(get_dev1()).await {
        Err(GatewayError::Send(_)) => {}
        other => panic!("expected send refusal, got {:?}", other),
    }
    assert_eq!(gw.pending_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn disconnect_interrupts_reconnection() {
    let (gw, connector, server) = start(config()).await;
    let mut states = gw.watch_state();
    drop(server);
    wait_state(&mut states, ConnectionState::Reconnecting).await;

    gw.disconnect().await.unwrap();
    assert_eq!(gw.state(), ConnectionState::Disconnected);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.attempts(), 1);
    assert!(matches!(gw.submit(get_dev1()).await, Err(GatewayError::Send(_))));
}

#[tokio::test(start_paused = true)]
async fn disconnect_fails_pending_and_ends_subscriptions() {
    let mut cfg = config();
    cfg.request_timeout_ms = None;
    let (gw, connector, mut server) = start(cfg).await;
    let (sub, _) = tokio::join!(
        gw.subscribe("iot", "device-state", "dev-1"),
        server.answer_next(200, json!({ "roomId": "room-1" }))
    );
    let mut sub = sub.unwrap();

    let gw2 = gw.clone();
    let call = tokio::spawn(async move { gw2.submit(get_dev1()).await });
    server.next_request().await.unwrap();

    gw.disconnect().await.unwrap();
    assert!(matches!(call.await.unwrap(), Err(GatewayError::Closed(_))));
    assert!(sub.next().await.is_none());
    assert_eq!(gw.state(), ConnectionState::Disconnected);
    assert!(server.next_frame().await.is_none());

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.attempts(), 1);
    gw.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn disconnect_flushes_queued_frames() {
    let (gw, _connector, mut server) = start(config()).await;
    let device = Device::new("dev-1", "light", gw.clone());
    device.publish_state(json!({ "on": true }), false).await.unwrap();
    gw.disconnect().await.unwrap();

    let req = server.next_request().await.expect("publication written before close");
    assert_eq!(req.request_id, gw.publish_request_id());
    assert!(gw.publish_request_id().ends_with(gw.instance_id()));
}

#[tokio::test(start_paused = true)]
async fn wait_for_state_follows_reconnection() {
    let (gw, connector, server) = start(config()).await;
    let _server2 = connector.accept();
    let start = Instant::now();

    drop(server);
    assert_eq!(gw.wait_for_state(ConnectionState::Reconnecting).await, ConnectionState::Reconnecting);
    assert_eq!(gw.wait_for_state(ConnectionState::Connected).await, ConnectionState::Connected);
    assert_secs(start.elapsed(), 5);

    gw.disconnect().await.unwrap();
    assert_eq!(gw.wait_for_state(ConnectionState::Disconnected).await, ConnectionState::Disconnected);
}

// --- correlation ---

#[tokio::test(start_paused = true)]
async fn deadline_expires_and_frees_entry() {
    let (gw, _connector, mut server) = start(config()).await;
    let gw2 = gw.clone();
    let start = Instant::now();
    let call = tokio::spawn(async move {
        let env = get_dev1().with_request_id("dev-1-get");
        gw2.submit_with_deadline(env, Some(Duration::from_secs(2))).await
    });

    let req = server.next_request().await.unwrap();
    assert_eq!(req.request_id, "dev-1-get");
    assert!(matches!(call.await.unwrap(), Err(GatewayError::Timeout)));
    assert_secs(start.elapsed(), 2);
    assert_eq!(gw.pending_requests(), 0);

    // a late response is dropped and the id can be reused
    server.reply(&req, 200, json!({}));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(gw.state(), ConnectionState::Connected);

    let gw2 = gw.clone();
    let call = tokio::spawn(async move { gw2.submit(get_dev1().with_request_id("dev-1-get")).await });
    server.answer_next(200, json!({ "_id": "dev-1" })).await;
    assert!(call.await.unwrap().unwrap().is_success());
}

#[tokio::test(start_paused = true)]
async fn abandoned_submit_frees_its_request_id() {
    let (gw, _connector, mut server) = start(config()).await;
    let abandoned = tokio::time::timeout(
        Duration::from_secs(1),
        gw.submit(get_dev1().with_request_id("fixed")),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(gw.pending_requests(), 0);

    // its answer still arrives and is dropped
    let req = server.next_request().await.unwrap();
    assert_eq!(req.request_id, "fixed");
    server.reply(&req, 200, json!({ "_id": "dev-1" }));
    tokio::time::sleep(Duration::from_millis(10)).await;

    let gw2 = gw.clone();
    let call = tokio::spawn(async move { gw2.submit(get_dev1().with_request_id("fixed")).await });
    server.answer_next(200, json!({ "_id": "dev-1", "_source": { "n": 2 } })).await;
    let res = call.await.unwrap().unwrap();
    assert_eq!(res.source().unwrap()["n"], 2);
    assert_eq!(gw.pending_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn duplicate_response_completes_once() {
    let (gw, _connector, mut server) = start(config()).await;
    let gw2 = gw.clone();
    let call = tokio::spawn(async move { gw2.submit(get_dev1()).await });

    let req = server.next_request().await.unwrap();
    assert!(!req.request_id.is_empty());
    server.reply(&req, 200, json!({ "_id": "dev-1", "_source": { "n": 1 } }));
    server.reply(&req, 200, json!({ "_id": "dev-1", "_source": { "n": 2 } }));

    let res = call.await.unwrap().unwrap();
    assert_eq!(res.source().unwrap()["n"], 1);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(gw.pending_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn concurrent_requests_resolve_independently() {
    let (gw, _connector, mut server) = start(config()).await;
    let (a, b) = (gw.clone(), gw.clone());
    let first = tokio::spawn(async move { a.get("iot", "device-info", "dev-1").await });
    let req_a = server.next_request().await.unwrap();
    let second = tokio::spawn(async move { b.get("iot", "device-info", "dev-2").await });
    let req_b = server.next_request().await.unwrap();

    server.reply(&req_b, 404, Value::Null);
    server.reply(&req_a, 200, json!({ "_id": "dev-1" }));

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first.status, 200);
    assert_eq!(first.document_id(), Some("dev-1"));
    assert_eq!(second.status, 404);
}

#[tokio::test(start_paused = true)]
async fn service_error_is_in_band_for_submit_and_raised_by_request() {
    let (gw, _connector, mut server) = start(config()).await;
    let gw2 = gw.clone();
    let call = tokio::spawn(async move { gw2.request(get_dev1()).await });
    let req = server.next_request().await.unwrap();
    server.send_json(json!({
        "requestId": req.request_id,
        "status": 404,
        "error": { "message": "document not found", "stack": "at get" }
    }));
    match call.await.unwrap() {
        Err(GatewayError::Service { status, message, stack }) => {
            assert_eq!(status, 404);
            assert_eq!(message, "document not found");
            assert_eq!(stack.as_deref(), Some("at get"));
        }
        other => panic!("expected service error, got {:?}", other),
    }

    let gw2 = gw.clone();
    let call = tokio::spawn(async move { gw2.submit(get_dev1()).await });
    server.answer_next(404, Value::Null).await;
    assert_eq!(call.await.unwrap().unwrap().status, 404);
}

#[tokio::test(start_paused = true)]
async fn duplicate_request_id_rejected() {
    let (gw, _connector, mut server) = start(config()).await;
    let gw2 = gw.clone();
    let call = tokio::spawn(async move { gw2.submit(get_dev1().with_request_id("same")).await });
    let req = server.next_request().await.unwrap();

    match gw.submit(get_dev1().with_request_id("same")).await {
        Err(GatewayError::DuplicateRequestId(id)) => assert_eq!(id, "same"),
        other => panic!("expected duplicate id error, got {:?}", other),
    }
    server.reply(&req, 200, json!({}));
    assert!(call.await.unwrap().unwrap().is_success());
}

#[tokio::test(start_paused = true)]
async fn query_uses_fresh_request_id() {
    let (gw, _connector, mut server) = start(config()).await;
    let gw2 = gw.clone();
    let call = tokio::spawn(async move {
        gw2.query(Envelope::new("server", "now").with_request_id("fixed")).await
    });
    let req = server.answer_next(200, json!({ "now": 1 })).await;
    assert_ne!(req.request_id, "fixed");
    assert!(!req.request_id.is_empty());
    assert_eq!(call.await.unwrap().unwrap().result.unwrap()["now"], 1);
}

#[tokio::test(start_paused = true)]
async fn post_response_is_consumed() {
    let (gw, _connector, mut server) = start(config()).await;
    let id = gw.post(get_dev1()).await.unwrap();
    assert_eq!(gw.pending_requests(), 1);
    let req = server.next_request().await.unwrap();
    assert_eq!(req.request_id, id);

    server.reply(&req, 500, Value::Null);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(gw.pending_requests(), 0);
}

// --- subscriptions ---

#[tokio::test(start_paused = true)]
async fn notifications_route_by_subject() {
    let (gw, _connector, mut server) = start(config()).await;
    let (sub, req) = tokio::join!(
        gw.subscribe("iot", "device-state", "dev-1"),
        server.answer_next(200, json!({ "roomId": "room-1", "channel": "c-1" }))
    );
    let mut sub = sub.unwrap();
    assert_eq!(req.controller, "realtime");
    assert_eq!(req.action, "subscribe");
    assert_eq!(req.index.as_deref(), Some("iot"));
    assert_eq!(req.collection.as_deref(), Some("device-state"));
    assert_eq!(req.body, Some(json!({ "equals": { "device_id": "dev-1" } })));

    server.notify("other-client", "create", json!({ "device_id": "dev-2", "state": { "on": true } }));
    server.notify(
        "other-client",
        "replace",
        json!({ "device_id": "dev-1", "state": { "on": false }, "partial_state": true }),
    );

    let n = sub.next().await.unwrap();
    assert_eq!(n.subject, "dev-1");
    assert_eq!(n.action, "replace");
    assert_eq!(n.state, json!({ "on": false }));
    assert!(n.partial);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(sub.try_next().is_none());
}

#[tokio::test(start_paused = true)]
async fn own_publications_are_not_delivered() {
    let (gw, _connector, mut server) = start(config()).await;
    let device = Device::new("dev-1", "light", gw.clone());
    let (sub, _) = tokio::join!(
        device.subscribe_state(),
        server.answer_next(200, json!({ "roomId": "room-1" }))
    );
    let mut sub = sub.unwrap();

    device.publish_state(json!({ "on": true }), true).await.unwrap();
    let req = server.next_request().await.unwrap();
    assert_eq!(req.request_id, gw.publish_request_id());
    assert_eq!(req.controller, "document");
    assert_eq!(req.action, "create");
    assert_eq!(req.collection.as_deref(), Some("device-state"));
    let body = req.body.clone().unwrap();
    assert_eq!(
        body,
        json!({ "device_id": "dev-1", "device_type": "light", "partial_state": true, "state": { "on": true } })
    );

    // the server answers the publication and echoes it as a notification
    server.reply(&req, 200, json!({ "_id": "s-1", "_source": body.clone() }));
    server.notify(gw.publish_request_id(), "create", body);
    server.notify("other-client", "create", json!({ "device_id": "dev-1", "state": { "on": false } }));

    let n = sub.next().await.unwrap();
    assert_eq!(n.state, json!({ "on": false }));
    assert!(!n.partial);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(sub.try_next().is_none());
}

#[tokio::test(start_paused = true)]
async fn subscribers_share_one_server_subscription() {
    let (gw, _connector, mut server) = start(config()).await;
    let (a, _) = tokio::join!(
        gw.subscribe("iot", "device-state", "dev-1"),
        server.answer_next(200, json!({ "roomId": "room-1" }))
    );
    let mut a = a.unwrap();
    let mut b = gw.subscribe("iot", "device-state", "dev-1").await.unwrap();
    assert_ne!(a.id(), b.id());

    server.notify("other-client", "create", json!({ "device_id": "dev-1", "state": 1 }));
    assert_eq!(a.next().await.unwrap().state, json!(1));
    assert_eq!(b.next().await.unwrap().state, json!(1));

    gw.unsubscribe(a).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(server.try_next_frame().is_none(), "server subscription kept for remaining subscriber");

    gw.unsubscribe(b).await.unwrap();
    let req = server.next_request().await.unwrap();
    assert_eq!(req.controller, "realtime");
    assert_eq!(req.action, "unsubscribe");
    assert_eq!(req.body, Some(json!({ "roomId": "room-1" })));
}

#[tokio::test(start_paused = true)]
async fn rejected_subscribe_leaves_nothing_registered() {
    let (gw, _connector, mut server) = start(config()).await;
    let (res, _) = tokio::join!(
        gw.subscribe("iot", "device-state", "dev-1"),
        server.answer_next(403, Value::Null)
    );
    match res {
        Err(e) => assert_eq!(e.status(), Some(403)),
        Ok(_) => panic!("subscribe should fail"),
    }

    let (res, req) = tokio::join!(
        gw.subscribe("iot", "device-state", "dev-1"),
        server.answer_next(200, json!({ "roomId": "room-2" }))
    );
    assert!(res.is_ok());
    assert_eq!(req.action, "subscribe");
}

#[tokio::test(start_paused = true)]
async fn concurrent_subscribers_all_see_a_rejection() {
    let (gw, _connector, mut server) = start(config()).await;
    let (a, b, req) = tokio::join!(
        gw.subscribe("iot", "device-state", "dev-1"),
        gw.subscribe("iot", "device-state", "dev-1"),
        server.answer_next(403, Value::Null)
    );
    assert_eq!(req.action, "subscribe");
    assert_eq!(a.unwrap_err().status(), Some(403));
    assert_eq!(b.unwrap_err().status(), Some(403));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(server.try_next_frame().is_none(), "one server subscribe for both callers");

    let (res, req) = tokio::join!(
        gw.subscribe("iot", "device-state", "dev-1"),
        server.answer_next(200, json!({ "roomId": "room-2" }))
    );
    assert!(res.is_ok());
    assert_eq!(req.action, "subscribe");
}

#[tokio::test(start_paused = true)]
async fn concurrent_subscribers_share_an_acceptance() {
    let (gw, _connector, mut server) = start(config()).await;
    let (a, b, _) = tokio::join!(
        gw.subscribe("iot", "device-state", "dev-1"),
        gw.subscribe("iot", "device-state", "dev-1"),
        server.answer_next(200, json!({ "roomId": "room-1" }))
    );
    let (mut a, mut b) = (a.unwrap(), b.unwrap());
    server.notify("other-client", "create", json!({ "device_id": "dev-1", "state": 7 }));
    assert_eq!(a.next().await.unwrap().state, json!(7));
    assert_eq!(b.next().await.unwrap().state, json!(7));
}

#[tokio::test(start_paused = true)]
async fn same_subject_in_another_collection_subscribes_separately() {
    let (gw, _connector, mut server) = start(config()).await;
    let (states, _) = tokio::join!(
        gw.subscribe("iot", "device-state", "dev-1"),
        server.answer_next(200, json!({ "roomId": "room-1" }))
    );
    let mut states = states.unwrap();

    let (readings, req) = tokio::join!(
        gw.subscribe("other", "readings", "dev-1"),
        server.answer_next(200, json!({ "roomId": "room-2" }))
    );
    let mut readings = readings.unwrap();
    assert_eq!(req.action, "subscribe");
    assert_eq!(req.index.as_deref(), Some("other"));
    assert_eq!(req.collection.as_deref(), Some("readings"));

    server.notify_to("other", "readings", "other-client", "create", json!({ "device_id": "dev-1", "state": "r" }));
    server.notify("other-client", "create", json!({ "device_id": "dev-1", "state": "s" }));
    assert_eq!(readings.next().await.unwrap().state, json!("r"));
    assert_eq!(states.next().await.unwrap().state, json!("s"));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(readings.try_next().is_none());
    assert!(states.try_next().is_none());

    gw.unsubscribe(readings).await.unwrap();
    let req = server.next_request().await.unwrap();
    assert_eq!(req.body, Some(json!({ "roomId": "room-2" })));
}

#[tokio::test(start_paused = true)]
async fn dropped_subscription_is_released_and_not_replayed() {
    let (gw, connector, mut server) = start(config()).await;
    let mut server2 = connector.accept();
    let (sub, _) = tokio::join!(
        gw.subscribe("iot", "device-state", "dev-1"),
        server.answer_next(200, json!({ "roomId": "room-1" }))
    );
    drop(sub.unwrap());

    server.notify("other-client", "create", json!({ "device_id": "dev-1", "state": 1 }));
    let req = server.next_request().await.unwrap();
    assert_eq!(req.controller, "realtime");
    assert_eq!(req.action, "unsubscribe");
    assert_eq!(req.body, Some(json!({ "roomId": "room-1" })));
    server.reply(&req, 200, json!({ "roomId": "room-1" }));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(gw.pending_requests(), 0);

    drop(server);
    gw.wait_for_state(ConnectionState::Reconnecting).await;
    gw.wait_for_state(ConnectionState::Connected).await;
    let gw2 = gw.clone();
    let call = tokio::spawn(async move { gw2.submit(get_dev1()).await });
    let req = server2.answer_next(200, json!({ "_id": "dev-1" })).await;
    assert_eq!(req.action, "get", "nothing replayed for a dropped subscription");
    assert!(call.await.unwrap().unwrap().is_success());
}

#[tokio::test(start_paused = true)]
async fn late_create_response_is_not_a_notification() {
    let (gw, _connector, mut server) = start(config()).await;
    let (sub, _) = tokio::join!(
        gw.subscribe("iot", "device-state", "dev-1"),
        server.answer_next(200, json!({ "roomId": "room-1" }))
    );
    let mut sub = sub.unwrap();

    let body = json!({ "device_id": "dev-1", "state": { "on": true } });
    let create: Envelope = Request::Create {
        index: "iot".into(),
        collection: "device-state".into(),
        body: body.clone(),
    }
    .into();
    let gw2 = gw.clone();
    let call = tokio::spawn(async move { gw2.submit_with_deadline(create, Some(Duration::from_secs(2))).await });
    let req = server.next_request().await.unwrap();
    assert!(matches!(call.await.unwrap(), Err(GatewayError::Timeout)));

    server.reply(&req, 200, json!({ "_id": "s-1", "_source": body }));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(sub.try_next().is_none());
}

#[tokio::test(start_paused = true)]
async fn notification_ahead_of_its_reply_is_delivered() {
    let (gw, _connector, mut server) = start(config()).await;
    let (sub, _) = tokio::join!(
        gw.subscribe("iot", "device-state", "dev-1"),
        server.answer_next(200, json!({ "roomId": "room-1" }))
    );
    let mut sub = sub.unwrap();

    let body = json!({ "device_id": "dev-1", "state": 5 });
    let create: Envelope = Request::Create {
        index: "iot".into(),
        collection: "device-state".into(),
        body: body.clone(),
    }
    .into();
    let gw2 = gw.clone();
    let call = tokio::spawn(async move { gw2.request(create).await });
    let req = server.next_request().await.unwrap();

    server.notify(&req.request_id, "create", body.clone());
    assert_eq!(sub.next().await.unwrap().state, json!(5));
    assert_eq!(gw.pending_requests(), 1);

    server.reply(&req, 200, json!({ "_id": "s-1", "_source": body }));
    let res = call.await.unwrap().unwrap();
    assert_eq!(res.document_id(), Some("s-1"));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(sub.try_next().is_none());
}

#[tokio::test(start_paused = true)]
async fn subscriptions_replayed_after_reconnect() {
    let (gw, connector, mut server) = start(config()).await;
    let mut server2 = connector.accept();
    let (sub, _) = tokio::join!(
        gw.subscribe("iot", "device-state", "dev-1"),
        server.answer_next(200, json!({ "roomId": "room-1" }))
    );
    let mut sub = sub.unwrap();

    drop(server);
    let req = server2.answer_next(200, json!({ "roomId": "room-2" })).await;
    assert_eq!(req.action, "subscribe");
    assert_eq!(req.body, Some(json!({ "equals": { "device_id": "dev-1" } })));

    server2.notify("other-client", "create", json!({ "device_id": "dev-1", "state": "after" }));
    assert_eq!(sub.next().await.unwrap().state, json!("after"));

    tokio::time::sleep(Duration::from_millis(10)).await;
    gw.unsubscribe(sub).await.unwrap();
    let req = server2.next_request().await.unwrap();
    assert_eq!(req.action, "unsubscribe");
    assert_eq!(req.body, Some(json!({ "roomId": "room-2" })));
}

#[tokio::test(start_paused = true)]
async fn replay_can_be_disabled() {
    let mut cfg = config();
    cfg.resubscribe_on_reconnect = false;
    let (gw, connector, mut server) = start(cfg).await;
    let mut server2 = connector.accept();
    let (sub, _) = tokio::join!(
        gw.subscribe("iot", "device-state", "dev-1"),
        server.answer_next(200, json!({ "roomId": "room-1" }))
    );
    let _sub = sub.unwrap();

    let mut states = gw.watch_state();
    drop(server);
    wait_state(&mut states, ConnectionState::Reconnecting).await;
    wait_state(&mut states, ConnectionState::Connected).await;

    let gw2 = gw.clone();
    let call = tokio::spawn(async move { gw2.submit(get_dev1()).await });
    let req = server2.answer_next(200, json!({ "_id": "dev-1" })).await;
    assert_eq!(req.action, "get", "no subscribe replayed before the first caller request");
    assert!(call.await.unwrap().unwrap().is_success());
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_after_reconnect_without_replay_sends_nothing() {
    let mut cfg = config();
    cfg.resubscribe_on_reconnect = false;
    let (gw, connector, mut server) = start(cfg).await;
    let mut server2 = connector.accept();
    let (sub, _) = tokio::join!(
        gw.subscribe("iot", "device-state", "dev-1"),
        server.answer_next(200, json!({ "roomId": "room-1" }))
    );
    let sub = sub.unwrap();

    drop(server);
    gw.wait_for_state(ConnectionState::Reconnecting).await;
    gw.wait_for_state(ConnectionState::Connected).await;

    // room-1 belonged to the dead connection
    gw.unsubscribe(sub).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(server2.try_next_frame().is_none());
    assert_eq!(gw.pending_requests(), 0);
}

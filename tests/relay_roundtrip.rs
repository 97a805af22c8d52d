use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use osc_relay::server::{self, AppState};
use osc_relay::{HubConfig, ReceiverId};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestHub {
    addr: SocketAddr,
    state: AppState,
    _shutdown: oneshot::Sender<()>,
}

async fn spawn_hub(config: HubConfig) -> TestHub {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = AppState::new(config).await.unwrap();
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(server::serve(listener, state.clone(), async {
        let _ = rx.await;
    }));
    TestHub {
        addr,
        state,
        _shutdown: tx,
    }
}

fn quiet_config() -> HubConfig {
    HubConfig {
        destinations: Vec::new(),
        ..HubConfig::default()
    }
}

async fn connect(hub: &TestHub, path: &str) -> Ws {
    let url = format!("ws://{}{}", hub.addr, path);
    let (ws, _) = tokio_tungstenite::connect_async(url).await.expect("ws connect");
    ws
}

async fn send(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Next JSON text frame, skipping control frames
async fn next_json(ws: &mut Ws) -> Value {
    timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
                Some(Ok(Message::Close(_))) | None => panic!("socket closed while waiting for a frame"),
                Some(Ok(_)) => continue,
                Some(Err(e)) => panic!("socket error: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for a frame")
}

async fn register(hub: &TestHub, name: &str) -> (Ws, ReceiverId) {
    let mut ws = connect(hub, "/ws").await;
    send(&mut ws, json!({ "event": "register_receiver", "name": name })).await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["event"], "registration_confirmed");
    let id = reply["receiver_id"].as_str().unwrap().parse().unwrap();
    (ws, id)
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn register_confirm_and_broadcast() {
    let hub = spawn_hub(quiet_config()).await;

    let mut dashboard = connect(&hub, "/dashboard/ws").await;
    let snapshot = next_json(&mut dashboard).await;
    assert_eq!(snapshot, json!({ "event": "receiver_list_updated", "receivers": [] }));

    let (mut receiver, id) = register(&hub, "Max").await;

    let update = next_json(&mut dashboard).await;
    assert_eq!(update["event"], "receiver_list_updated");
    assert_eq!(update["receivers"][0]["id"], id.to_string());
    assert_eq!(update["receivers"][0]["name"], "Max");
    assert_eq!(update["receivers"][0]["active"], true);
    assert!(update["receivers"][0]["created_at"].is_string());

    let report = hub.state.publisher.publish("/test/1", 1.0).await.unwrap();
    assert_eq!(report.delivered, vec![id]);

    let event = next_json(&mut receiver).await;
    assert_eq!(event["event"], "osc_message");
    assert_eq!(event["address"], "/test/1");
    assert_eq!(event["value"], 1.0);
    assert!(event["timestamp"].as_f64().unwrap() > 1_600_000_000.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_transport_goes_offline() {
    let hub = spawn_hub(quiet_config()).await;
    let (receiver, r1) = register(&hub, "Max").await;
    let mut dashboard = connect(&hub, "/dashboard/ws").await;
    let _snapshot = next_json(&mut dashboard).await;

    drop(receiver);

    let update = next_json(&mut dashboard).await;
    assert_eq!(update["receivers"][0]["id"], r1.to_string());
    assert_eq!(update["receivers"][0]["active"], false);

    let report = hub.state.publisher.publish("/test/1", 1.0).await.unwrap();
    assert!(report.delivered.is_empty());

    // a fresh registration gets a new id; the old record stays offline
    let (_receiver, r2) = register(&hub, "Max").await;
    assert_ne!(r1, r2);
    let records = hub.state.hub.list_receivers();
    assert_eq!(records.len(), 2);
    assert!(!records[0].is_active());
    assert!(records[1].is_active());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn registration_errors_keep_connection_open() {
    let hub = spawn_hub(quiet_config()).await;
    let mut ws = connect(&hub, "/ws").await;

    ws.send(Message::Text("not json".into())).await.unwrap();
    assert_eq!(next_json(&mut ws).await["event"], "error");

    send(&mut ws, json!({ "event": "register_receiver", "name": "   " })).await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["event"], "registration_failed");
    assert!(hub.state.hub.is_empty());

    send(&mut ws, json!({ "event": "register_receiver", "name": "Max" })).await;
    let confirmed = next_json(&mut ws).await;
    assert_eq!(confirmed["event"], "registration_confirmed");

    // one receiver per socket
    send(&mut ws, json!({ "event": "register_receiver", "name": "Max again" })).await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["event"], "registration_failed");
    assert!(reply["error"]
        .as_str()
        .unwrap()
        .contains(confirmed["receiver_id"].as_str().unwrap()));
    assert_eq!(hub.state.hub.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unregister_marks_offline() {
    let hub = spawn_hub(quiet_config()).await;
    let (mut ws, id) = register(&hub, "Max").await;
    let (_other, other_id) = register(&hub, "Other").await;

    // only the owning connection may unregister an id
    send(&mut ws, json!({ "event": "unregister_receiver", "receiver_id": other_id.to_string() })).await;
    assert_eq!(next_json(&mut ws).await["event"], "unregistration_failed");

    send(&mut ws, json!({ "event": "unregister_receiver", "receiver_id": id.to_string() })).await;
    assert_eq!(next_json(&mut ws).await["event"], "unregistration_confirmed");

    assert!(!hub.state.hub.get(&id).unwrap().is_active());
    assert!(hub.state.hub.get(&other_id).unwrap().is_active());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn admin_disconnect_over_dashboard() {
    let hub = spawn_hub(quiet_config()).await;
    let (mut target, target_id) = register(&hub, "Target").await;
    let (_bystander, bystander_id) = register(&hub, "Bystander").await;

    let mut dashboard = connect(&hub, "/dashboard/ws").await;
    let _snapshot = next_json(&mut dashboard).await;

    send(
        &mut dashboard,
        json!({ "event": "disconnect_receiver", "receiver_id": ReceiverId::new().to_string() }),
    )
    .await;
    let ack = next_json(&mut dashboard).await;
    assert_eq!(ack["event"], "disconnect_result");
    assert_eq!(ack["success"], false);

    send(
        &mut dashboard,
        json!({ "event": "disconnect_receiver", "receiver_id": target_id.to_string() }),
    )
    .await;

    // the registry update and the ack may arrive in either order
    let mut saw_ack = false;
    let mut saw_update = false;
    while !(saw_ack && saw_update) {
        let frame = next_json(&mut dashboard).await;
        match frame["event"].as_str() {
            Some("disconnect_result") => {
                assert_eq!(frame["success"], true);
                saw_ack = true;
            }
            Some("receiver_list_updated") => {
                let target = frame["receivers"]
                    .as_array()
                    .unwrap()
                    .iter()
                    .find(|r| r["id"] == target_id.to_string())
                    .unwrap();
                assert_eq!(target["active"], false);
                saw_update = true;
            }
            other => panic!("unexpected dashboard frame {other:?}"),
        }
    }

    assert_eq!(next_json(&mut target).await["event"], "manual_disconnect");
    let closed = timeout(Duration::from_secs(5), async {
        loop {
            match target.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "target socket was not closed");

    wait_until(|| hub.state.hub.active_count() == 1).await;
    assert!(hub.state.hub.get(&bystander_id).unwrap().is_active());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn credential_checked_before_upgrade() {
    let hub = spawn_hub(HubConfig {
        api_keys: vec!["k1".into()],
        ..quiet_config()
    })
    .await;

    let err = tokio_tungstenite::connect_async(format!("ws://{}/ws", hub.addr))
        .await
        .unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 401)
        }
        other => panic!("expected HTTP 401, got {other:?}"),
    }

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws?api_key=k1", hub.addr))
        .await
        .expect("authorized connect");
    send(&mut ws, json!({ "event": "register_receiver", "name": "Max" })).await;
    assert_eq!(next_json(&mut ws).await["event"], "registration_confirmed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn send_value_over_socket_reaches_receivers() {
    let hub = spawn_hub(quiet_config()).await;
    let (mut receiver, _id) = register(&hub, "Max").await;
    let mut dashboard = connect(&hub, "/dashboard/ws").await;
    let _snapshot = next_json(&mut dashboard).await;

    send(&mut dashboard, json!({ "event": "send_value", "address": "/mass/tile4" })).await;

    let event = next_json(&mut receiver).await;
    assert_eq!(event["address"], "/mass/tile4");
    assert_eq!(event["value"], 1.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stalled_socket_write_times_out_without_hurting_others() {
    let hub = spawn_hub(HubConfig {
        send_timeout_ms: 200,
        queue_capacity: 100_000,
        ..quiet_config()
    })
    .await;

    // registers, then never reads again
    let (_stalled, stalled_id) = register(&hub, "stalled").await;
    let (mut healthy, healthy_id) = register(&hub, "healthy").await;

    let reader = tokio::spawn(async move {
        let mut seen = 0usize;
        loop {
            let frame = next_json(&mut healthy).await;
            if frame["event"] != "osc_message" {
                continue;
            }
            if frame["address"] == "/done" {
                return seen;
            }
            seen += 1;
        }
    });

    // large frames fill the stalled socket's TCP buffers quickly
    let payload: Vec<f64> = vec![0.5; 8_000];
    let mut published = 0usize;
    for _ in 0..200 {
        for _ in 0..10 {
            let report = hub
                .state
                .publisher
                .publish("/bulk", payload.clone())
                .await
                .unwrap();
            assert!(report.delivered.contains(&healthy_id));
            published += 1;
        }
        if !hub.state.hub.get(&stalled_id).unwrap().is_active() {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }

    let stalled = hub
        .state
        .admin
        .snapshot()
        .into_iter()
        .find(|r| r.id == stalled_id)
        .unwrap();
    assert!(!stalled.active, "stalled receiver never went offline");
    assert!(hub.state.hub.get(&healthy_id).unwrap().is_active());

    hub.state.publisher.publish("/done", 1.0).await.unwrap();
    let seen = timeout(Duration::from_secs(30), reader)
        .await
        .expect("healthy receiver fell behind")
        .unwrap();
    assert_eq!(seen, published);
}

use std::net::SocketAddr;
use std::time::Duration;

use osc_relay::config::BackoffConfig;
use osc_relay::osc::{OscArg, OscMessage};
use osc_relay::server::{self, AppState};
use osc_relay::{ClientConfig, ClientStatus, Destination, HubConfig, ReceiverId, RelayClient};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);

struct TestHub {
    addr: SocketAddr,
    state: AppState,
    _shutdown: oneshot::Sender<()>,
}

async fn spawn_hub(api_keys: Vec<String>) -> TestHub {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = HubConfig {
        api_keys,
        destinations: Vec::new(),
        ..HubConfig::default()
    };
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

fn client_config(hub: &TestHub, name: &str) -> ClientConfig {
    let mut config = ClientConfig::new(format!("ws://{}/ws", hub.addr), name);
    config.backoff = BackoffConfig {
        initial_delay_ms: 20,
        max_delay_ms: 200,
        multiplier: 2.0,
        jitter: 0.5,
    };
    config
}

async fn registered_id(client: &RelayClient) -> ReceiverId {
    let status = client
        .wait_for_status(WAIT, ClientStatus::is_registered)
        .await
        .expect("client did not register");
    match status {
        ClientStatus::Registered { receiver_id } => receiver_id.parse().unwrap(),
        other => panic!("unexpected status {other:?}"),
    }
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
async fn broadcast_is_forwarded_as_one_osc_packet() {
    let hub = spawn_hub(Vec::new()).await;
    let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let device_port = device.local_addr().unwrap().port();

    let config =
        client_config(&hub, "Max").with_local_forward(Destination::new("127.0.0.1", device_port));
    let client = RelayClient::connect(config).await.unwrap();
    let id = registered_id(&client).await;
    assert!(hub.state.hub.get(&id).unwrap().is_active());

    hub.state.publisher.publish("/test/1", 1.0).await.unwrap();

    let mut buf = [0u8; 512];
    let (len, _) = timeout(WAIT, device.recv_from(&mut buf))
        .await
        .expect("no packet forwarded")
        .unwrap();
    let mut expected = b"/test/1\0,f\0\0".to_vec();
    expected.extend_from_slice(&1.0f32.to_be_bytes());
    assert_eq!(&buf[..len], expected.as_slice());

    let msg = OscMessage::decode(&buf[..len]).unwrap();
    assert_eq!(msg.address, "/test/1");
    assert_eq!(msg.args, vec![OscArg::Float(1.0)]);

    // exactly one packet
    assert!(timeout(Duration::from_millis(200), device.recv_from(&mut buf))
        .await
        .is_err());
    assert_eq!(client.stats().received(), 1);
    assert_eq!(client.stats().forwarded(), 1);

    client.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forward_failure_does_not_interrupt_subscription() {
    let hub = spawn_hub(Vec::new()).await;
    // sending to the broadcast address without SO_BROADCAST fails every time
    let config = client_config(&hub, "Max")
        .with_local_forward(Destination::new("255.255.255.255", 9));
    let client = RelayClient::connect(config).await.unwrap();
    let _id = registered_id(&client).await;
    let mut events = client.events();

    for i in 0..3 {
        hub.state
            .publisher
            .publish(&format!("/tile/{i}"), i)
            .await
            .unwrap();
    }
    for i in 0..3 {
        let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert_eq!(event.address, format!("/tile/{i}"));
    }
    assert!(client.status().is_registered());
    assert_eq!(client.stats().received(), 3);
    assert_eq!(client.stats().forwarded(), 0);
    assert_eq!(client.stats().forward_failures(), 3);

    client.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnect_after_drop_gets_new_id() {
    let hub = spawn_hub(Vec::new()).await;
    let client = RelayClient::connect(client_config(&hub, "Max")).await.unwrap();
    let r1 = registered_id(&client).await;

    // hub detects transport loss and tears the connection down
    assert!(hub.state.hub.handle_disconnect(&r1));

    let status = client
        .wait_for_status(WAIT, |s| {
            matches!(s, ClientStatus::Registered { receiver_id } if *receiver_id != r1.to_string())
        })
        .await
        .expect("client did not re-register");
    let r2: ReceiverId = match status {
        ClientStatus::Registered { receiver_id } => receiver_id.parse().unwrap(),
        _ => unreachable!(),
    };

    assert_ne!(r1, r2);
    assert!(!hub.state.hub.get(&r1).unwrap().is_active());
    assert!(hub.state.hub.get(&r2).unwrap().is_active());
    assert_eq!(hub.state.hub.len(), 2);
    assert_eq!(client.stats().registrations(), 2);

    client.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn graceful_stop_unregisters() {
    let hub = spawn_hub(Vec::new()).await;
    let client = RelayClient::connect(client_config(&hub, "Max")).await.unwrap();
    let id = registered_id(&client).await;

    let mut status = client.watch_status();
    client.stop().await;
    assert_eq!(*status.borrow_and_update(), ClientStatus::Stopped);

    wait_until(|| !hub.state.hub.get(&id).unwrap().is_active()).await;
    assert_eq!(hub.state.hub.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manual_disconnect_stops_for_good() {
    let hub = spawn_hub(Vec::new()).await;
    let client = RelayClient::connect(client_config(&hub, "Max")).await.unwrap();
    let id = registered_id(&client).await;

    let ack = hub.state.admin.disconnect(&id.to_string());
    assert!(ack.success);

    let status = client
        .wait_for_status(WAIT, |s| *s == ClientStatus::ManuallyDisconnected)
        .await;
    assert_eq!(status, Some(ClientStatus::ManuallyDisconnected));

    // no reconnect attempt follows
    sleep(Duration::from_millis(300)).await;
    assert_eq!(client.stats().registrations(), 1);
    assert_eq!(hub.state.hub.len(), 1);
    assert_eq!(hub.state.hub.active_count(), 0);

    client.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_credential_keeps_retrying() {
    let hub = spawn_hub(vec!["k1".into()]).await;

    let client = RelayClient::connect(client_config(&hub, "Max")).await.unwrap();
    let status = client
        .wait_for_status(WAIT, |s| {
            matches!(s, ClientStatus::Reconnecting { attempt, .. } if *attempt >= 3)
        })
        .await;
    assert!(status.is_some());
    assert_eq!(client.stats().registrations(), 0);
    assert!(hub.state.hub.is_empty());
    client.stop().await;

    let client = RelayClient::connect(client_config(&hub, "Max").with_api_key("k1"))
        .await
        .unwrap();
    let id = registered_id(&client).await;
    assert!(hub.state.hub.get(&id).unwrap().is_active());
    client.stop().await;
}

//! End-to-end bridge behaviour against the in-process datastore double.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use kvbridge_core::wire::Notification;
use kvbridge_core::{BridgeError, VersionedValue};
use kvbridge_ipc::testing::MockDatastore;
use kvbridge_ipc::{
    BridgeEvent, BridgeOptions, ConnectionState, DatastoreBridge, Listener, TransportConfig,
};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};

const WAIT: Duration = Duration::from_secs(5);

fn options(request_timeout_ms: u64, max_attempts: u32) -> BridgeOptions {
    BridgeOptions {
        request_timeout: Duration::from_millis(request_timeout_ms),
        transport: TransportConfig {
            reconnect_delay: Duration::from_millis(20),
            max_reconnect_attempts: max_attempts,
            idle_timeout: None,
            ..TransportConfig::default()
        },
    }
}

async fn connected(mock: &MockDatastore, options: BridgeOptions) -> DatastoreBridge {
    let bridge = DatastoreBridge::new(mock.connector(), options);
    bridge.connect().await.unwrap();
    bridge
}

async fn wait_for(
    events: &mut broadcast::Receiver<BridgeEvent>,
    pred: impl Fn(&BridgeEvent) -> bool,
) -> BridgeEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not observed in time")
}

async fn eventually(check: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn keys(list: &[&str]) -> Vec<String> {
    list.iter().map(|k| (*k).to_string()).collect()
}

fn channel_listener() -> (Listener, mpsc::UnboundedReceiver<VersionedValue>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener = Listener::new(move |value: &VersionedValue| {
        let _ = tx.send(value.clone());
    });
    (listener, rx)
}

#[tokio::test]
async fn concurrent_reads_each_get_their_own_value() {
    let mock = MockDatastore::start().await.unwrap();
    for i in 0..20 {
        mock.set(&format!("key{i}"), json!(i));
    }
    let bridge = connected(&mock, options(2000, 3)).await;

    let calls: Vec<_> = (0..20)
        .map(|i| {
            let bridge = bridge.clone();
            tokio::spawn(async move { (i, bridge.read(&format!("key{i}")).await) })
        })
        .collect();

    for call in calls {
        let (i, result) = call.await.unwrap();
        let value = result.unwrap();
        assert_eq!(value.key, format!("key{i}"));
        assert_eq!(value.value, json!(i));
    }
    assert_eq!(bridge.pending_requests(), 0);
}

#[tokio::test]
async fn missing_key_is_a_remote_error() {
    let mock = MockDatastore::start().await.unwrap();
    let bridge = connected(&mock, options(2000, 3)).await;
    let err = bridge.read("nope").await.unwrap_err();
    assert_eq!(err, BridgeError::Remote("Key 'nope' not found".into()));
}

#[tokio::test]
async fn write_bumps_version() {
    let mock = MockDatastore::start().await.unwrap();
    mock.set("speed", json!(1.0));
    let bridge = connected(&mock, options(2000, 3)).await;

    let ack = bridge.write("speed", json!(2.5)).await.unwrap();
    assert!(ack.success);
    assert_eq!(ack.version, 2);
    assert_eq!(bridge.read("speed").await.unwrap().value, json!(2.5));
}

#[tokio::test]
async fn duplicate_listener_is_invoked_once() {
    let mock = MockDatastore::start().await.unwrap();
    mock.set("x", json!(0));
    let bridge = connected(&mock, options(2000, 3)).await;
    let (listener, mut rx) = channel_listener();

    bridge.subscribe(&keys(&["x"]), &listener).await.unwrap();
    bridge.subscribe(&keys(&["x"]), &listener.clone()).await.unwrap();
    assert_eq!(mock.notify("x", json!(1)), 1);

    let first = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.version, 2);
    assert!(
        tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn only_the_last_listener_unsubscribes_upstream() {
    let mock = MockDatastore::start().await.unwrap();
    let bridge = connected(&mock, options(2000, 3)).await;
    let (a, _ra) = channel_listener();
    let (b, _rb) = channel_listener();
    let key = keys(&["k"]);

    bridge.subscribe(&key, &a).await.unwrap();
    bridge.subscribe(&key, &b).await.unwrap();

    bridge.unsubscribe(&key, Some(&a)).await.unwrap();
    assert!(mock.requests_for("unsubscribe").is_empty());
    assert_eq!(bridge.subscribed_keys(), key);

    bridge.unsubscribe(&key, Some(&b)).await.unwrap();
    let sent = mock.requests_for("unsubscribe");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["keys"], json!(["k"]));
    assert!(bridge.subscribed_keys().is_empty());
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let mock = MockDatastore::start().await.unwrap();
    mock.set("k", json!(1));
    mock.set_silent(true);
    let bridge = connected(&mock, options(100, 3)).await;

    let err = bridge.read("k").await.unwrap_err();
    assert_eq!(err, BridgeError::Timeout { timeout_ms: 100 });
    assert_eq!(bridge.pending_requests(), 0);
    assert!(bridge.is_connected());
}

#[tokio::test]
async fn disconnect_rejects_pending_requests() {
    let mock = MockDatastore::start().await.unwrap();
    mock.set("k", json!(1));
    mock.set_silent(true);
    let bridge = connected(&mock, options(10_000, 3)).await;

    let calls: Vec<_> = (0..3)
        .map(|_| {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.read("k").await })
        })
        .collect();
    eventually(|| bridge.pending_requests() == 3).await;

    mock.drop_connections();
    for call in calls {
        assert_eq!(call.await.unwrap().unwrap_err(), BridgeError::ConnectionClosed);
    }
    assert_eq!(bridge.pending_requests(), 0);
}

#[tokio::test]
async fn reconnect_restores_subscriptions() {
    let mock = MockDatastore::start().await.unwrap();
    mock.set("pose", json!([0, 0, 0]));
    let bridge = connected(&mock, options(2000, 5)).await;
    let mut events = bridge.events();
    let (listener, mut rx) = channel_listener();
    bridge.subscribe(&keys(&["pose"]), &listener).await.unwrap();

    mock.drop_connections();
    let _ = wait_for(&mut events, |e| matches!(e, BridgeEvent::Disconnected)).await;
    let _ = wait_for(&mut events, |e| matches!(e, BridgeEvent::Reconnecting { attempt: 1 })).await;
    let _ = wait_for(&mut events, |e| matches!(e, BridgeEvent::Connected)).await;
    eventually(|| mock.requests_for("subscribe").len() == 2).await;

    eventually(|| mock.notify("pose", json!([1, 2, 3])) == 1).await;
    let value = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(value.value, json!([1, 2, 3]));
    assert_eq!(bridge.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn reconnection_gives_up_after_max_attempts() {
    let mock = MockDatastore::start().await.unwrap();
    let bridge = connected(&mock, options(2000, 3)).await;
    let mut events = bridge.events();

    mock.shutdown();
    let _ = wait_for(&mut events, |e| {
        matches!(e, BridgeEvent::MaxReconnectAttemptsReached)
    })
    .await;
    assert_eq!(bridge.state(), ConnectionState::ExhaustedRetries);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut extra = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, BridgeEvent::MaxReconnectAttemptsReached | BridgeEvent::Reconnecting { .. }) {
            extra += 1;
        }
    }
    assert_eq!(extra, 0);
    assert_matches!(bridge.read("k").await, Err(BridgeError::NotConnected));
}

#[tokio::test]
async fn panicking_listener_does_not_starve_others() {
    let mock = MockDatastore::start().await.unwrap();
    mock.set("x", json!(0));
    let bridge = connected(&mock, options(2000, 3)).await;

    let faulty = Listener::new(|_| panic!("listener bug"));
    let (healthy, mut rx) = channel_listener();
    bridge.subscribe(&keys(&["x"]), &faulty).await.unwrap();
    bridge.subscribe(&keys(&["x"]), &healthy).await.unwrap();

    let _ = mock.notify("x", json!(5));
    let value = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(value.value, json!(5));
}

#[tokio::test]
async fn value_changed_is_raised_once_per_notification() {
    let mock = MockDatastore::start().await.unwrap();
    mock.set("x", json!(0));
    let bridge = connected(&mock, options(2000, 3)).await;
    let mut events = bridge.events();
    let (a, _ra) = channel_listener();
    let (b, _rb) = channel_listener();
    bridge.subscribe(&keys(&["x"]), &a).await.unwrap();
    bridge.subscribe(&keys(&["x"]), &b).await.unwrap();

    let _ = mock.notify("x", json!(1));
    let _ = wait_for(&mut events, |e| matches!(e, BridgeEvent::ValueChanged { .. })).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut extra = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, BridgeEvent::ValueChanged { .. }) {
            extra += 1;
        }
    }
    assert_eq!(extra, 0);
}

#[tokio::test]
async fn raw_notification_listener_sees_every_frame() {
    let mock = MockDatastore::start().await.unwrap();
    mock.set("a", json!(0));
    mock.set("b", json!(0));
    let bridge = connected(&mock, options(2000, 3)).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = bridge.add_notification_listener(Arc::new(move |n: &Notification| {
        let _ = tx.send(n.key.clone());
    }));
    bridge
        .subscribe(&keys(&["a", "b"]), &Listener::new(|_| {}))
        .await
        .unwrap();

    let _ = mock.notify("a", json!(1));
    let _ = mock.notify("b", json!(1));
    assert_eq!(rx.recv().await.as_deref(), Some("a"));
    assert_eq!(rx.recv().await.as_deref(), Some("b"));
    assert!(bridge.remove_notification_listener(handle));
}

#[tokio::test]
async fn manual_disconnect_clears_subscriptions() {
    let mock = MockDatastore::start().await.unwrap();
    let bridge = connected(&mock, options(2000, 3)).await;
    let counter = Arc::new(AtomicUsize::new(0));
    let c = counter.clone();
    let listener = Listener::new(move |_| {
        let _ = c.fetch_add(1, Ordering::SeqCst);
    });
    bridge.subscribe(&keys(&["k"]), &listener).await.unwrap();

    bridge.disconnect().await;
    assert!(bridge.subscribed_keys().is_empty());
    assert_eq!(bridge.state(), ConnectionState::Disconnected);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(bridge.state(), ConnectionState::Disconnected);
}

#[cfg(unix)]
#[tokio::test]
async fn unix_socket_endpoint() {
    use kvbridge_ipc::UnixConnector;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("datastore.sock");
    let listener = tokio::net::UnixListener::bind(&path).unwrap();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut stream = BufReader::new(stream);
        let mut line = String::new();
        let _ = stream.read_line(&mut line).await.unwrap();
        let request: serde_json::Value = serde_json::from_str(&line).unwrap();
        let reply = json!({
            "request_id": request["request_id"],
            "data": {"value": true, "version": 4, "timestamp": "2024-05-01T12:00:00Z"}
        });
        let mut frame = serde_json::to_vec(&reply).unwrap();
        frame.push(b'\n');
        stream.get_mut().write_all(&frame).await.unwrap();
        stream
    });

    let bridge = DatastoreBridge::new(Arc::new(UnixConnector::new(&path)), options(2000, 1));
    bridge.connect().await.unwrap();
    let value = bridge.read("enabled").await.unwrap();
    assert_eq!(value.value, json!(true));
    assert_eq!(value.version, 4);
    let _stream = server.await.unwrap();
}

#[tokio::test]
async fn connect_failure_is_reported_and_retried() {
    let mock = MockDatastore::start().await.unwrap();
    let addr = mock.addr();
    drop(mock);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let bridge = DatastoreBridge::new(
        Arc::new(kvbridge_ipc::TcpConnector::new(addr.to_string())),
        options(2000, 2),
    );
    let mut events = bridge.events();
    assert_matches!(bridge.connect().await, Err(BridgeError::Connection(_)));
    let _ = wait_for(&mut events, |e| matches!(e, BridgeEvent::Reconnecting { attempt: 1 })).await;
    let _ = wait_for(&mut events, |e| matches!(e, BridgeEvent::MaxReconnectAttemptsReached)).await;
}

#[tokio::test]
async fn notification_without_timestamp_offset_reaches_listeners() {
    let mock = MockDatastore::start().await.unwrap();
    mock.set("pose", json!([0.0, 0.0, 0.0]));
    let bridge = connected(&mock, options(2000, 3)).await;
    let mut events = bridge.events();
    let (listener, mut rx) = channel_listener();
    bridge.subscribe(&keys(&["pose"]), &listener).await.unwrap();

    mock.push_raw(
        &json!({
            "type": "notification",
            "data": {"key": "pose", "value": [1.0, 2.0, 3.0], "version": 4,
                     "timestamp": "2024-01-01T00:00:00.123"}
        })
        .to_string(),
    );

    let value = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(value.version, 4);
    assert_eq!(value.timestamp.timestamp_millis(), 1_704_067_200_123);
    let event = wait_for(&mut events, |e| matches!(e, BridgeEvent::ValueChanged { .. })).await;
    assert_matches!(event, BridgeEvent::ValueChanged { key, .. } if key == "pose");
}

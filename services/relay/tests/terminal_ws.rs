//! Terminal WebSocket bridge, end to end against an in-memory shell.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cloudterm_provision::{Launcher, MockProvider, PollPolicy, StaticProviderFactory};
use cloudterm_relay::{
    api,
    bridge::{mock::MockConnector, BridgeConfig, SessionManager, WindowSize},
    state::AppState,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct RelayFixture {
    ws_url: String,
    connector: Arc<MockConnector>,
    sessions: SessionManager,
}

async fn start_relay(connector: MockConnector) -> RelayFixture {
    let connector = Arc::new(connector);
    let sessions = SessionManager::new(
        connector.clone(),
        BridgeConfig {
            teardown_grace: Duration::from_secs(1),
            ..BridgeConfig::default()
        },
    );
    let launcher = Launcher::new(
        Arc::new(StaticProviderFactory::new(Arc::new(MockProvider::new()))),
        PollPolicy::default(),
    );

    let app = api::create_router(AppState::new(sessions.clone(), launcher));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    RelayFixture {
        ws_url: format!("ws://{addr}/v1/terminal"),
        connector,
        sessions,
    }
}

async fn connect(fixture: &RelayFixture) -> Client {
    let (client, _) = connect_async(fixture.ws_url.as_str()).await.unwrap();
    client
}

async fn send_json(client: &mut Client, value: Value) {
    client
        .send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

/// Next text or binary frame; `None` once the relay has closed the socket.
async fn next_frame(client: &mut Client) -> Option<Message> {
    loop {
        let message = tokio::time::timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for relay");
        match message {
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(message)) => return Some(message),
        }
    }
}

async fn next_json(client: &mut Client) -> Value {
    match next_frame(client).await {
        Some(Message::Text(text)) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("expected a text frame, got {other:?}"),
    }
}

async fn expect_status(client: &mut Client, status: &str) {
    assert_eq!(
        next_json(client).await,
        json!({ "type": "status", "status": status })
    );
}

fn start_message(password: &str) -> Value {
    json!({
        "type": "start",
        "host": "203.0.113.9",
        "username": "root",
        "password": password,
        "cols": 100,
        "rows": 30
    })
}

#[tokio::test]
async fn shell_output_and_input_are_relayed() {
    let fixture = start_relay(MockConnector::new()).await;
    let mut client = connect(&fixture).await;

    send_json(&mut client, start_message("pw")).await;
    expect_status(&mut client, "connecting").await;
    expect_status(&mut client, "connected").await;

    let mut remote = fixture.connector.next_remote().await.unwrap();
    assert_eq!(remote.target.host, "203.0.113.9");
    assert_eq!(remote.target.port, 22);
    assert_eq!(remote.target.window, WindowSize { cols: 100, rows: 30 });

    remote.send_output("Welcome to Ubuntu\r\n");
    remote.send_output(vec![0x1b, b'[', b'3', b'2', b'm']);
    assert_eq!(
        next_frame(&mut client).await,
        Some(Message::Binary(Bytes::from_static(b"Welcome to Ubuntu\r\n")))
    );
    assert_eq!(
        next_frame(&mut client).await,
        Some(Message::Binary(Bytes::from_static(b"\x1b[32m")))
    );

    client
        .send(Message::Binary(Bytes::from_static(b"ls\n")))
        .await
        .unwrap();
    send_json(&mut client, json!({ "type": "input", "data": "pwd\n" })).await;

    assert_eq!(remote.recv_input().await.unwrap(), Bytes::from_static(b"ls\n"));
    assert_eq!(remote.recv_input().await.unwrap(), Bytes::from_static(b"pwd\n"));

    send_json(&mut client, json!({ "type": "resize", "cols": 160, "rows": 48 })).await;
    assert_eq!(
        remote.recv_resize().await,
        Some(WindowSize { cols: 160, rows: 48 })
    );
}

#[tokio::test]
async fn wrong_password_reports_one_error_then_closes() {
    let fixture = start_relay(MockConnector::new().with_password("correct")).await;
    let mut client = connect(&fixture).await;

    send_json(&mut client, start_message("wrong")).await;
    expect_status(&mut client, "connecting").await;

    let error = next_json(&mut client).await;
    assert_eq!(error["type"], "error");
    assert!(error["message"]
        .as_str()
        .unwrap()
        .contains("authentication failed"));

    expect_status(&mut client, "errored").await;
    assert_eq!(next_frame(&mut client).await, None);
}

#[tokio::test]
async fn start_without_credentials_is_rejected() {
    let fixture = start_relay(MockConnector::new()).await;
    let mut client = connect(&fixture).await;

    send_json(
        &mut client,
        json!({ "type": "start", "host": "203.0.113.9", "username": "root" }),
    )
    .await;

    let error = next_json(&mut client).await;
    assert_eq!(error["type"], "error");
    assert!(error["message"]
        .as_str()
        .unwrap()
        .contains("password or private key"));
    expect_status(&mut client, "errored").await;
    assert_eq!(next_frame(&mut client).await, None);
    assert!(fixture.connector.attempts().is_empty());
}

#[tokio::test]
async fn malformed_messages_do_not_end_the_session() {
    let fixture = start_relay(MockConnector::new()).await;
    let mut client = connect(&fixture).await;

    // Input before a session exists is dropped.
    client
        .send(Message::Binary(Bytes::from_static(b"too early")))
        .await
        .unwrap();

    send_json(&mut client, start_message("pw")).await;
    expect_status(&mut client, "connecting").await;
    expect_status(&mut client, "connected").await;
    let mut remote = fixture.connector.next_remote().await.unwrap();

    send_json(&mut client, json!({ "type": "resize", "cols": "wide", "rows": 40 })).await;
    send_json(&mut client, json!({ "type": "resize", "cols": 0, "rows": 40 })).await;
    client
        .send(Message::Text("{not json".into()))
        .await
        .unwrap();
    send_json(&mut client, json!({ "type": "input", "data": "echo ok\n" })).await;

    assert_eq!(
        remote.recv_input().await.unwrap(),
        Bytes::from_static(b"echo ok\n")
    );
    assert!(remote.drain_input().is_empty());
}

#[tokio::test]
async fn disconnect_message_ends_session() {
    let fixture = start_relay(MockConnector::new()).await;
    let mut client = connect(&fixture).await;

    send_json(&mut client, start_message("pw")).await;
    expect_status(&mut client, "connecting").await;
    expect_status(&mut client, "connected").await;
    let mut remote = fixture.connector.next_remote().await.unwrap();

    send_json(&mut client, json!({ "type": "disconnect" })).await;
    expect_status(&mut client, "disconnected").await;
    assert_eq!(next_frame(&mut client).await, None);

    tokio::time::timeout(RECV_TIMEOUT, remote.closed())
        .await
        .expect("transport not torn down");
}

#[tokio::test]
async fn disconnect_during_output_flood_is_prompt() {
    let fixture = start_relay(MockConnector::new()).await;
    let mut client = connect(&fixture).await;

    send_json(&mut client, start_message("pw")).await;
    expect_status(&mut client, "connecting").await;
    expect_status(&mut client, "connected").await;
    let mut remote = fixture.connector.next_remote().await.unwrap();

    for i in 0..1000 {
        remote.send_output(format!("y {i}\n"));
    }
    let started = std::time::Instant::now();
    send_json(&mut client, json!({ "type": "disconnect" })).await;

    // Output may still be in flight ahead of the final status.
    let status = loop {
        match next_frame(&mut client).await {
            Some(Message::Binary(_)) => continue,
            Some(Message::Text(text)) => break serde_json::from_str::<Value>(text.as_str()).unwrap(),
            other => panic!("expected the final status, got {other:?}"),
        }
    };
    assert_eq!(status, json!({ "type": "status", "status": "disconnected" }));
    assert_eq!(next_frame(&mut client).await, None);

    tokio::time::timeout(RECV_TIMEOUT, remote.closed())
        .await
        .expect("transport not torn down");
    // Well under the fixture's one second teardown grace.
    assert!(started.elapsed() < Duration::from_millis(900));
}

#[tokio::test]
async fn closing_the_socket_tears_down_the_transport() {
    let fixture = start_relay(MockConnector::new()).await;
    let mut client = connect(&fixture).await;

    send_json(&mut client, start_message("pw")).await;
    expect_status(&mut client, "connecting").await;
    expect_status(&mut client, "connected").await;
    let mut remote = fixture.connector.next_remote().await.unwrap();
    assert_eq!(fixture.sessions.session_count().await, 1);

    client.close(None).await.unwrap();

    tokio::time::timeout(RECV_TIMEOUT, remote.closed())
        .await
        .expect("transport not torn down");
    tokio::time::timeout(RECV_TIMEOUT, async {
        while fixture.sessions.session_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session not removed from registry");
}

#[tokio::test]
async fn remote_hang_up_closes_the_socket() {
    let fixture = start_relay(MockConnector::new()).await;
    let mut client = connect(&fixture).await;

    send_json(&mut client, start_message("pw")).await;
    expect_status(&mut client, "connecting").await;
    expect_status(&mut client, "connected").await;

    let remote = fixture.connector.next_remote().await.unwrap();
    remote.send_output("logout\r\n");
    remote.hang_up();

    assert_eq!(
        next_frame(&mut client).await,
        Some(Message::Binary(Bytes::from_static(b"logout\r\n")))
    );
    expect_status(&mut client, "disconnected").await;
    assert_eq!(next_frame(&mut client).await, None);
}

#[tokio::test]
async fn second_start_replaces_the_session() {
    let fixture = start_relay(MockConnector::new()).await;
    let mut client = connect(&fixture).await;

    send_json(&mut client, start_message("pw")).await;
    expect_status(&mut client, "connecting").await;
    expect_status(&mut client, "connected").await;
    let first = fixture.connector.next_remote().await.unwrap();

    send_json(
        &mut client,
        json!({ "type": "start", "host": "198.51.100.2", "username": "dev", "password": "pw" }),
    )
    .await;

    // Only the new session's events reach the client.
    expect_status(&mut client, "connecting").await;
    expect_status(&mut client, "connected").await;
    assert!(first.is_closed());

    let mut second = fixture.connector.next_remote().await.unwrap();
    assert_eq!(second.target.host, "198.51.100.2");

    send_json(&mut client, json!({ "type": "input", "data": "whoami\n" })).await;
    assert_eq!(
        second.recv_input().await.unwrap(),
        Bytes::from_static(b"whoami\n")
    );
    assert_eq!(fixture.sessions.session_count().await, 1);
}

#[tokio::test]
async fn health_endpoints_respond() {
    let fixture = start_relay(MockConnector::new()).await;
    let base = fixture
        .ws_url
        .replace("ws://", "http://")
        .replace("/v1/terminal", "");

    let health: Value = reqwest::get(format!("{base}/healthz"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["active_sessions"], 0);

    let live = reqwest::get(format!("{base}/livez")).await.unwrap();
    assert_eq!(live.status(), reqwest::StatusCode::OK);
}

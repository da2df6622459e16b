//! Terminal WebSocket endpoint.
//!
//! Provides:
//! - GET /v1/terminal (WebSocket session bridge)
//!
//! Each socket is one client channel. The client sends a `start` message to
//! open a shell, then input and resizes; the relay sends status and error
//! messages as text frames and shell output as binary frames. The socket is
//! closed after a terminal status.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use bytes::Bytes;
use cloudterm_id::ChannelId;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bridge::{BridgeError, BridgeEvent, SessionManager, SessionStatus, WindowSize};
use crate::protocol::{parse_client_message, ClientMessage, ServerMessage, StartMessage};
use crate::state::AppState;

type ClientSink = SplitSink<WebSocket, Message>;

enum Flow {
    Continue,
    Close,
}

pub(super) async fn connect_terminal(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_terminal_socket(socket, state.sessions().clone()))
}

async fn handle_terminal_socket(socket: WebSocket, sessions: SessionManager) {
    let channel = ChannelId::new();
    info!(channel_id = %channel, "Terminal client connected");

    let (mut sender, mut receiver) = socket.split();
    // Events of the current session. Replaced on every start, so a replaced
    // session's events are never forwarded.
    let mut events: Option<mpsc::Receiver<BridgeEvent>> = None;

    loop {
        tokio::select! {
            event = next_event(&mut events) => match event {
                Some(event) => {
                    if let Flow::Close = forward_event(&mut sender, event).await {
                        break;
                    }
                }
                None => events = None,
            },
            message = receiver.next() => {
                let flow = match message {
                    Some(Ok(Message::Text(text))) => {
                        handle_text(&sessions, channel, &mut sender, &mut events, text.as_str()).await
                    }
                    Some(Ok(Message::Binary(data))) => {
                        write_input(&sessions, channel, data).await;
                        Flow::Continue
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => Flow::Continue,
                    Some(Ok(Message::Close(_))) | None => Flow::Close,
                    Some(Err(e)) => {
                        warn!(error = %e, channel_id = %channel, "WebSocket error");
                        Flow::Close
                    }
                };
                if let Flow::Close = flow {
                    break;
                }
            }
        }
    }

    // Nobody reads events past this point; a full channel must not hold up
    // the teardown.
    drop(events);
    sessions.close(&channel).await;
    let _ = sender.close().await;
    info!(channel_id = %channel, "Terminal client disconnected");
}

async fn next_event(events: &mut Option<mpsc::Receiver<BridgeEvent>>) -> Option<BridgeEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn forward_event(sender: &mut ClientSink, event: BridgeEvent) -> Flow {
    let (message, terminal) = match event {
        BridgeEvent::Output(data) => (Message::Binary(data), false),
        BridgeEvent::Status(status) => (
            Message::Text(ServerMessage::Status { status }.to_json().into()),
            status.is_terminal(),
        ),
        BridgeEvent::Error(message) => (
            Message::Text(ServerMessage::Error { message }.to_json().into()),
            false,
        ),
    };

    if sender.send(message).await.is_err() || terminal {
        Flow::Close
    } else {
        Flow::Continue
    }
}

async fn handle_text(
    sessions: &SessionManager,
    channel: ChannelId,
    sender: &mut ClientSink,
    events: &mut Option<mpsc::Receiver<BridgeEvent>>,
    text: &str,
) -> Flow {
    let message = match parse_client_message(text) {
        Ok(message) => message,
        Err(violation) => {
            warn!(channel_id = %channel, error = %violation, "Dropping malformed client message");
            return Flow::Continue;
        }
    };

    match message {
        ClientMessage::Start(start) => {
            // The replaced session's events are stale from here on.
            *events = None;
            open_session(sessions, channel, sender, events, start).await
        }
        ClientMessage::Input { data } => {
            write_input(sessions, channel, Bytes::from(data)).await;
            Flow::Continue
        }
        ClientMessage::Resize { cols, rows } => {
            if let Some(size) = WindowSize::new(cols, rows) {
                if let Err(BridgeError::NotConnected) = sessions.resize(&channel, size).await {
                    debug!(channel_id = %channel, "Ignoring resize before connected");
                }
            }
            Flow::Continue
        }
        ClientMessage::Disconnect => {
            *events = None;
            sessions.close(&channel).await;
            let _ = send_status(sender, SessionStatus::Disconnected).await;
            Flow::Close
        }
    }
}

async fn open_session(
    sessions: &SessionManager,
    channel: ChannelId,
    sender: &mut ClientSink,
    events: &mut Option<mpsc::Receiver<BridgeEvent>>,
    start: StartMessage,
) -> Flow {
    match sessions.open(channel, start.into()).await {
        Ok(session) => {
            debug!(
                channel_id = %channel,
                session_id = %session.session_id,
                "Session opened"
            );
            *events = Some(session.events);
            Flow::Continue
        }
        Err(error) => {
            warn!(channel_id = %channel, error = %error, "Rejected session request");
            let _ = send_error(sender, error.to_string()).await;
            let _ = send_status(sender, SessionStatus::Errored).await;
            Flow::Close
        }
    }
}

async fn write_input(sessions: &SessionManager, channel: ChannelId, data: Bytes) {
    if let Err(error) = sessions.write(&channel, data).await {
        debug!(channel_id = %channel, error = %error, "Dropping input");
    }
}

async fn send_status(sender: &mut ClientSink, status: SessionStatus) -> Result<(), axum::Error> {
    sender
        .send(Message::Text(ServerMessage::Status { status }.to_json().into()))
        .await
}

async fn send_error(sender: &mut ClientSink, message: String) -> Result<(), axum::Error> {
    sender
        .send(Message::Text(ServerMessage::Error { message }.to_json().into()))
        .await
}

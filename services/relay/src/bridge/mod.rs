//! Session bridge.
//!
//! Relays an interactive remote shell to one client channel. Each session
//! moves through:
//!
//! ```text
//! connecting --(shell ready)--> connected --(shell or client closed)--> disconnected
//!     |                             |
//!     '--(transport error)----------'--> errored
//! ```
//!
//! [`SessionManager`] owns the channel → session registry. There is at most
//! one session per channel; opening a second one on the same channel tears
//! the first down before the new one is registered.
//!
//! Every session is driven by its own task, which is the only owner of the
//! shell transport. Client input, resizes, and close requests reach the task
//! over a command channel; shell output, status changes, and errors leave it
//! as [`BridgeEvent`]s on a bounded per-session channel.

pub mod mock;
mod session;
pub mod transport;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cloudterm_id::{ChannelId, SessionId};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use session::{Registry, SessionCommand, SessionTask};

pub use transport::{
    Credentials, SessionTarget, ShellChannel, ShellConnector, TransportError, WindowSize,
    DEFAULT_SSH_PORT,
};

/// Lifecycle of one session as seen by its client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Connecting,
    Connected,
    Disconnected,
    Errored,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Disconnected | SessionStatus::Errored)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Connecting => "connecting",
            SessionStatus::Connected => "connected",
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Errored => "errored",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event delivered from a session to its client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    Status(SessionStatus),
    /// Raw shell output, exactly as the transport produced it.
    Output(Bytes),
    /// Human-readable transport failure. Sent at most once per session.
    Error(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("no connected session on this channel")]
    NotConnected,

    #[error("invalid session request: {0}")]
    InvalidRequest(String),
}

/// Parameters of an open request as they arrive from the client.
///
/// Not `Debug`: it carries secrets until resolved into a [`SessionTarget`].
#[derive(Clone, Default)]
pub struct OpenRequest {
    pub host: String,
    pub port: Option<u16>,
    pub username: String,
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub passphrase: Option<String>,
    pub window: Option<WindowSize>,
}

impl OpenRequest {
    /// Resolve into a connect target. A private key wins over a password;
    /// a request carrying neither is rejected.
    pub fn into_target(self, default_port: u16) -> Result<SessionTarget, BridgeError> {
        let host = self.host.trim().to_string();
        if host.is_empty() {
            return Err(BridgeError::InvalidRequest("host is required".to_string()));
        }
        if self.username.is_empty() {
            return Err(BridgeError::InvalidRequest(
                "username is required".to_string(),
            ));
        }

        let credentials = Credentials::from_parts(self.password, self.private_key, self.passphrase)
            .ok_or_else(|| {
                BridgeError::InvalidRequest("a password or private key is required".to_string())
            })?;

        Ok(SessionTarget {
            host,
            port: self.port.filter(|p| *p != 0).unwrap_or(default_port),
            username: self.username,
            credentials,
            window: self.window.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Port used when an open request does not name one.
    pub default_port: u16,
    pub connect_timeout: Duration,
    /// How long `close` waits for a session task before aborting it.
    pub teardown_grace: Duration,
    /// Capacity of each session's event channel.
    pub event_buffer: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            default_port: DEFAULT_SSH_PORT,
            connect_timeout: Duration::from_secs(20),
            teardown_grace: Duration::from_secs(5),
            event_buffer: 256,
        }
    }
}

/// Events of one opened session.
#[derive(Debug)]
pub struct SessionEvents {
    pub session_id: SessionId,
    pub events: mpsc::Receiver<BridgeEvent>,
}

pub(crate) struct SessionEntry {
    session_id: SessionId,
    commands: mpsc::UnboundedSender<SessionCommand>,
    status: watch::Receiver<SessionStatus>,
    task: JoinHandle<()>,
}

/// Owns every live session, keyed by client channel.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    connector: Arc<dyn ShellConnector>,
    config: BridgeConfig,
    sessions: Registry,
}

impl SessionManager {
    pub fn new(connector: Arc<dyn ShellConnector>, config: BridgeConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                connector,
                config,
                sessions: Arc::new(Mutex::new(HashMap::new())),
            }),
        }
    }

    /// Start a session on `channel`, replacing any session already there.
    ///
    /// Returns the receiver for the new session's events. The first event is
    /// always `Status(Connecting)`.
    pub async fn open(
        &self,
        channel: ChannelId,
        request: OpenRequest,
    ) -> Result<SessionEvents, BridgeError> {
        let target = request.into_target(self.inner.config.default_port)?;

        let previous = self.inner.sessions.lock().await.remove(&channel);
        if let Some(previous) = previous {
            info!(
                channel_id = %channel,
                session_id = %previous.session_id,
                "Replacing existing session on channel"
            );
            self.shutdown(previous).await;
        }

        let session_id = SessionId::new();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(self.inner.config.event_buffer.max(1));
        let (status_tx, status_rx) = watch::channel(SessionStatus::Connecting);

        let task = SessionTask {
            session_id,
            channel_id: channel,
            target,
            connector: self.inner.connector.clone(),
            connect_timeout: self.inner.config.connect_timeout,
            commands: command_rx,
            events: event_tx,
            status: status_tx,
            registry: self.inner.sessions.clone(),
            pending: VecDeque::new(),
            closing: false,
        };

        // The lock is held across spawn so a task that finishes immediately
        // cannot deregister before its entry exists.
        let displaced = {
            let mut sessions = self.inner.sessions.lock().await;
            let handle = tokio::spawn(task.run());
            sessions.insert(
                channel,
                SessionEntry {
                    session_id,
                    commands: command_tx,
                    status: status_rx,
                    task: handle,
                },
            )
        };
        if let Some(displaced) = displaced {
            self.shutdown(displaced).await;
        }

        Ok(SessionEvents {
            session_id,
            events: event_rx,
        })
    }

    /// Write raw bytes to the shell on `channel`.
    pub async fn write(&self, channel: &ChannelId, data: Bytes) -> Result<(), BridgeError> {
        self.send_connected(channel, SessionCommand::Input(data)).await
    }

    /// Apply a new window size to the shell on `channel`.
    pub async fn resize(&self, channel: &ChannelId, size: WindowSize) -> Result<(), BridgeError> {
        self.send_connected(channel, SessionCommand::Resize(size))
            .await
    }

    /// Tear down the session on `channel`. Safe to call repeatedly and after
    /// the session has already ended.
    pub async fn close(&self, channel: &ChannelId) {
        let entry = self.inner.sessions.lock().await.remove(channel);
        match entry {
            Some(entry) => self.shutdown(entry).await,
            None => debug!(channel_id = %channel, "No session to close"),
        }
    }

    /// Current status of the session on `channel`, if one is registered.
    pub async fn status(&self, channel: &ChannelId) -> Option<SessionStatus> {
        self.inner
            .sessions
            .lock()
            .await
            .get(channel)
            .map(|entry| *entry.status.borrow())
    }

    pub async fn session_count(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    /// Close every session. Used on shutdown.
    pub async fn close_all(&self) {
        let entries: Vec<SessionEntry> = self
            .inner
            .sessions
            .lock()
            .await
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in entries {
            self.shutdown(entry).await;
        }
    }

    async fn send_connected(
        &self,
        channel: &ChannelId,
        command: SessionCommand,
    ) -> Result<(), BridgeError> {
        let sessions = self.inner.sessions.lock().await;
        let entry = sessions.get(channel).ok_or(BridgeError::NotConnected)?;
        if *entry.status.borrow() != SessionStatus::Connected {
            return Err(BridgeError::NotConnected);
        }
        entry
            .commands
            .send(command)
            .map_err(|_| BridgeError::NotConnected)
    }

    async fn shutdown(&self, entry: SessionEntry) {
        let SessionEntry {
            session_id,
            commands,
            mut task,
            ..
        } = entry;

        // The task may already be gone; either way it is finishing.
        let _ = commands.send(SessionCommand::Close);

        let grace = self.inner.config.teardown_grace;
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            warn!(
                session_id = %session_id,
                grace_ms = grace.as_millis() as u64,
                "Session did not stop in time, aborting"
            );
            task.abort();
        } else {
            debug!(session_id = %session_id, "Session torn down");
        }
    }
}

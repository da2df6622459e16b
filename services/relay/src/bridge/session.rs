//! Per-session driver task.
//!
//! One task per session owns the shell transport. It reacts to exactly two
//! sources, shell output and client commands, and applies writes and resizes
//! one at a time in the order they arrive.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cloudterm_id::{ChannelId, SessionId};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use super::transport::{SessionTarget, ShellChannel, ShellConnector, TransportError, WindowSize};
use super::{BridgeEvent, SessionEntry, SessionStatus};

pub(crate) type Registry = Arc<Mutex<HashMap<ChannelId, SessionEntry>>>;

/// Client-side requests delivered to a session task.
#[derive(Debug)]
pub(crate) enum SessionCommand {
    Input(Bytes),
    Resize(WindowSize),
    Close,
}

enum Connect {
    Ready(Box<dyn ShellChannel>),
    Failed(TransportError),
    Cancelled,
}

/// Outcome of handing an event to the client.
enum Delivery {
    Sent,
    Closing,
    ReceiverGone,
}

enum Ended {
    RemoteClosed,
    ClientClosed,
    ClientGone,
    Failed(TransportError),
}

pub(crate) struct SessionTask {
    pub(crate) session_id: SessionId,
    pub(crate) channel_id: ChannelId,
    pub(crate) target: SessionTarget,
    pub(crate) connector: Arc<dyn ShellConnector>,
    pub(crate) connect_timeout: Duration,
    pub(crate) commands: mpsc::UnboundedReceiver<SessionCommand>,
    pub(crate) events: mpsc::Sender<BridgeEvent>,
    pub(crate) status: watch::Sender<SessionStatus>,
    pub(crate) registry: Registry,
    /// Commands that arrived while an event send was blocked.
    pub(crate) pending: VecDeque<SessionCommand>,
    pub(crate) closing: bool,
}

impl SessionTask {
    pub(crate) async fn run(mut self) {
        let final_status = match self.connect().await {
            Connect::Ready(shell) => self.relay(shell).await,
            Connect::Failed(error) => self.fail(error).await,
            Connect::Cancelled => {
                info!(
                    session_id = %self.session_id,
                    "Session closed while connecting"
                );
                SessionStatus::Disconnected
            }
        };

        self.set_status(final_status).await;
        self.deregister().await;
    }

    async fn connect(&mut self) -> Connect {
        self.set_status(SessionStatus::Connecting).await;
        if self.closing {
            return Connect::Cancelled;
        }

        info!(
            session_id = %self.session_id,
            channel_id = %self.channel_id,
            host = %self.target.host,
            port = self.target.port,
            username = %self.target.username,
            auth = self.target.credentials.kind(),
            "Opening shell session"
        );

        let connector = self.connector.clone();
        let target = self.target.clone();
        let timeout = self.connect_timeout;
        let connect = tokio::time::timeout(timeout, async move { connector.connect(&target).await });
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => {
                    return match result {
                        Ok(Ok(shell)) => Connect::Ready(shell),
                        Ok(Err(error)) => Connect::Failed(error),
                        Err(_) => Connect::Failed(TransportError::Timeout(timeout)),
                    };
                }
                command = self.next_command() => match command {
                    Some(SessionCommand::Close) | None => {
                        self.closing = true;
                        return Connect::Cancelled;
                    }
                    Some(command) => {
                        debug!(
                            session_id = %self.session_id,
                            ?command,
                            "Dropping command received before connected"
                        );
                    }
                },
            }
        }
    }

    async fn relay(&mut self, mut shell: Box<dyn ShellChannel>) -> SessionStatus {
        self.set_status(SessionStatus::Connected).await;
        info!(session_id = %self.session_id, "Shell session connected");

        let ended = loop {
            if self.closing {
                break Ended::ClientClosed;
            }
            tokio::select! {
                output = shell.next_output() => match output {
                    Ok(Some(chunk)) => match self.emit(BridgeEvent::Output(chunk)).await {
                        Delivery::Sent => {}
                        Delivery::Closing => break Ended::ClientClosed,
                        Delivery::ReceiverGone => break Ended::ClientGone,
                    },
                    Ok(None) => break Ended::RemoteClosed,
                    Err(error) => break Ended::Failed(error),
                },
                command = self.next_command() => match command {
                    Some(SessionCommand::Input(data)) => {
                        if let Err(error) = shell.write(&data).await {
                            break Ended::Failed(error);
                        }
                    }
                    Some(SessionCommand::Resize(size)) => {
                        debug!(
                            session_id = %self.session_id,
                            cols = size.cols,
                            rows = size.rows,
                            "Resizing terminal"
                        );
                        if let Err(error) = shell.resize(size).await {
                            break Ended::Failed(error);
                        }
                    }
                    Some(SessionCommand::Close) | None => {
                        self.closing = true;
                        break Ended::ClientClosed;
                    }
                },
            }
        };

        shell.close().await;

        match ended {
            Ended::Failed(error) => self.fail(error).await,
            Ended::RemoteClosed => {
                info!(session_id = %self.session_id, "Remote shell closed");
                SessionStatus::Disconnected
            }
            Ended::ClientClosed | Ended::ClientGone => {
                info!(session_id = %self.session_id, "Client closed session");
                SessionStatus::Disconnected
            }
        }
    }

    async fn fail(&mut self, error: TransportError) -> SessionStatus {
        warn!(session_id = %self.session_id, error = %error, "Shell session failed");
        self.emit(BridgeEvent::Error(error.to_string())).await;
        SessionStatus::Errored
    }

    async fn set_status(&mut self, status: SessionStatus) {
        self.status.send_replace(status);
        // A client that went away no longer needs status updates.
        self.emit(BridgeEvent::Status(status)).await;
    }

    /// Send `event` to the client, giving way to a close request if the
    /// event channel is full.
    ///
    /// Once closing, delivery is best effort and never waits.
    async fn emit(&mut self, event: BridgeEvent) -> Delivery {
        if self.closing {
            return match self.events.try_send(event) {
                Err(mpsc::error::TrySendError::Closed(_)) => Delivery::ReceiverGone,
                _ => Delivery::Closing,
            };
        }

        loop {
            tokio::select! {
                biased;

                permit = self.events.reserve() => {
                    return match permit {
                        Ok(permit) => {
                            permit.send(event);
                            Delivery::Sent
                        }
                        Err(_) => Delivery::ReceiverGone,
                    };
                }
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Close) | None => {
                        self.closing = true;
                        return Delivery::Closing;
                    }
                    Some(command) => self.pending.push_back(command),
                },
            }
        }
    }

    async fn next_command(&mut self) -> Option<SessionCommand> {
        match self.pending.pop_front() {
            Some(command) => Some(command),
            None => self.commands.recv().await,
        }
    }

    async fn deregister(&self) {
        let mut sessions = self.registry.lock().await;
        let owned = sessions
            .get(&self.channel_id)
            .is_some_and(|entry| entry.session_id == self.session_id);
        if owned {
            sessions.remove(&self.channel_id);
        }
        debug!(
            session_id = %self.session_id,
            removed = owned,
            "Session task finished"
        );
    }
}

//! SSH shell transport.
//!
//! Implements [`ShellConnector`] with `russh`: connect, authenticate with a
//! password or a private key, request a PTY, and start an interactive shell.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::key;
use tracing::debug;

use crate::bridge::{
    Credentials, SessionTarget, ShellChannel, ShellConnector, TransportError, WindowSize,
};

/// Default terminal type requested for the PTY.
pub const DEFAULT_TERM: &str = "xterm-256color";

/// Host keys are accepted without verification: machines are freshly
/// provisioned and have no recorded key yet. The fingerprint is logged.
struct ClientHandler {
    host: String,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!(
            host = %self.host,
            fingerprint = %server_public_key.fingerprint(),
            "Accepting server host key"
        );
        Ok(true)
    }
}

/// Opens interactive shells over SSH.
pub struct SshConnector {
    config: Arc<client::Config>,
    term: String,
}

impl SshConnector {
    pub fn new(term: impl Into<String>, keepalive: Option<Duration>) -> Self {
        let config = client::Config {
            keepalive_interval: keepalive,
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
            term: term.into(),
        }
    }

    async fn authenticate(
        session: &mut Handle<ClientHandler>,
        target: &SessionTarget,
    ) -> Result<(), TransportError> {
        let accepted = match &target.credentials {
            Credentials::Password(password) => session
                .authenticate_password(target.username.as_str(), password.as_str())
                .await
                .map_err(|e| TransportError::Authentication(e.to_string()))?,
            Credentials::PrivateKey { pem, passphrase } => {
                let key_pair = russh_keys::decode_secret_key(pem, passphrase.as_deref())
                    .map_err(|e| {
                        TransportError::Authentication(format!("invalid private key: {e}"))
                    })?;
                session
                    .authenticate_publickey(target.username.as_str(), Arc::new(key_pair))
                    .await
                    .map_err(|e| TransportError::Authentication(e.to_string()))?
            }
        };

        if accepted {
            Ok(())
        } else {
            Err(TransportError::Authentication(format!(
                "{} login rejected for user {}",
                target.credentials.kind(),
                target.username
            )))
        }
    }
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new(DEFAULT_TERM, Some(Duration::from_secs(30)))
    }
}

#[async_trait]
impl ShellConnector for SshConnector {
    async fn connect(&self, target: &SessionTarget) -> Result<Box<dyn ShellChannel>, TransportError> {
        let handler = ClientHandler {
            host: target.host.clone(),
        };
        let mut session = client::connect(
            self.config.clone(),
            (target.host.as_str(), target.port),
            handler,
        )
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;

        if let Err(error) = Self::authenticate(&mut session, target).await {
            let _ = session
                .disconnect(Disconnect::ByApplication, "", "English")
                .await;
            return Err(error);
        }

        let channel = session
            .channel_open_session()
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        channel
            .request_pty(
                false,
                &self.term,
                target.window.cols,
                target.window.rows,
                0,
                0,
                &[],
            )
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        channel
            .request_shell(false)
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        debug!(
            host = %target.host,
            term = %self.term,
            cols = target.window.cols,
            rows = target.window.rows,
            "Interactive shell started"
        );

        Ok(Box::new(SshShell {
            session,
            channel,
            closed: false,
        }))
    }
}

struct SshShell {
    session: Handle<ClientHandler>,
    channel: Channel<Msg>,
    closed: bool,
}

#[async_trait]
impl ShellChannel for SshShell {
    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.channel
            .data(data)
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }

    async fn resize(&mut self, size: WindowSize) -> Result<(), TransportError> {
        self.channel
            .window_change(size.cols, size.rows, 0, 0)
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }

    async fn next_output(&mut self) -> Result<Option<Bytes>, TransportError> {
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Data { data }) => return Ok(Some(Bytes::copy_from_slice(&data))),
                // With a PTY stderr is normally merged; forward it anyway.
                Some(ChannelMsg::ExtendedData { data, .. }) => {
                    return Ok(Some(Bytes::copy_from_slice(&data)))
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!(exit_status, "Remote shell exited");
                }
                Some(ChannelMsg::Eof) => debug!("Remote shell sent EOF"),
                Some(ChannelMsg::Close) | None => return Ok(None),
                Some(_) => {}
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.channel.eof().await;
        let _ = self
            .session
            .disconnect(Disconnect::ByApplication, "", "English")
            .await;
    }
}

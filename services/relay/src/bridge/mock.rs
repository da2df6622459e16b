//! In-memory shell transport for tests.
//!
//! [`MockConnector`] hands out a [`MockRemote`] for every shell it opens. The
//! remote is the far end of the shell: it sees every byte written and every
//! resize applied, and it can push output, inject a transport failure, or
//! close the shell.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex, Notify};

use super::transport::{
    Credentials, SessionTarget, ShellChannel, ShellConnector, TransportError, WindowSize,
};

enum RemoteOutput {
    Data(Bytes),
    Fail(TransportError),
}

/// Connector that accepts every target, optionally checking a password.
pub struct MockConnector {
    expected_password: Option<String>,
    connect_error: Option<TransportError>,
    gate: Option<Arc<Notify>>,
    remotes_tx: mpsc::UnboundedSender<MockRemote>,
    remotes_rx: Mutex<mpsc::UnboundedReceiver<MockRemote>>,
    attempts: StdMutex<Vec<SessionTarget>>,
}

impl MockConnector {
    pub fn new() -> Self {
        let (remotes_tx, remotes_rx) = mpsc::unbounded_channel();
        Self {
            expected_password: None,
            connect_error: None,
            gate: None,
            remotes_tx,
            remotes_rx: Mutex::new(remotes_rx),
            attempts: StdMutex::new(Vec::new()),
        }
    }

    /// Reject password logins that do not use `password`.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.expected_password = Some(password.into());
        self
    }

    /// Fail every connect with `error`.
    pub fn failing(mut self, error: TransportError) -> Self {
        self.connect_error = Some(error);
        self
    }

    /// Hold every connect until the returned handle is notified once per
    /// connect.
    pub fn gated(mut self) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        self.gate = Some(gate.clone());
        (self, gate)
    }

    /// Next shell opened by this connector, in open order.
    pub async fn next_remote(&self) -> Option<MockRemote> {
        self.remotes_rx.lock().await.recv().await
    }

    /// Targets of every connect attempt so far, including failed ones.
    pub fn attempts(&self) -> Vec<SessionTarget> {
        self.attempts
            .lock()
            .map(|attempts| attempts.clone())
            .unwrap_or_default()
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ShellConnector for MockConnector {
    async fn connect(&self, target: &SessionTarget) -> Result<Box<dyn ShellChannel>, TransportError> {
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.push(target.clone());
        }

        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        if let Some(error) = &self.connect_error {
            return Err(error.clone());
        }

        if let (Some(expected), Credentials::Password(given)) =
            (&self.expected_password, &target.credentials)
        {
            if expected != given {
                return Err(TransportError::Authentication(format!(
                    "all authentication methods rejected for {}",
                    target.username
                )));
            }
        }

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (resize_tx, resize_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        let remote = MockRemote {
            target: target.clone(),
            input: input_rx,
            resizes: resize_rx,
            output: output_tx,
            closed: closed_rx,
        };
        // The test may have stopped listening for remotes; the shell still works.
        let _ = self.remotes_tx.send(remote);

        Ok(Box::new(MockShell {
            input: input_tx,
            resizes: resize_tx,
            output: output_rx,
            closed: closed_tx,
        }))
    }
}

struct MockShell {
    input: mpsc::UnboundedSender<Bytes>,
    resizes: mpsc::UnboundedSender<WindowSize>,
    output: mpsc::UnboundedReceiver<RemoteOutput>,
    closed: watch::Sender<bool>,
}

#[async_trait]
impl ShellChannel for MockShell {
    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.input
            .send(Bytes::copy_from_slice(data))
            .map_err(|_| TransportError::Protocol("remote end gone".to_string()))
    }

    async fn resize(&mut self, size: WindowSize) -> Result<(), TransportError> {
        self.resizes
            .send(size)
            .map_err(|_| TransportError::Protocol("remote end gone".to_string()))
    }

    async fn next_output(&mut self) -> Result<Option<Bytes>, TransportError> {
        match self.output.recv().await {
            Some(RemoteOutput::Data(bytes)) => Ok(Some(bytes)),
            Some(RemoteOutput::Fail(error)) => Err(error),
            None => Ok(None),
        }
    }

    async fn close(&mut self) {
        self.closed.send_replace(true);
    }
}

/// Far end of a mock shell.
pub struct MockRemote {
    pub target: SessionTarget,
    input: mpsc::UnboundedReceiver<Bytes>,
    resizes: mpsc::UnboundedReceiver<WindowSize>,
    output: mpsc::UnboundedSender<RemoteOutput>,
    closed: watch::Receiver<bool>,
}

impl MockRemote {
    /// Emit a chunk of shell output.
    pub fn send_output(&self, data: impl Into<Bytes>) {
        let _ = self.output.send(RemoteOutput::Data(data.into()));
    }

    /// Fail the transport mid-session.
    pub fn fail(&self, error: TransportError) {
        let _ = self.output.send(RemoteOutput::Fail(error));
    }

    /// Close the shell from the remote side.
    pub fn hang_up(self) {
        drop(self);
    }

    /// Next chunk written by the bridge, or `None` once the shell is gone.
    pub async fn recv_input(&mut self) -> Option<Bytes> {
        self.input.recv().await
    }

    pub async fn recv_resize(&mut self) -> Option<WindowSize> {
        self.resizes.recv().await
    }

    /// Input received so far without waiting.
    pub fn drain_input(&mut self) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        while let Ok(chunk) = self.input.try_recv() {
            chunks.push(chunk);
        }
        chunks
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the bridge has closed or dropped the shell.
    pub async fn closed(&mut self) {
        let _ = self.closed.wait_for(|closed| *closed).await;
    }
}

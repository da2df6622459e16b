//! Shell transport interface.
//!
//! The bridge talks to remote shells through two traits:
//! - [`ShellConnector`] establishes an authenticated, interactive shell
//! - [`ShellChannel`] is that shell: a byte stream plus a window-size control
//!
//! The SSH implementation lives in [`crate::ssh`]; tests use
//! [`crate::bridge::mock`].

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Default remote-login port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Failure on the shell transport.
///
/// The `Display` text is what the client sees in its `error` event, so it
/// stays free of internal identifiers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("connection timed out after {0:?}")]
    Timeout(Duration),

    #[error("ssh protocol error: {0}")]
    Protocol(String),
}

/// Login secret. Exactly one kind is used per session.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Password(String),
    PrivateKey {
        pem: String,
        passphrase: Option<String>,
    },
}

impl Credentials {
    /// Picks the credential from optional form fields.
    ///
    /// A private key wins when both are present. Returns `None` when neither
    /// is present (empty strings count as absent).
    pub fn from_parts(
        password: Option<String>,
        private_key: Option<String>,
        passphrase: Option<String>,
    ) -> Option<Self> {
        let present = |v: Option<String>| v.filter(|s| !s.is_empty());

        if let Some(pem) = present(private_key) {
            return Some(Credentials::PrivateKey {
                pem,
                passphrase: present(passphrase),
            });
        }

        present(password).map(Credentials::Password)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Credentials::Password(_) => "password",
            Credentials::PrivateKey { .. } => "private_key",
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credentials::{}(<redacted>)", self.kind())
    }
}

/// Terminal window size in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub cols: u32,
    pub rows: u32,
}

impl WindowSize {
    pub const DEFAULT: Self = Self { cols: 80, rows: 24 };

    /// Rejects zero-sized windows.
    pub fn new(cols: u32, rows: u32) -> Option<Self> {
        (cols > 0 && rows > 0).then_some(Self { cols, rows })
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Where and as whom to open a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credentials: Credentials,
    pub window: WindowSize,
}

/// Opens interactive shells.
#[async_trait]
pub trait ShellConnector: Send + Sync {
    /// Connect, authenticate, and start an interactive shell with a PTY.
    async fn connect(&self, target: &SessionTarget) -> Result<Box<dyn ShellChannel>, TransportError>;
}

/// A live interactive shell.
///
/// Owned by exactly one session task, so calls never overlap.
#[async_trait]
pub trait ShellChannel: Send {
    /// Write raw bytes to the shell's input.
    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Apply a new window size.
    async fn resize(&mut self, size: WindowSize) -> Result<(), TransportError>;

    /// Next chunk of shell output, or `Ok(None)` once the shell has closed.
    ///
    /// Must be cancel-safe: the session task polls it inside `select!`.
    async fn next_output(&mut self) -> Result<Option<Bytes>, TransportError>;

    /// Close the shell and its connection. Errors are swallowed.
    async fn close(&mut self);
}

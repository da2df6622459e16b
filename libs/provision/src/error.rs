//! Provisioning errors.

use std::time::Duration;

use thiserror::Error;

/// A failed call to the resource provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ProviderError {
    /// HTTP status, when the failure came from a response.
    pub status: Option<u16>,
    pub message: String,
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        Self {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}

/// Terminal outcome of a provisioning attempt that did not yield a machine.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("timeout after {attempts} polls ({elapsed:?}) waiting for {resource} (last status: {last_status})")]
    Timeout {
        resource: String,
        attempts: u32,
        elapsed: Duration,
        last_status: String,
    },
}

impl ProvisionError {
    /// Stable code for wire protocols.
    pub fn code(&self) -> &'static str {
        match self {
            ProvisionError::Provider(_) => "provider_error",
            ProvisionError::Timeout { .. } => "timeout",
        }
    }
}

//! Terminal WebSocket wire protocol.
//!
//! Control messages travel as JSON text frames tagged by `type`. Shell bytes
//! travel as binary frames in both directions; a text `input` message is also
//! accepted for clients that cannot send binary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bridge::{OpenRequest, SessionStatus, WindowSize};

/// Inbound control message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Start(StartMessage),
    Input { data: String },
    Resize { cols: u32, rows: u32 },
    Disconnect,
}

#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct StartMessage {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub cols: Option<u32>,
    #[serde(default)]
    pub rows: Option<u32>,
}

impl std::fmt::Debug for StartMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartMessage")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("cols", &self.cols)
            .field("rows", &self.rows)
            .finish()
    }
}

impl From<StartMessage> for OpenRequest {
    fn from(start: StartMessage) -> Self {
        let window = match (start.cols, start.rows) {
            (Some(cols), Some(rows)) => WindowSize::new(cols, rows),
            _ => None,
        };
        OpenRequest {
            host: start.host,
            port: start.port,
            username: start.username,
            password: start.password,
            private_key: start.private_key,
            passphrase: start.passphrase,
            window,
        }
    }
}

/// Outbound control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Status { status: SessionStatus },
    Error { message: String },
}

impl ServerMessage {
    pub fn to_json(&self) -> String {
        // Serializing these variants cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// A malformed inbound message. Dropped, never fatal to the session.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("invalid window size {cols}x{rows}")]
    InvalidWindowSize { cols: u32, rows: u32 },
}

/// Parse a text frame, validating resize dimensions.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, ProtocolViolation> {
    let message: ClientMessage =
        serde_json::from_str(text).map_err(|e| ProtocolViolation::Malformed(e.to_string()))?;

    if let ClientMessage::Resize { cols, rows } = message {
        if WindowSize::new(cols, rows).is_none() {
            return Err(ProtocolViolation::InvalidWindowSize { cols, rows });
        }
    }

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start_with_defaults() {
        let message = parse_client_message(
            r#"{"type":"start","host":"203.0.113.5","username":"root","password":"pw"}"#,
        )
        .unwrap();

        let ClientMessage::Start(start) = message else {
            panic!("expected start, got {message:?}");
        };
        assert_eq!(start.port, None);

        let request = OpenRequest::from(start);
        assert_eq!(request.host, "203.0.113.5");
        assert_eq!(request.password.as_deref(), Some("pw"));
        assert_eq!(request.window, None);
    }

    #[test]
    fn test_parse_start_with_window() {
        let message = parse_client_message(
            r#"{"type":"start","host":"h","port":2222,"username":"u","private_key":"k","cols":120,"rows":40}"#,
        )
        .unwrap();
        let ClientMessage::Start(start) = message else {
            panic!("expected start");
        };
        let request = OpenRequest::from(start);
        assert_eq!(request.port, Some(2222));
        assert_eq!(request.window, Some(WindowSize { cols: 120, rows: 40 }));
    }

    #[test]
    fn test_parse_input_and_disconnect() {
        assert_eq!(
            parse_client_message(r#"{"type":"input","data":"ls -la\r"}"#).unwrap(),
            ClientMessage::Input {
                data: "ls -la\r".to_string()
            }
        );
        assert_eq!(
            parse_client_message(r#"{"type":"disconnect"}"#).unwrap(),
            ClientMessage::Disconnect
        );
    }

    #[test]
    fn test_non_numeric_resize_is_a_violation() {
        let err = parse_client_message(r#"{"type":"resize","cols":"wide","rows":24}"#).unwrap_err();
        assert!(matches!(err, ProtocolViolation::Malformed(_)));
    }

    #[test]
    fn test_zero_resize_is_a_violation() {
        assert_eq!(
            parse_client_message(r#"{"type":"resize","cols":0,"rows":24}"#).unwrap_err(),
            ProtocolViolation::InvalidWindowSize { cols: 0, rows: 24 }
        );
    }

    #[test]
    fn test_unknown_type_is_a_violation() {
        assert!(parse_client_message(r#"{"type":"exec","cmd":"rm"}"#).is_err());
        assert!(parse_client_message("not json").is_err());
    }

    #[test]
    fn test_server_messages_serialize() {
        assert_eq!(
            ServerMessage::Status {
                status: SessionStatus::Connected
            }
            .to_json(),
            r#"{"type":"status","status":"connected"}"#
        );
        assert_eq!(
            ServerMessage::Error {
                message: "authentication failed: nope".to_string()
            }
            .to_json(),
            r#"{"type":"error","message":"authentication failed: nope"}"#
        );
    }

    #[test]
    fn test_start_debug_redacts_secrets() {
        let message = parse_client_message(
            r#"{"type":"start","host":"h","username":"u","password":"hunter2"}"#,
        )
        .unwrap();
        assert!(!format!("{message:?}").contains("hunter2"));
    }
}

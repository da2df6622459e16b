//! Machine provisioning endpoints.
//!
//! Provides:
//! - POST /v1/machines (find or create, without waiting)
//! - GET /v1/machines/{id} (describe)
//! - DELETE /v1/machines/{id} (teardown)
//! - GET /v1/machines/{id}/wait (WebSocket readiness stream)
//!
//! Every call acts on behalf of the provider token the client presents, as a
//! bearer token or, for the WebSocket, a `token` query parameter.

use std::net::IpAddr;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use cloudterm_id::RequestId;
use cloudterm_provision::{
    ApiToken, Launcher, MachineSpec, Phase, PollProgress, ProvisionError, ProvisionRequest,
    ReadyResource, Resource, ResourceId,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::api::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
struct CreateMachineRequest {
    name: String,
    /// Reuse the machine with this name if one exists.
    #[serde(default)]
    lookup_key: Option<String>,
    region: String,
    size: String,
    image: String,
    #[serde(default)]
    user_data: Option<String>,
    #[serde(default)]
    ssh_keys: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct MachineResponse {
    pub id: String,
    pub name: String,
    pub phase: Phase,
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl From<Resource> for MachineResponse {
    fn from(resource: Resource) -> Self {
        Self {
            ready: resource.is_ready(),
            address: resource.primary_address(),
            id: resource.id.as_str().to_string(),
            name: resource.name,
            phase: resource.phase,
            region: resource.region,
            size: resource.size,
            created_at: resource.created_at,
        }
    }
}

/// Messages on the wait socket. The last one is `ready` or `failed`.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WaitMessage {
    Progress {
        attempt: u32,
        max_attempts: u32,
        phase: Phase,
        message: String,
    },
    Ready {
        machine: MachineResponse,
        attempts: u32,
    },
    Failed {
        code: &'static str,
        message: String,
    },
}

impl From<&PollProgress> for WaitMessage {
    fn from(progress: &PollProgress) -> Self {
        WaitMessage::Progress {
            attempt: progress.attempt,
            max_attempts: progress.max_attempts,
            phase: progress.resource_phase,
            message: progress.message().to_string(),
        }
    }
}

impl From<Result<ReadyResource, ProvisionError>> for WaitMessage {
    fn from(result: Result<ReadyResource, ProvisionError>) -> Self {
        match result {
            Ok(ready) => WaitMessage::Ready {
                attempts: ready.attempts,
                machine: MachineResponse::from(ready.resource),
            },
            Err(error) => WaitMessage::Failed {
                code: error.code(),
                message: error.to_string(),
            },
        }
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_machine))
        .route("/{machine_id}", get(get_machine).delete(delete_machine))
        .route("/{machine_id}/wait", get(wait_for_machine))
}

async fn create_machine(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateMachineRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = header_request_id(&headers);
    let credential = require_credential(&headers, None, &request_id)?;

    for (field, value) in [
        ("name", &req.name),
        ("region", &req.region),
        ("size", &req.size),
        ("image", &req.image),
    ] {
        if value.trim().is_empty() {
            return Err(
                ApiError::bad_request("invalid_request", format!("{field} is required"))
                    .with_request_id(request_id),
            );
        }
    }

    let request = ProvisionRequest {
        name: req.name,
        lookup_key: req.lookup_key.filter(|key| !key.is_empty()),
        credential,
        machine: MachineSpec {
            region: req.region,
            size: req.size,
            image: req.image,
            user_data: req.user_data,
            ssh_keys: req.ssh_keys,
            tags: req.tags,
        },
    };

    let resource = state.launcher().start(&request).await.map_err(|e| {
        warn!(error = %e, request_id = %request_id, name = %request.name, "Failed to launch machine");
        ApiError::from(e).with_request_id(request_id.clone())
    })?;

    Ok((StatusCode::CREATED, Json(MachineResponse::from(resource))))
}

async fn get_machine(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = header_request_id(&headers);
    let credential = require_credential(&headers, None, &request_id)?;

    let resource = state
        .launcher()
        .describe(&credential, &ResourceId::new(machine_id))
        .await
        .map_err(|e| ApiError::from(e).with_request_id(request_id))?;

    Ok(Json(MachineResponse::from(resource)))
}

async fn delete_machine(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = header_request_id(&headers);
    let credential = require_credential(&headers, None, &request_id)?;

    state
        .launcher()
        .teardown(&credential, &ResourceId::new(machine_id))
        .await
        .map_err(|e| ApiError::from(e).with_request_id(request_id))?;

    Ok(StatusCode::NO_CONTENT)
}

async fn wait_for_machine(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = header_request_id(&headers);
    let credential = require_credential(&headers, query.token, &request_id)?;
    let launcher = state.launcher().clone();
    let resource_id = ResourceId::new(machine_id);

    Ok(ws.on_upgrade(move |socket| handle_wait_socket(socket, launcher, credential, resource_id)))
}

async fn handle_wait_socket(
    socket: WebSocket,
    launcher: Launcher,
    credential: ApiToken,
    resource_id: ResourceId,
) {
    let (mut sender, mut receiver) = socket.split();
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<PollProgress>();

    let wait = launcher.wait(&credential, &resource_id, &progress_tx);
    tokio::pin!(wait);

    let outcome = loop {
        tokio::select! {
            biased;

            Some(progress) = progress_rx.recv() => {
                if send_json(&mut sender, &WaitMessage::from(&progress)).await.is_err() {
                    break None;
                }
            }
            result = &mut wait => break Some(result),
            message = receiver.next() => match message {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break None,
                Some(Ok(_)) => {}
            },
        }
    };

    let Some(result) = outcome else {
        // Dropping the wait future cancels the poll and its timer.
        info!(resource_id = %resource_id, "Wait cancelled by client");
        return;
    };

    while let Ok(progress) = progress_rx.try_recv() {
        if send_json(&mut sender, &WaitMessage::from(&progress)).await.is_err() {
            return;
        }
    }

    let _ = send_json(&mut sender, &WaitMessage::from(result)).await;
    let _ = sender.close().await;
}

async fn send_json(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &WaitMessage,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(message).map_err(axum::Error::new)?;
    sender.send(Message::Text(text.into())).await
}

fn require_credential(
    headers: &HeaderMap,
    query_token: Option<String>,
    request_id: &str,
) -> Result<ApiToken, ApiError> {
    query_token
        .filter(|token| !token.is_empty())
        .or_else(|| bearer_token(headers))
        .map(ApiToken::new)
        .ok_or_else(|| {
            ApiError::unauthorized("missing_token", "A provider API token is required")
                .with_request_id(request_id.to_string())
        })
}

fn header_request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| RequestId::new().to_string())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let auth = headers.get("Authorization")?.to_str().ok()?;
    let token = auth.trim().strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use cloudterm_provision::NetworkAddress;

    use super::*;

    #[test]
    fn test_bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert("Authorization", HeaderValue::from_static("Bearer dop_v1_abc"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("dop_v1_abc"));

        headers.insert("Authorization", HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn test_query_token_wins_over_header() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", HeaderValue::from_static("Bearer header"));

        let token = require_credential(&headers, Some("query".to_string()), "req").unwrap();
        assert_eq!(token.expose(), "query");

        let token = require_credential(&headers, Some(String::new()), "req").unwrap();
        assert_eq!(token.expose(), "header");
    }

    #[test]
    fn test_missing_credential_is_unauthorized() {
        let err = require_credential(&HeaderMap::new(), None, "req_1").unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        assert_eq!(err.problem.request_id, "req_1");
    }

    #[test]
    fn test_wait_messages_serialize() {
        let ready = WaitMessage::from(Ok::<_, ProvisionError>(ReadyResource {
            resource: Resource {
                id: ResourceId::new("42"),
                name: "desk".to_string(),
                phase: Phase::Active,
                networks: vec![NetworkAddress::public("192.0.2.4".parse().unwrap())],
                region: None,
                size: None,
                created_at: None,
            },
            address: "192.0.2.4".parse().unwrap(),
            attempts: 3,
        }));
        let json = serde_json::to_value(&ready).unwrap();
        assert_eq!(json["type"], "ready");
        assert_eq!(json["machine"]["address"], "192.0.2.4");
        assert_eq!(json["machine"]["ready"], true);
        assert_eq!(json["attempts"], 3);

        let failed = WaitMessage::from(Err::<ReadyResource, _>(ProvisionError::Timeout {
            resource: "42".to_string(),
            attempts: 40,
            elapsed: std::time::Duration::from_secs(200),
            last_status: "Machine desk is new (attempt 40/40)".to_string(),
        }));
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["type"], "failed");
        assert_eq!(json["code"], "timeout");
    }
}

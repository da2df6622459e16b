//! RFC 7807 problem responses.

use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use cloudterm_provision::ProvisionError;
use serde::Serialize;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub code: String,
    pub request_id: String,
    pub retryable: bool,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("https://cloudterm.dev/problems/{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            code,
            request_id: "unknown".to_string(),
            retryable: false,
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn with_status(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn unauthorized(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::UNAUTHORIZED, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, code, message)
    }

    pub fn bad_gateway(code: impl Into<String>, message: impl Into<String>) -> Self {
        let mut error = Self::with_status(StatusCode::BAD_GATEWAY, code, message);
        error.problem.retryable = true;
        error
    }

    pub fn gateway_timeout(code: impl Into<String>, message: impl Into<String>) -> Self {
        let mut error = Self::with_status(StatusCode::GATEWAY_TIMEOUT, code, message);
        error.problem.retryable = true;
        error
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.problem.request_id = request_id.into();
        self
    }
}

impl From<ProvisionError> for ApiError {
    fn from(error: ProvisionError) -> Self {
        match &error {
            ProvisionError::Provider(provider) => match provider.status {
                Some(404) => ApiError::not_found("machine_not_found", provider.message.clone()),
                Some(401) | Some(403) => {
                    ApiError::unauthorized("provider_unauthorized", provider.message.clone())
                }
                _ => ApiError::bad_gateway(error.code(), provider.message.clone()),
            },
            ProvisionError::Timeout { .. } => ApiError::gateway_timeout(error.code(), error.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use cloudterm_provision::ProviderError;

    use super::*;

    #[test]
    fn test_provider_not_found_maps_to_404() {
        let error = ApiError::from(ProvisionError::Provider(ProviderError::with_status(
            404,
            "Failed to fetch machine: not found",
        )));
        assert_eq!(error.status, StatusCode::NOT_FOUND);
        assert_eq!(error.problem.code, "machine_not_found");
    }

    #[test]
    fn test_provider_failure_maps_to_bad_gateway() {
        let error = ApiError::from(ProvisionError::Provider(ProviderError::new(
            "connection refused",
        )));
        assert_eq!(error.status, StatusCode::BAD_GATEWAY);
        assert_eq!(error.problem.code, "provider_error");
        assert!(error.problem.retryable);
    }

    #[tokio::test]
    async fn test_problem_response_content_type() {
        let response = ApiError::bad_request("invalid_request", "name is required")
            .with_request_id("req_123")
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );
    }
}

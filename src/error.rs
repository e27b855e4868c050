use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::client::TransportError;

pub const MISSING_MODEL_MESSAGE: &str = "you must provide a model parameter";
pub const INVALID_MODEL_MESSAGE: &str = "invalid model ID";
pub const INVALID_JSON_MESSAGE: &str = "We could not parse the JSON body of your request. \
(HINT: This likely means you aren't using your HTTP library correctly. The OpenAI API expects \
a JSON payload, but what was sent was not valid JSON.)";
pub const RATE_LIMITED_MESSAGE: &str = "Rate limit exceeded. Please try again later.";

#[derive(Debug, Serialize, Deserialize)]
pub struct OpenAiErrorResponse {
    pub error: OpenAiError,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OpenAiError {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

pub fn openai_error_response(
    status: StatusCode,
    error_type: &str,
    message: &str,
    param: Option<&str>,
    code: Option<&str>,
) -> Response {
    let body = OpenAiErrorResponse {
        error: OpenAiError {
            message: message.to_string(),
            error_type: error_type.to_string(),
            param: param.map(ToString::to_string),
            code: code.map(ToString::to_string),
        },
    };
    (status, Json(body)).into_response()
}

pub fn error_type_for_status(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => "invalid_request_error",
        401 => "authentication_error",
        403 => "permission_error",
        404 => "not_found_error",
        429 => "rate_limit_error",
        500 => "server_error",
        _ => "invalid_request_error",
    }
}

pub fn api_error_response(status: StatusCode, message: &str) -> Response {
    openai_error_response(status, error_type_for_status(status), message, None, None)
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("request body too large")]
    PayloadTooLarge,
    #[error("failed to read request body")]
    UnreadableBody,
    #[error("malformed request body")]
    MalformedRequest,
    #[error("you must provide a model parameter")]
    MissingModel,
    #[error("invalid model ID: {0}")]
    ModelNotAllowed(String),
    #[error("rate limit exceeded")]
    RateLimited,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("error fetching models from backend {backend}: {reason}")]
    ModelListing { backend: String, reason: String },
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::UnreadableBody
            | Self::MalformedRequest
            | Self::MissingModel
            | Self::ModelNotAllowed(_) => StatusCode::BAD_REQUEST,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Transport(_) | Self::ModelListing { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            Self::PayloadTooLarge => openai_error_response(
                status,
                "invalid_request_error",
                "request body too large",
                None,
                Some("request_too_large"),
            ),
            Self::UnreadableBody => openai_error_response(
                status,
                "invalid_request_error",
                "failed to read request body",
                None,
                Some("invalid_body"),
            ),
            Self::MalformedRequest => api_error_response(status, INVALID_JSON_MESSAGE),
            Self::MissingModel => api_error_response(status, MISSING_MODEL_MESSAGE),
            Self::ModelNotAllowed(_) => api_error_response(status, INVALID_MODEL_MESSAGE),
            Self::RateLimited => api_error_response(status, RATE_LIMITED_MESSAGE),
            Self::Transport(_) => api_error_response(status, "error forwarding request to model"),
            Self::ModelListing { .. } => api_error_response(status, "error fetching models"),
        }
    }
}

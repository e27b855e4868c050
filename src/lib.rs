pub mod allowlist;
pub mod backend;
pub mod client;
pub mod config;
pub mod cors;
pub mod error;
pub mod extract;
pub mod proxy;
pub mod ratelimit;
pub mod telemetry;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::{BytesRejection, FailedToBufferBody};
use axum::extract::{ConnectInfo, DefaultBodyLimit, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::allowlist::{Endpoint, ProxyRequest};
use crate::backend::{BackendRegistry, ConfigError};
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::extract::extract_model;
use crate::ratelimit::RateLimiter;

#[derive(Clone)]
pub struct AppState {
    registry: BackendRegistry,
    config: Arc<GatewayConfig>,
    rate_limiter: Option<RateLimiter>,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Result<Self, ConfigError> {
        let registry = BackendRegistry::new(config.backends.clone())?;
        let rate_limiter =
            RateLimiter::new(config.rate_limit_max_requests, config.rate_limit_window);
        Ok(Self {
            registry,
            config: Arc::new(config),
            rate_limiter,
        })
    }
}

pub fn app(state: AppState) -> Router {
    let prefix = state.config.path_prefix.clone();
    let max_request_bytes = state.config.max_request_bytes;
    Router::new()
        .route("/v1/healthcheck", get(healthcheck))
        .route(
            &format!("{prefix}/chat/completions"),
            post(chat_completions).options(cors::preflight),
        )
        .route(
            &format!("{prefix}/images/generations"),
            post(image_generations).options(cors::preflight),
        )
        .route(
            &format!("{prefix}/models"),
            get(list_models).options(cors::models_preflight),
        )
        .layer(DefaultBodyLimit::max(max_request_bytes))
        .with_state(state)
}

async fn healthcheck() -> impl IntoResponse {
    (StatusCode::OK, "available")
}

async fn chat_completions(
    State(state): State<AppState>,
    connect_info: Option<Extension<ConnectInfo<SocketAddr>>>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let peer = connect_info.map(|Extension(ConnectInfo(addr))| addr);
    handle_proxied(&state, Endpoint::ChatCompletions, peer, &headers, body).await
}

async fn image_generations(
    State(state): State<AppState>,
    connect_info: Option<Extension<ConnectInfo<SocketAddr>>>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let peer = connect_info.map(|Extension(ConnectInfo(addr))| addr);
    handle_proxied(&state, Endpoint::ImageGenerations, peer, &headers, body).await
}

async fn handle_proxied(
    state: &AppState,
    endpoint: Endpoint,
    peer: Option<SocketAddr>,
    headers: &HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    // Only models that resolved to a backend become label values.
    let mut model_label = String::new();
    let resp = match proxy_pipeline(state, endpoint, peer, headers, body, &mut model_label)
        .await
    {
        Ok(resp) => resp,
        Err(err) => {
            tracing::debug!(handler = endpoint.handler(), error = %err, "request rejected");
            err.into_response()
        }
    };
    telemetry::record_http_request(
        endpoint.handler(),
        Method::POST.as_str(),
        resp.status().as_u16(),
        &model_label,
    );
    resp
}

fn body_rejection(rejection: BytesRejection) -> GatewayError {
    match rejection {
        BytesRejection::FailedToBufferBody(FailedToBufferBody::LengthLimitError(_)) => {
            GatewayError::PayloadTooLarge
        }
        _ => GatewayError::UnreadableBody,
    }
}

async fn proxy_pipeline(
    state: &AppState,
    endpoint: Endpoint,
    peer: Option<SocketAddr>,
    headers: &HeaderMap,
    body: Result<Bytes, BytesRejection>,
    model_label: &mut String,
) -> Result<Response, GatewayError> {
    if let Some(limiter) = state.rate_limiter.as_ref() {
        let ip = ratelimit::client_ip(
            state.config.trust_proxy_headers,
            &state.config.trusted_proxy_cidrs,
            headers,
            peer,
        );
        if let Some(ip) = ip {
            if !limiter.check(ip).await {
                telemetry::record_rate_limited();
                tracing::info!(%ip, "rate limit exceeded");
                return Err(GatewayError::RateLimited);
            }
        }
    }

    let body = body.map_err(body_rejection)?;
    let request = extract_model(body)?;
    let request = ProxyRequest::resolve(&state.registry, Method::POST, endpoint, request)?;

    model_label.clone_from(&request.model);
    telemetry::record_request_size(endpoint.handler(), model_label, request.body.len());

    proxy::forward(request).await
}

#[derive(Debug, Serialize)]
struct ModelList {
    object: &'static str,
    data: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct ModelPage {
    #[serde(default)]
    data: Vec<Value>,
}

async fn list_models(State(state): State<AppState>) -> Response {
    let resp = match merged_models(&state.registry).await {
        Ok(data) => (
            StatusCode::OK,
            [(
                header::ACCESS_CONTROL_ALLOW_ORIGIN,
                HeaderValue::from_static("*"),
            )],
            Json(ModelList {
                object: "list",
                data,
            }),
        )
            .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "error listing models");
            err.into_response()
        }
    };
    telemetry::record_http_request("models", Method::GET.as_str(), resp.status().as_u16(), "");
    resp
}

/// Each backend's `/models`, filtered to its allowlist, in registry order.
async fn merged_models(registry: &BackendRegistry) -> Result<Vec<Value>, GatewayError> {
    let mut models = Vec::new();

    for backend in registry.iter() {
        let listing_error = |reason: String| GatewayError::ModelListing {
            backend: backend.name.clone(),
            reason,
        };

        let resp = backend
            .client()
            .do_request(Method::GET, "/models", Bytes::new())
            .await
            .map_err(|e| listing_error(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(listing_error(format!("unexpected status {status}")));
        }
        let page: ModelPage = resp
            .json()
            .await
            .map_err(|e| listing_error(e.to_string()))?;

        let before = models.len();
        models.extend(page.data.into_iter().filter(|model| {
            model
                .get("id")
                .and_then(Value::as_str)
                .is_some_and(|id| backend.allows(id))
        }));
        tracing::debug!(
            backend = %backend.name,
            models = models.len() - before,
            "fetched backend models"
        );
    }

    Ok(models)
}

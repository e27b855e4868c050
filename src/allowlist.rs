use std::sync::Arc;

use axum::http::Method;
use bytes::Bytes;

use crate::backend::{Backend, BackendRegistry};
use crate::error::GatewayError;
use crate::extract::{ModelField, ModelRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    ChatCompletions,
    ImageGenerations,
}

impl Endpoint {
    pub fn path(self) -> &'static str {
        match self {
            Self::ChatCompletions => "/chat/completions",
            Self::ImageGenerations => "/images/generations",
        }
    }

    pub fn handler(self) -> &'static str {
        match self {
            Self::ChatCompletions => "chat_completions",
            Self::ImageGenerations => "image_generations",
        }
    }

    pub fn supports_streaming(self) -> bool {
        matches!(self, Self::ChatCompletions)
    }
}

#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub endpoint: Endpoint,
    pub body: Bytes,
    pub model: String,
    pub backend: Arc<Backend>,
    pub stream: bool,
}

pub fn resolve_backend(
    registry: &BackendRegistry,
    model: &ModelField,
) -> Result<Arc<Backend>, GatewayError> {
    let model = match model {
        ModelField::Missing => return Err(GatewayError::MissingModel),
        ModelField::NotAString => return Err(GatewayError::MalformedRequest),
        ModelField::Value(model) if model.is_empty() => return Err(GatewayError::MissingModel),
        ModelField::Value(model) => model,
    };

    match registry.resolve(model) {
        Some(backend) => {
            tracing::debug!(%model, backend = %backend.name, "resolved backend");
            Ok(backend.clone())
        }
        None => {
            tracing::debug!(%model, "model is not on any allowlist");
            Err(GatewayError::ModelNotAllowed(model.clone()))
        }
    }
}

impl ProxyRequest {
    pub fn resolve(
        registry: &BackendRegistry,
        method: Method,
        endpoint: Endpoint,
        request: ModelRequest,
    ) -> Result<Self, GatewayError> {
        let backend = resolve_backend(registry, &request.model)?;
        let model = request.model.as_str().unwrap_or_default().to_string();
        Ok(Self {
            method,
            endpoint,
            body: request.body,
            model,
            backend,
            stream: request.stream && endpoint.supports_streaming(),
        })
    }
}

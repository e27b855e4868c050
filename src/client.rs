use std::io;
use std::sync::OnceLock;

use axum::http::{header, HeaderValue, Method};
use bytes::Bytes;
use reqwest::Client;

static TRANSPORT: OnceLock<Client> = OnceLock::new();

fn transport() -> &'static Client {
    TRANSPORT.get_or_init(|| {
        Client::builder()
            .pool_max_idle_per_host(64)
            .build()
            .unwrap_or_default()
    })
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request path is empty")]
    EmptyPath,
    #[error("upstream connection was reset or cancelled: {0}")]
    Disconnected(#[source] reqwest::Error),
    #[error("upstream request failed: {0}")]
    Failed(#[source] reqwest::Error),
}

impl TransportError {
    fn from_reqwest(err: reqwest::Error) -> Self {
        if is_disconnect_error(&err) {
            Self::Disconnected(err)
        } else {
            Self::Failed(err)
        }
    }

    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected(_))
    }
}

pub(crate) fn is_disconnect_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}

pub(crate) fn is_disconnect_error(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            if is_disconnect_io(io_err) {
                return true;
            }
            // A custom io::Error hides its payload from source().
            if let Some(inner) = io_err.get_ref() {
                current = Some(inner as &(dyn std::error::Error + 'static));
                continue;
            }
        }
        current = err.source();
    }
    false
}

pub fn join_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[derive(Clone)]
pub struct BackendClient {
    base_url: String,
    api_key: String,
    http: Client,
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            http: transport().clone(),
        }
    }

    pub async fn do_request(
        &self,
        method: Method,
        path: &str,
        body: Bytes,
    ) -> Result<reqwest::Response, TransportError> {
        if path.trim_start_matches('/').is_empty() {
            return Err(TransportError::EmptyPath);
        }

        let url = join_url(&self.base_url, path);
        tracing::debug!(%method, %url, body_bytes = body.len(), "sending backend request");

        let mut req = self
            .http
            .request(method, url)
            .header(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .bearer_auth(&self.api_key);
        if !body.is_empty() {
            req = req.body(body);
        }

        req.send().await.map_err(TransportError::from_reqwest)
    }
}

impl std::fmt::Debug for BackendClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"REDACTED")
            .finish()
    }
}

use std::io;
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use futures_util::StreamExt;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{field, Instrument};

use crate::allowlist::ProxyRequest;
use crate::client::is_disconnect_error;
use crate::error::GatewayError;
use crate::telemetry::{self, FirstByteLatch, RelayOutcome, UsageCollector, UsageSample};

const RELAY_BUFFER: usize = 16;

/// Forces `stream_options.include_usage = true`, keeping any other
/// `stream_options` keys. Returns the input unchanged when it cannot be
/// re-encoded.
pub fn inject_stream_options(body: &Bytes) -> Bytes {
    let mut value: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(err) => {
            tracing::error!(error = %err, "error decoding request body; forwarding without stream_options");
            return body.clone();
        }
    };
    let Some(map) = value.as_object_mut() else {
        return body.clone();
    };

    let options = map
        .entry("stream_options")
        .or_insert_with(|| Value::Object(Map::new()));
    if !options.is_object() {
        *options = Value::Object(Map::new());
    }
    if let Some(options) = options.as_object_mut() {
        options.insert("include_usage".to_string(), Value::Bool(true));
    }

    match serde_json::to_vec(&value) {
        Ok(encoded) => Bytes::from(encoded),
        Err(err) => {
            tracing::error!(error = %err, "error encoding request body; forwarding without stream_options");
            body.clone()
        }
    }
}

/// Sends `request` to its backend and returns a response whose body is fed by
/// a relay task. Errors are only returned before any response byte exists.
pub async fn forward(request: ProxyRequest) -> Result<Response, GatewayError> {
    let span = tracing::info_span!(
        "proxy.request",
        model = %request.model,
        backend = %request.backend.name,
        endpoint = request.endpoint.path(),
        response_bytes = field::Empty,
        ttfb_ms = field::Empty
    );
    forward_in_span(request).instrument(span).await
}

async fn forward_in_span(request: ProxyRequest) -> Result<Response, GatewayError> {
    let started = Instant::now();
    let body = if request.stream {
        inject_stream_options(&request.body)
    } else {
        request.body.clone()
    };

    let client = request.backend.client();
    let upstream = match client
        .do_request(request.method.clone(), request.endpoint.path(), body)
        .await
    {
        Ok(upstream) => upstream,
        Err(err) => {
            if err.is_disconnect() {
                tracing::info!(error = %err, "backend request cancelled");
            } else {
                tracing::error!(error = %err, "error forwarding request to backend");
            }
            return Err(err.into());
        }
    };

    let status = upstream.status();
    tracing::debug!(status = status.as_u16(), "backend responded");

    let content_type = upstream.headers().get(header::CONTENT_TYPE).cloned();

    let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(RELAY_BUFFER);
    let relay = Relay {
        model: request.model,
        backend: request.backend.name.clone(),
        stream: request.stream,
        status,
        started,
    };
    tokio::spawn(relay.run(upstream, tx).in_current_span());

    Ok(streaming_response(status, content_type, rx))
}

fn streaming_response(
    status: StatusCode,
    content_type: Option<HeaderValue>,
    rx: mpsc::Receiver<Result<Bytes, io::Error>>,
) -> Response {
    let mut resp = Response::new(Body::from_stream(ReceiverStream::new(rx)));
    *resp.status_mut() = status;
    let headers = resp.headers_mut();
    if let Some(content_type) = content_type {
        headers.insert(header::CONTENT_TYPE, content_type);
    }
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    resp
}

struct Relay {
    model: String,
    backend: String,
    stream: bool,
    status: StatusCode,
    started: Instant,
}

impl Relay {
    async fn run(self, upstream: reqwest::Response, tx: mpsc::Sender<Result<Bytes, io::Error>>) {
        let span = tracing::Span::current();
        let mut body = upstream.bytes_stream();
        let mut latch = FirstByteLatch::new(self.started);
        let mut collector = self
            .status
            .is_success()
            .then(|| UsageCollector::new(self.stream));
        let mut response_bytes: u64 = 0;

        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = tx.closed() => break RelayOutcome::ClientDisconnect,
                next = body.next() => next,
            };

            match next {
                None => break RelayOutcome::Completed,
                Some(Ok(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    let len = chunk.len();
                    if tx.send(Ok(chunk.clone())).await.is_err() {
                        break RelayOutcome::ClientDisconnect;
                    }
                    response_bytes += len as u64;

                    if let Some(ttfb) = latch.observe(len) {
                        let ttfb_ms = ttfb.as_millis() as u64;
                        span.record("ttfb_ms", ttfb_ms);
                        telemetry::record_ttfb(&self.model, &self.backend, ttfb);
                    }
                    if let Some(collector) = collector.as_mut() {
                        collector.observe(&chunk);
                    }
                }
                Some(Err(err)) => {
                    if is_disconnect_error(&err) {
                        tracing::info!(error = %err, "backend connection closed mid-response");
                    } else {
                        tracing::error!(error = %err, "error reading backend response");
                    }
                    let _ = tx.send(Err(io::Error::other(err))).await;
                    break RelayOutcome::UpstreamError;
                }
            }
        };
        drop(body);
        drop(tx);

        let elapsed = self.started.elapsed();
        span.record("response_bytes", response_bytes);
        telemetry::record_relay(&self.model, &self.backend, outcome, response_bytes, elapsed);

        match outcome {
            RelayOutcome::ClientDisconnect => tracing::info!(
                response_bytes,
                elapsed_ms = elapsed.as_millis() as u64,
                "client disconnected before response completed"
            ),
            RelayOutcome::UpstreamError => tracing::debug!(
                response_bytes,
                "response truncated by backend error"
            ),
            RelayOutcome::Completed => tracing::debug!(
                response_bytes,
                elapsed_ms = elapsed.as_millis() as u64,
                "response relayed"
            ),
        }

        if outcome != RelayOutcome::Completed {
            return;
        }
        if let Some(observed) = collector.and_then(UsageCollector::finish) {
            telemetry::emit(&UsageSample::new(observed, &self.model, elapsed));
        }
    }
}

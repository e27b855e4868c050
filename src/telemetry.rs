use std::time::{Duration, Instant};

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;

pub const MAX_MIRROR_BYTES: usize = 64 * 1024 * 1024;

pub fn install_prometheus() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

impl Usage {
    pub fn is_zero(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0
    }
}

#[derive(Debug, Deserialize)]
struct CompletionProbe {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Observed {
    pub model: Option<String>,
    pub usage: Usage,
}

pub fn parse_completion_body(body: &[u8]) -> Result<Observed, serde_json::Error> {
    let probe: CompletionProbe = serde_json::from_slice(body)?;
    Ok(Observed {
        model: probe.model.filter(|m| !m.is_empty()),
        usage: probe.usage.unwrap_or_default(),
    })
}

/// Incremental reader for `data:` lines of a chat completion SSE stream.
#[derive(Debug, Default)]
pub struct SseUsageScanner {
    pending: Vec<u8>,
    observed: Observed,
    done: bool,
}

impl SseUsageScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if self.done {
            return;
        }

        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            let (head, tail) = rest.split_at(pos + 1);
            rest = tail;

            if self.pending.is_empty() {
                self.scan_line(head);
            } else {
                let mut line = std::mem::take(&mut self.pending);
                line.extend_from_slice(head);
                self.scan_line(&line);
            }
            if self.done {
                return;
            }
        }

        if self.pending.len() + rest.len() > MAX_MIRROR_BYTES {
            tracing::warn!(
                pending_bytes = self.pending.len() + rest.len(),
                "stream line exceeds mirror limit; stopping usage scan"
            );
            self.pending.clear();
            self.done = true;
            return;
        }
        self.pending.extend_from_slice(rest);
    }

    pub fn finish(mut self) -> Observed {
        if !self.done && !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.scan_line(&line);
        }
        self.observed
    }

    fn scan_line(&mut self, raw: &[u8]) {
        let line = raw.trim_ascii();
        let line = line.strip_prefix(b"data:").unwrap_or(line).trim_ascii();
        if line.is_empty() {
            return;
        }
        if line == b"[DONE]" {
            self.done = true;
            return;
        }

        let chunk = match parse_completion_body(line) {
            Ok(chunk) => chunk,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    line = %String::from_utf8_lossy(line),
                    "error decoding stream line"
                );
                self.done = true;
                return;
            }
        };

        if self.observed.model.is_none() {
            self.observed.model = chunk.model;
        }
        if !chunk.usage.is_zero() {
            self.observed.usage = chunk.usage;
        }
    }
}

#[derive(Debug)]
pub enum UsageCollector {
    Stream(SseUsageScanner),
    Body { buf: Vec<u8>, overflowed: bool },
}

impl UsageCollector {
    pub fn new(stream: bool) -> Self {
        if stream {
            Self::Stream(SseUsageScanner::new())
        } else {
            Self::Body {
                buf: Vec::new(),
                overflowed: false,
            }
        }
    }

    pub fn observe(&mut self, chunk: &[u8]) {
        match self {
            Self::Stream(scanner) => scanner.push(chunk),
            Self::Body { buf, overflowed } => {
                if *overflowed {
                    return;
                }
                if buf.len() + chunk.len() > MAX_MIRROR_BYTES {
                    tracing::warn!(
                        limit = MAX_MIRROR_BYTES,
                        "response body exceeds mirror limit; skipping usage metrics"
                    );
                    *overflowed = true;
                    *buf = Vec::new();
                    return;
                }
                buf.extend_from_slice(chunk);
            }
        }
    }

    pub fn finish(self) -> Option<Observed> {
        match self {
            Self::Stream(scanner) => Some(scanner.finish()),
            Self::Body { overflowed: true, .. } => None,
            Self::Body { buf, .. } => match parse_completion_body(&buf) {
                Ok(observed) => Some(observed),
                Err(err) => {
                    tracing::warn!(error = %err, "error decoding response body");
                    None
                }
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UsageSample {
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub elapsed: Duration,
}

impl UsageSample {
    pub fn new(observed: Observed, requested_model: &str, elapsed: Duration) -> Self {
        Self {
            model: observed
                .model
                .unwrap_or_else(|| requested_model.to_string()),
            prompt_tokens: observed.usage.prompt_tokens,
            completion_tokens: observed.usage.completion_tokens,
            elapsed,
        }
    }

    pub fn throughput(&self) -> Option<f64> {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return None;
        }
        let value = self.prompt_tokens as f64 / secs;
        value.is_finite().then_some(value)
    }
}

pub fn emit(sample: &UsageSample) {
    let model = sample.model.clone();
    metrics::counter!("prompt_tokens_total", "model" => model.clone())
        .increment(sample.prompt_tokens);
    metrics::counter!("tokens_predicted_total", "model" => model.clone())
        .increment(sample.completion_tokens);

    let throughput = sample.throughput();
    match throughput {
        Some(value) => {
            metrics::gauge!("prompt_processing_tokens_seconds", "model" => model).set(value)
        }
        None => tracing::debug!(model = %sample.model, "throughput not measurable"),
    }

    tracing::debug!(
        model = %sample.model,
        prompt_tokens = sample.prompt_tokens,
        completion_tokens = sample.completion_tokens,
        throughput = throughput.unwrap_or_default(),
        elapsed_ms = sample.elapsed.as_millis() as u64,
        "usage"
    );
}

#[derive(Debug)]
pub struct FirstByteLatch {
    started: Instant,
    fired: bool,
}

impl FirstByteLatch {
    pub fn new(started: Instant) -> Self {
        Self {
            started,
            fired: false,
        }
    }

    pub fn observe(&mut self, len: usize) -> Option<Duration> {
        if self.fired || len == 0 {
            return None;
        }
        self.fired = true;
        Some(self.started.elapsed())
    }
}

pub fn record_ttfb(model: &str, backend: &str, ttfb: Duration) {
    metrics::histogram!(
        "http_server_ttfb",
        "model" => model.to_string(),
        "backend" => backend.to_string()
    )
    .record(ttfb.as_secs_f64() * 1000.0);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Completed,
    ClientDisconnect,
    UpstreamError,
}

impl RelayOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::ClientDisconnect => "client_disconnect",
            Self::UpstreamError => "upstream_error",
        }
    }
}

pub fn record_relay(
    model: &str,
    backend: &str,
    outcome: RelayOutcome,
    response_bytes: u64,
    elapsed: Duration,
) {
    let m = model.to_string();
    let b = backend.to_string();
    let o = outcome.as_str();
    metrics::histogram!(
        "proxy_response_bytes",
        "model" => m.clone(), "backend" => b.clone(), "outcome" => o
    )
    .record(response_bytes as f64);
    metrics::histogram!(
        "proxy_request_duration_seconds",
        "model" => m, "backend" => b, "outcome" => o
    )
    .record(elapsed.as_secs_f64());
}

pub fn record_http_request(handler: &'static str, method: &str, code: u16, model: &str) {
    metrics::counter!(
        "http_requests_total",
        "handler" => handler,
        "method" => method.to_string(),
        "code" => code.to_string(),
        "model" => model.to_string()
    )
    .increment(1);
}

pub fn record_request_size(handler: &'static str, model: &str, bytes: usize) {
    metrics::histogram!(
        "http_request_size_bytes",
        "handler" => handler,
        "model" => model.to_string()
    )
    .record(bytes as f64);
}

pub fn record_rate_limited() {
    metrics::counter!("ratelimit_rejected_total").increment(1);
}

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

pub const ALLOWED_METHODS: &str = "POST, OPTIONS";
pub const MODELS_ALLOWED_METHODS: &str = "GET, OPTIONS";
pub const ALLOWED_HEADERS: &str = "Authorization, Content-Type, x-stainless-os, \
x-stainless-runtime-version, x-stainless-package-version, x-stainless-runtime, \
x-stainless-arch, x-stainless-retry-count, x-stainless-lang, user-agent";
pub const MAX_AGE_SECS: &str = "3600";

pub async fn preflight() -> Response {
    preflight_response(ALLOWED_METHODS)
}

pub async fn models_preflight() -> Response {
    preflight_response(MODELS_ALLOWED_METHODS)
}

fn preflight_response(methods: &'static str) -> Response {
    (
        StatusCode::OK,
        [
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*")),
            (
                header::ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static(methods),
            ),
            (
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static(ALLOWED_HEADERS),
            ),
            (
                header::ACCESS_CONTROL_MAX_AGE,
                HeaderValue::from_static(MAX_AGE_SECS),
            ),
        ],
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    use http_body_util::BodyExt;

    #[tokio::test]
    async fn preflight_sets_cors_headers_and_empty_body() {
        let resp = preflight().await;
        assert_eq!(resp.status(), StatusCode::OK);

        let headers = resp.headers();
        assert_eq!(headers.get("access-control-allow-origin").unwrap(), "*");
        assert_eq!(
            headers.get("access-control-allow-methods").unwrap(),
            "POST, OPTIONS"
        );
        assert_eq!(
            headers.get("access-control-allow-headers").unwrap(),
            "Authorization, Content-Type, x-stainless-os, x-stainless-runtime-version, \
x-stainless-package-version, x-stainless-runtime, x-stainless-arch, x-stainless-retry-count, \
x-stainless-lang, user-agent"
        );
        assert_eq!(headers.get("access-control-max-age").unwrap(), "3600");

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn models_preflight_allows_get() {
        let resp = models_preflight().await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get("access-control-allow-methods").unwrap(),
            "GET, OPTIONS"
        );
        assert_eq!(resp.headers().get("access-control-max-age").unwrap(), "3600");
    }
}

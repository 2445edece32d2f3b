//! Catch-all pass-through proxy and the hop-by-hop header policy.
//!
//! Anything not matched by a dedicated route is forwarded to the
//! upstream as-is, with the response body streamed straight back.

use axum::{
    Json,
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::TryStreamExt;
use tracing::{error, warn};

use crate::models::ErrorBody;
use crate::server::ProxyState;

/// Response headers never forwarded back to the client.
const EXCLUDED_RESPONSE_HEADERS: &[&str] = &[
    "content-encoding",
    "transfer-encoding",
    "content-length",
    "connection",
];

/// Client request headers never forwarded upstream.
const EXCLUDED_REQUEST_HEADERS: &[&str] = &["host", "content-length"];

fn should_forward_request_header(name: &str) -> bool {
    let lower = name.to_lowercase();
    !EXCLUDED_REQUEST_HEADERS.contains(&lower.as_str())
}

/// Upstream response headers minus the hop-by-hop set.
pub(crate) fn strip_response_headers(
    headers: &reqwest::header::HeaderMap,
) -> impl Iterator<Item = (&str, &[u8])> {
    headers.iter().filter_map(|(name, value)| {
        let lower = name.as_str().to_lowercase();
        if EXCLUDED_RESPONSE_HEADERS.contains(&lower.as_str()) {
            None
        } else {
            Some((name.as_str(), value.as_bytes()))
        }
    })
}

/// ANY `/<path>` — generic pass-through as a last resort.
pub(crate) async fn passthrough(State(state): State<ProxyState>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path().to_owned(), |pq| pq.as_str().to_owned());
    let target = format!("{}{}", state.config.upstream, path_and_query);
    warn!(method = %parts.method, target = %target, "fallback pass-through proxy");

    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(b) => b,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody::bad_request(e.to_string())),
            )
                .into_response();
        }
    };

    let method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
        .unwrap_or(reqwest::Method::GET);
    let mut builder = state.client.request(method, &target);
    for (name, value) in &parts.headers {
        if should_forward_request_header(name.as_str())
            && let Ok(value_str) = value.to_str()
        {
            builder = builder.header(name.as_str(), value_str);
        }
    }

    match builder.body(body).send().await {
        Ok(resp) => {
            let status =
                StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            let headers = resp.headers().clone();

            let mut response = Response::builder().status(status);
            for (name, value) in strip_response_headers(&headers) {
                response = response.header(name, value);
            }

            let stream = resp.bytes_stream().map_err(std::io::Error::other);
            response
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(e) => {
            error!("fallback upstream request error: {e}");
            (
                StatusCode::BAD_GATEWAY,
                Json(ErrorBody::upstream_connection_error(e.to_string())),
            )
                .into_response()
        }
    }
}

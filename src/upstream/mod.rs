//! # Upstream Module
//!
//! The downstream delegate behind the guard: admitted requests are forwarded
//! to the configured upstream base URL and the upstream's status and body are
//! relayed back. This layer does not retry; an unreachable upstream is its
//! own answer (502), distinct from the guard's 500 error boundary.

use crate::AppState;
use axum::body::Bytes;
use axum::extract::{OriginalUri, State};
use axum::http::{HeaderMap, Method, Uri};
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

/// Request headers relayed to the upstream. Everything else (hop-by-hop
/// headers, cookies, forwarding chains) stays at the gateway.
const FORWARDED_HEADERS: [&str; 2] = ["content-type", "authorization"];

///////////////////////////////////////////////////////////////////////////////
//****                       Public Functions                            ****//
///////////////////////////////////////////////////////////////////////////////

/// Handles requests with no body (GET, HEAD, DELETE)
pub async fn handle_request_no_body(
    state: State<AppState>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Response {
    forward_to_upstream(state, method, uri, headers, None).await
}

/// Handles requests with a body (POST, PUT, PATCH)
pub async fn handle_request_with_body(
    state: State<AppState>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    payload: Bytes,
) -> Response {
    forward_to_upstream(state, method, uri, headers, Some(payload)).await
}

///////////////////////////////////////////////////////////////////////////////
//****                       Private Functions                           ****//
///////////////////////////////////////////////////////////////////////////////

/// Forward one admitted request and relay the upstream response.
async fn forward_to_upstream(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Option<Bytes>,
) -> Response {
    let target = build_target_url(&state.upstream_url, &uri);

    let mut builder = state.http_client.request(method.clone(), &target);
    for name in FORWARDED_HEADERS {
        if let Some(value) = headers.get(name) {
            builder = builder.header(name, value.clone());
        }
    }
    if let Some(body) = body {
        builder = builder.body(body);
    }

    match builder.send().await {
        Ok(upstream_response) => {
            let status = upstream_response.status();
            let content_type = upstream_response
                .headers()
                .get("content-type")
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            let bytes = upstream_response.bytes().await.unwrap_or_default();

            debug!(
                method = %method,
                target = %target,
                status = %status,
                "Forwarded request upstream"
            );

            let mut response = axum::response::Response::builder().status(status);
            if let Some(content_type) = content_type {
                response = response.header("content-type", content_type);
            }
            response
                .body(axum::body::Body::from(bytes))
                .unwrap_or_else(|_| status.into_response())
        }
        Err(err) => {
            warn!(
                method = %method,
                target = %target,
                "Upstream request failed: {}", err
            );
            (
                axum::http::StatusCode::BAD_GATEWAY,
                axum::Json(serde_json::json!({ "error": "Upstream unreachable." })),
            )
                .into_response()
        }
    }
}

/// Join the upstream base with the request's path and query.
fn build_target_url(base: &str, uri: &Uri) -> String {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    format!("{}{}", base.trim_end_matches('/'), path_and_query)
}

///////////////////////////////////////////////////////////////////////////////
//****                              Tests                                ****//
///////////////////////////////////////////////////////////////////////////////

//! # Guard Module
//!
//! The request guard wraps every proxied route and runs three steps in
//! order, mirroring the admission pipeline the gateway exists for:
//!
//! 1. **CORS**: allowed origins are echoed back; `OPTIONS` preflights get a
//!    204 and never reach admission or the delegate.
//! 2. **Admission**: the caller identity picks an evaluator (per-user policy
//!    for authenticated callers, per-IP otherwise); a denial answers 429 and
//!    stops. Bucket store trouble is answered according to the configured
//!    failure policy.
//! 3. **Delegate**: the downstream handler runs inside an error boundary; a
//!    panic is recorded to the error log and answered with a plain 500.
//!
//! Every path writes exactly one response. The boundary's 500 only fires
//! when the delegate produced no response at all, so a response can never be
//! overwritten.

pub mod cors;
pub mod identity;

use self::cors::{CorsConfig, add_cors_headers, preflight_response};
use self::identity::resolve_identity;
use crate::AppState;
use crate::env::StoreFailurePolicy;
use crate::limiter::Decision;
use crate::logging::errors::{ErrorContext, ErrorSeverity, log_error_async};
use axum::Json;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use function_name::named;
use serde_json::json;
use std::net::SocketAddr;
use tracing::{debug, warn};
use uuid::Uuid;

///////////////////////////////////////////////////////////////////////////////
//****                       Public Functions                            ****//
///////////////////////////////////////////////////////////////////////////////

/// Guard middleware applied to every proxied route.
#[named]
pub async fn guard_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let origin = request
        .headers()
        .get("origin")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    // 1. CORS
    if method == Method::OPTIONS {
        debug!(
            request_id = %request_id,
            path = %path,
            "Preflight request, short-circuiting with 204"
        );
        return preflight_response(&state.cors, origin.as_deref());
    }

    // 2. Admission
    let identity = resolve_identity(
        request.headers(),
        request.extensions().get::<ConnectInfo<SocketAddr>>(),
        state.config.jwt_secret.as_deref(),
    );

    match identity.key() {
        // A request without any resolvable identity is admitted without
        // counting; there is no bucket it could be charged to.
        None => {
            debug!(
                request_id = %request_id,
                path = %path,
                "No resolvable caller identity, admitting without counting"
            );
        }
        Some(key) => {
            let evaluator = if identity.is_authenticated() {
                &state.auth_evaluator
            } else {
                &state.anon_evaluator
            };

            match evaluator.check(key).await {
                Ok(Decision::Allowed { remaining }) => {
                    debug!(
                        request_id = %request_id,
                        identity = %key,
                        path = %path,
                        remaining,
                        "Request admitted"
                    );
                }
                Ok(Decision::Denied) => {
                    warn!(
                        request_id = %request_id,
                        identity = %key,
                        path = %path,
                        "Request denied, window quota exhausted"
                    );
                    return with_cors(
                        error_response(StatusCode::TOO_MANY_REQUESTS, "Too many requests."),
                        &state.cors,
                        origin.as_deref(),
                    );
                }
                Err(err) => match state.config.store_failure {
                    StoreFailurePolicy::Open => {
                        warn!(
                            request_id = %request_id,
                            identity = %key,
                            path = %path,
                            "Bucket store unavailable, admitting per fail-open policy: {}", err
                        );
                    }
                    StoreFailurePolicy::Closed => {
                        let context = ErrorContext::new()
                            .with_request(method.to_string(), path.clone())
                            .with_identity(key.to_string())
                            .with_request_id(request_id.clone());
                        log_error_async(
                            &state.db,
                            ErrorSeverity::Error,
                            format!("Bucket store unavailable, rejecting per fail-closed policy: {}", err),
                            Some(context),
                            file!(),
                            line!(),
                            Some(function_name!().to_string()),
                        )
                        .await;
                        return with_cors(
                            error_response(
                                StatusCode::SERVICE_UNAVAILABLE,
                                "Service temporarily unavailable.",
                            ),
                            &state.cors,
                            origin.as_deref(),
                        );
                    }
                },
            }
        }
    }

    // 3. Delegate inside the error boundary. The spawn is the boundary: a
    // panicking delegate surfaces as a JoinError here instead of tearing
    // down the connection task.
    let identity_key = identity.key().map(str::to_string);
    match tokio::spawn(next.run(request)).await {
        Ok(mut response) => {
            add_cors_headers(response.headers_mut(), &state.cors, origin.as_deref());
            response
        }
        Err(join_error) => {
            let detail = if join_error.is_panic() {
                "delegate handler panicked"
            } else {
                "delegate handler was cancelled"
            };
            let mut context = ErrorContext::new()
                .with_request(method.to_string(), path.clone())
                .with_request_id(request_id.clone());
            if let Some(key) = identity_key {
                context = context.with_identity(key);
            }
            log_error_async(
                &state.db,
                ErrorSeverity::Critical,
                format!("Unhandled delegate failure ({}): {}", detail, join_error),
                Some(context),
                file!(),
                line!(),
                Some(function_name!().to_string()),
            )
            .await;
            with_cors(
                error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal error occurred.",
                ),
                &state.cors,
                origin.as_deref(),
            )
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
//****                       Private Functions                           ****//
///////////////////////////////////////////////////////////////////////////////

/// Short JSON error body; internal detail stays in the logs.
fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn with_cors(mut response: Response, config: &CorsConfig, origin: Option<&str>) -> Response {
    add_cors_headers(response.headers_mut(), config, origin);
    response
}

///////////////////////////////////////////////////////////////////////////////
//****                              Tests                                ****//
///////////////////////////////////////////////////////////////////////////////
// End-to-end guard behavior (preflight short-circuit, 429 denial, panic
// isolation) is covered in src/tests/guard_tests.rs against a running
// server; the unit tests here only pin the error body contract.

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn error_body_is_short_json() {
        let response = error_response(StatusCode::TOO_MANY_REQUESTS, "Too many requests.");
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, json!({ "error": "Too many requests." }));
    }
}

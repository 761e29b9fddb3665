//! Caller identity resolution.
//!
//! Every admission bucket is keyed by an identity string: the `sub` claim of
//! a valid bearer token when a JWT secret is configured, otherwise the
//! client IP. Token validation here only picks the bucket key and the
//! policy tier. The guard is not an authentication layer, so a bad token
//! never rejects a request, it just demotes the caller to IP identity.

use axum::extract::ConnectInfo;
use axum::http::HeaderMap;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use std::net::SocketAddr;
use tracing::debug;

/// Who is asking, as far as admission is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallerIdentity {
    /// Authenticated caller, bucketed by user id under the per-user policy.
    Authenticated { user_id: String },
    /// Anonymous caller, bucketed by IP under the per-IP policy.
    Anonymous { ip: String },
    /// No resolvable identity. Admitted without counting, matching the
    /// behavior for requests that arrive without a usable peer address.
    Unknown,
}

impl CallerIdentity {
    /// The bucket key, if this identity participates in admission control.
    pub fn key(&self) -> Option<&str> {
        match self {
            CallerIdentity::Authenticated { user_id } => Some(user_id),
            CallerIdentity::Anonymous { ip } => Some(ip),
            CallerIdentity::Unknown => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, CallerIdentity::Authenticated { .. })
    }
}

/// Claims we care about: the subject is the bucket key, the expiry is
/// enforced by the validator.
#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[allow(dead_code)]
    exp: usize,
}

/// Resolve the caller identity from request headers and connection info.
pub fn resolve_identity(
    headers: &HeaderMap,
    peer: Option<&ConnectInfo<SocketAddr>>,
    jwt_secret: Option<&str>,
) -> CallerIdentity {
    if let Some(secret) = jwt_secret {
        if let Some(user_id) = bearer_subject(headers, secret) {
            return CallerIdentity::Authenticated { user_id };
        }
    }

    match client_ip(headers, peer) {
        Some(ip) => CallerIdentity::Anonymous { ip },
        None => CallerIdentity::Unknown,
    }
}

/// Extract and validate a bearer token, returning its subject.
fn bearer_subject(headers: &HeaderMap, secret: &str) -> Option<String> {
    let token = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))?;

    let validation = Validation::new(Algorithm::HS256);
    match decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    ) {
        Ok(data) => Some(data.claims.sub),
        Err(err) => {
            debug!("Bearer token rejected, falling back to IP identity: {}", err);
            None
        }
    }
}

/// Client IP: `x-real-ip`, then the first non-empty `x-forwarded-for` entry,
/// then the socket peer address.
fn client_ip(headers: &HeaderMap, peer: Option<&ConnectInfo<SocketAddr>>) -> Option<String> {
    let from_headers = headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .or_else(|| {
            headers
                .get("x-forwarded-for")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.split(',').find(|entry| !entry.trim().is_empty()))
        })
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    from_headers.or_else(|| peer.map(|info| info.0.ip().to_string()))
}

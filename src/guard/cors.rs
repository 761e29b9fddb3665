//! # CORS Module
//!
//! Cross-origin policy for guarded routes. The gateway keeps a static origin
//! allow-list: an allowed `Origin` is echoed back in
//! `Access-Control-Allow-Origin`, anything else gets no origin header at all.
//! The allowed methods and headers are fixed; the guard fronts a JSON API
//! surface and advertises exactly what it accepts.

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use std::collections::HashSet;

/// Methods the guard accepts on guarded routes
const ALLOWED_METHODS: &str = "POST, GET, OPTIONS";

/// Request headers the guard accepts on guarded routes
const ALLOWED_HEADERS: &str = "Content-Type, Authorization";

/// Configuration for CORS policies
#[derive(Debug, Clone, Default)]
pub struct CorsConfig {
    /// Allowed origins for cross-origin requests
    allowed_origins: HashSet<String>,
}

impl CorsConfig {
    /// Create a CORS configuration from a list of allowed origins
    pub fn new<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_origins: origins.into_iter().map(Into::into).collect(),
        }
    }

    /// Add an allowed origin
    pub fn allow_origin(mut self, origin: &str) -> Self {
        self.allowed_origins.insert(origin.to_string());
        self
    }

    /// Check if an origin is allowed
    pub fn is_origin_allowed(&self, origin: &str) -> bool {
        if self.allowed_origins.contains(origin) {
            return true;
        }

        // Wildcard subdomain entries like "*.example.com"
        for allowed_origin in &self.allowed_origins {
            if allowed_origin.contains('*') && origin_matches_pattern(origin, allowed_origin) {
                return true;
            }
        }

        false
    }
}

/// Check if an origin matches a wildcard pattern
fn origin_matches_pattern(origin: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    if let Some(domain) = pattern.strip_prefix("*.") {
        return origin.ends_with(domain) || origin == domain;
    }

    false
}

/// Add CORS headers to a response. The origin echo only happens for allowed
/// origins; methods and headers are always advertised.
pub fn add_cors_headers(headers: &mut HeaderMap, config: &CorsConfig, origin: Option<&str>) {
    if let Some(origin_str) = origin {
        if config.is_origin_allowed(origin_str) {
            if let Ok(origin_value) = HeaderValue::from_str(origin_str) {
                headers.insert("access-control-allow-origin", origin_value);
            }
            headers.insert("vary", HeaderValue::from_static("Origin"));
        }
    }

    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static(ALLOWED_METHODS),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static(ALLOWED_HEADERS),
    );
}

/// Answer a preflight request: 204, empty body, CORS headers only.
pub fn preflight_response(config: &CorsConfig, origin: Option<&str>) -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    add_cors_headers(response.headers_mut(), config, origin);
    response
}

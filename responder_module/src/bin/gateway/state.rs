use std::sync::Arc;

use axum::http::HeaderMap;

use responder_module::config::ServiceConfig;
use responder_module::dispatcher::Dispatcher;
use responder_module::push_auth::OidcVerifier;
use responder_module::rate_limiter::RateLimiter;

pub(crate) struct GatewayState {
    pub config: ServiceConfig,
    pub verifier: OidcVerifier,
    pub limiter: Arc<dyn RateLimiter>,
    pub dispatcher: Arc<Dispatcher>,
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Shared-token guard for the operator endpoints.
pub(crate) fn verify_service_token(
    headers: &HeaderMap,
    expected: &str,
) -> Result<(), &'static str> {
    match bearer_token(headers) {
        Some(token) if token == expected => Ok(()),
        Some(_) => Err("bad_token"),
        None => Err("missing_token"),
    }
}

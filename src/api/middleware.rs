//! API Middleware
//!
//! Bearer-token authentication and request logging.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, Request},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::domain::OperationContext;
use crate::error::AppError;
use crate::Engine;

// =========================================================================
// Bearer Authentication Middleware
// =========================================================================

fn bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| AppError::Unauthorized("missing Authorization header".to_string()))?
        .to_str()
        .map_err(|_| AppError::Unauthorized("malformed Authorization header".to_string()))?;

    match value.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() => {
            Ok(token.trim())
        }
        _ => Err(AppError::Unauthorized("expected a bearer token".to_string())),
    }
}

/// Resolve the bearer token through the identity platform and attach the
/// resulting `OperationContext` to the request.
pub async fn auth_middleware(
    State(engine): State<Arc<Engine>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let token = bearer_token(request.headers())?;

    let identity = engine
        .identity()
        .verify(token)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "Identity verification failed");
            AppError::UpstreamFailure("identity verification unavailable".to_string())
        })?
        .ok_or_else(|| AppError::Unauthorized("invalid or expired token".to_string()))?;

    // Extract correlation ID or generate new one
    let correlation_id = request
        .headers()
        .get("X-Correlation-Id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::new_v4);

    let context = OperationContext::for_caller(identity).with_correlation_id(correlation_id);
    request.extensions_mut().insert(context);

    Ok(next.run(request).await)
}

// =========================================================================
// mask_headers_for_logging
// =========================================================================

/// Headers that should be masked in logs
const SENSITIVE_HEADERS: &[&str] = &["authorization", "cookie", "set-cookie", "x-razorpay-signature"];

/// Mask sensitive headers for logging
pub fn mask_headers_for_logging(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let name_lower = name.as_str().to_lowercase();
            let masked_value = if SENSITIVE_HEADERS.contains(&name_lower.as_str()) {
                "[REDACTED]".to_string()
            } else {
                value.to_str().unwrap_or("[invalid utf8]").to_string()
            };
            (name.to_string(), masked_value)
        })
        .collect()
}

// =========================================================================
// Request Logging Middleware
// =========================================================================

/// Request logging middleware
pub async fn logging_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let headers = mask_headers_for_logging(request.headers());

    let correlation_id = request
        .extensions()
        .get::<OperationContext>()
        .and_then(|ctx| ctx.correlation_id);
    let caller = request
        .extensions()
        .get::<OperationContext>()
        .and_then(|ctx| ctx.actor_id());

    let start = std::time::Instant::now();
    tracing::info!(
        method = %method,
        uri = %uri,
        correlation_id = ?correlation_id,
        caller = ?caller,
        headers = ?headers,
        "Incoming request"
    );

    let response = next.run(request).await;

    tracing::info!(
        method = %method,
        uri = %uri,
        status = %response.status(),
        duration_ms = %start.elapsed().as_millis(),
        correlation_id = ?correlation_id,
        "Request completed"
    );

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_mask_headers_for_logging() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        headers.insert("authorization", "Bearer secret-token".parse().unwrap());

        let masked = mask_headers_for_logging(&headers);
        let auth = masked.iter().find(|(name, _)| name == "authorization").unwrap();
        assert_eq!(auth.1, "[REDACTED]");
        let content_type = masked.iter().find(|(name, _)| name == "content-type").unwrap();
        assert_eq!(content_type.1, "application/json");
    }

    #[test]
    fn test_bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers).unwrap_err().kind(), ErrorKind::Unauthorized);

        headers.insert(AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&headers).unwrap_err().kind(), ErrorKind::Unauthorized);

        headers.insert(AUTHORIZATION, "bearer  tok-123 ".parse().unwrap());
        assert_eq!(bearer_token(&headers).unwrap(), "tok-123");
    }
}

//! Optional bearer-token guard for the control API.
//!
//! - When `CONTROL_API_TOKEN` is unset, every route is open (loopback-only deployments)
//! - When set, requests must carry `Authorization: Bearer <token>`

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::routes::AppState;

fn constant_time_eq(a: &str, b: &str) -> bool {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    if a_bytes.len() != b_bytes.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for i in 0..a_bytes.len() {
        diff |= a_bytes[i] ^ b_bytes[i];
    }
    diff == 0
}

fn bearer_token(req: &Request<Body>) -> &str {
    let auth_header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");

    auth_header
        .strip_prefix("Bearer ")
        .or_else(|| auth_header.strip_prefix("bearer "))
        .unwrap_or("")
        .trim()
}

pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.config.control_token.as_deref() else {
        return next.run(req).await;
    };

    let token = bearer_token(&req);
    if token.is_empty() {
        return (StatusCode::UNAUTHORIZED, "Missing Authorization header").into_response();
    }
    if !constant_time_eq(token, expected) {
        return (StatusCode::UNAUTHORIZED, "Invalid token").into_response();
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("s3cret", "s3cret"));
        assert!(!constant_time_eq("s3cret", "s3cre"));
        assert!(!constant_time_eq("s3cret", "s3creT"));
    }

    #[test]
    fn test_bearer_token_extraction() {
        let req = Request::builder()
            .header("authorization", "bearer  abc ")
            .body(Body::empty())
            .unwrap();
        assert_eq!(bearer_token(&req), "abc");

        let req = Request::builder().body(Body::empty()).unwrap();
        assert_eq!(bearer_token(&req), "");
    }
}

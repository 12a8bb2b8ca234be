//! Bearer-token authentication.
//!
//! Tokens come from a static table in the configuration and map directly to
//! user ids. The middleware validates the token and injects `CurrentUser`
//! into request extensions; handlers take it as an extractor. `EventSource`
//! cannot set headers, so the stream endpoint also accepts the token as a
//! `token` query parameter.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, State},
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::config::AuthConfig;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing authorization header")]
    MissingAuthHeader,

    #[error("invalid authorization header format")]
    InvalidAuthHeader,

    #[error("invalid token")]
    InvalidToken,
}

#[derive(Debug, Serialize)]
pub struct AuthErrorResponse {
    pub error: String,
    pub error_code: String,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let error_code = match &self {
            AuthError::MissingAuthHeader => "missing_auth_header",
            AuthError::InvalidAuthHeader => "invalid_auth_header",
            AuthError::InvalidToken => "invalid_token",
        };
        let body = Json(AuthErrorResponse {
            error: self.to_string(),
            error_code: error_code.to_string(),
        });
        (StatusCode::UNAUTHORIZED, body).into_response()
    }
}

/// Extract a Bearer token from an Authorization header value.
fn bearer_token_from_header(header_value: &str) -> Result<&str, AuthError> {
    let mut parts = header_value.split_whitespace();
    let scheme = parts.next().ok_or(AuthError::InvalidAuthHeader)?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::InvalidAuthHeader);
    }

    let token = parts.next().ok_or(AuthError::InvalidAuthHeader)?;
    if token.is_empty() {
        return Err(AuthError::InvalidAuthHeader);
    }

    if parts.next().is_some() {
        return Err(AuthError::InvalidAuthHeader);
    }

    Ok(token)
}

fn token_from_query(query: &str) -> Option<&str> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key == "token" && !value.is_empty() {
            Some(value)
        } else {
            None
        }
    })
}

/// Authentication state shared across handlers.
#[derive(Clone)]
pub struct AuthState {
    tokens: Arc<HashMap<String, String>>,
}

impl AuthState {
    pub fn new(config: AuthConfig) -> Self {
        Self {
            tokens: Arc::new(config.tokens),
        }
    }

    /// Resolve a token to its user id.
    pub fn validate_token(&self, token: &str) -> Result<String, AuthError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidToken)
    }
}

/// Authenticated user extracted from request.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub user_id: String,
}

impl CurrentUser {
    pub fn id(&self) -> &str {
        &self.user_id
    }
}

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentUser>()
            .cloned()
            .ok_or(AuthError::MissingAuthHeader)
    }
}

/// Authentication middleware.
///
/// Accepts, in priority order:
/// 1. Authorization: Bearer <token> header
/// 2. `token` query parameter (for EventSource connections)
pub async fn auth_middleware(
    State(auth): State<AuthState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let auth_header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let user_id = if let Some(header) = auth_header {
        let token = bearer_token_from_header(header)?;
        auth.validate_token(token)?
    } else if let Some(token) = req.uri().query().and_then(token_from_query) {
        auth.validate_token(token)?
    } else {
        return Err(AuthError::MissingAuthHeader);
    };

    debug!(user_id, "request authenticated");
    req.extensions_mut().insert(CurrentUser { user_id });

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth_state() -> AuthState {
        let mut tokens = HashMap::new();
        tokens.insert("secret-token".to_string(), "user-1".to_string());
        AuthState::new(AuthConfig { tokens })
    }

    #[test]
    fn bearer_token_parsing_valid() {
        assert_eq!(
            bearer_token_from_header("Bearer abc.def.ghi").unwrap(),
            "abc.def.ghi"
        );
        assert_eq!(
            bearer_token_from_header("bearer   token123").unwrap(),
            "token123"
        );
    }

    #[test]
    fn bearer_token_parsing_invalid() {
        let cases = [
            "",
            "Bearer",
            "Bearer ",
            "Token something",
            "Bearer token extra",
        ];
        for case in cases {
            assert!(
                bearer_token_from_header(case).is_err(),
                "{case} should fail"
            );
        }
    }

    #[test]
    fn query_token_extraction() {
        assert_eq!(
            token_from_query("cursor=5&token=secret-token"),
            Some("secret-token")
        );
        assert_eq!(token_from_query("cursor=5"), None);
        assert_eq!(token_from_query("token="), None);
    }

    #[test]
    fn token_table_lookup() {
        let state = auth_state();
        assert_eq!(state.validate_token("secret-token").unwrap(), "user-1");
        assert!(state.validate_token("wrong").is_err());
    }
}

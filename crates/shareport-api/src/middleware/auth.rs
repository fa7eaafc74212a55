//! Caller identification
//!
//! Every request passes through [`resolve_caller`], which turns the
//! `session_token` cookie or `Authorization: Bearer` header into a [`Caller`]
//! extension. Requests without a token proceed as anonymous; row-level checks
//! in the handlers decide what an anonymous caller may do.
//!
//! The token is the placeholder credential handed out by `shareport login`:
//! the approving user's id. It must name an existing user.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::handlers::{api_error, store_error, ApiError};
use crate::AppState;

pub const SESSION_COOKIE: &str = "session_token";

/// Identity of the requester
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Caller {
    user_id: Option<Uuid>,
}

impl Caller {
    pub fn anonymous() -> Self {
        Self { user_id: None }
    }

    pub fn user(user_id: Uuid) -> Self {
        Self {
            user_id: Some(user_id),
        }
    }

    pub fn user_id(&self) -> Option<Uuid> {
        self.user_id
    }

    pub fn is(&self, user_id: Uuid) -> bool {
        self.user_id == Some(user_id)
    }

    /// The caller's id, or 401 for anonymous requests
    pub fn require(&self) -> Result<Uuid, ApiError> {
        self.user_id.ok_or_else(|| {
            api_error(
                StatusCode::UNAUTHORIZED,
                "AUTH_REQUIRED",
                "Sign in to perform this action",
            )
        })
    }
}

/// Token from the session cookie, falling back to the Authorization header
///
/// `Err` means an Authorization header was present but not a bearer token.
pub fn extract_token(headers: &HeaderMap) -> Result<Option<String>, ApiError> {
    let cookie = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .map(str::trim)
        .find_map(|cookie| cookie.strip_prefix(SESSION_COOKIE)?.strip_prefix('='));
    if let Some(token) = cookie {
        return Ok(Some(token.to_string()));
    }

    let Some(auth_header) = headers.get(header::AUTHORIZATION) else {
        return Ok(None);
    };
    auth_header
        .to_str()
        .ok()
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| Some(token.trim().to_string()))
        .ok_or_else(|| {
            api_error(
                StatusCode::UNAUTHORIZED,
                "INVALID_AUTH_FORMAT",
                "Invalid Authorization header format. Expected 'Bearer <token>'",
            )
        })
}

/// Resolve the request's [`Caller`] and store it as an extension
pub async fn resolve_caller(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let caller = match extract_token(request.headers())? {
        None => Caller::anonymous(),
        Some(token) => {
            let invalid = || {
                api_error(
                    StatusCode::UNAUTHORIZED,
                    "INVALID_TOKEN",
                    "Invalid or unknown credential",
                )
            };
            let user_id = Uuid::parse_str(&token).map_err(|_| invalid())?;
            let user = state
                .store
                .find_user(user_id)
                .await
                .map_err(store_error)?
                .ok_or_else(invalid)?;
            debug!("Request authenticated as {}", user.email);
            Caller::user(user.id)
        }
    };

    request.extensions_mut().insert(caller);
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use axum::Json;

    #[test]
    fn test_cookie_wins_over_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; session_token=from-cookie"),
        );
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer from-header"),
        );

        assert_eq!(
            extract_token(&headers).unwrap(),
            Some("from-cookie".to_string())
        );
    }

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer abc"),
        );
        assert_eq!(extract_token(&headers).unwrap(), Some("abc".to_string()));
    }

    #[test]
    fn test_malformed_authorization_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));

        let (status, Json(body)) = extract_token(&headers).unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body.code.as_deref(), Some("INVALID_AUTH_FORMAT"));
    }

    #[test]
    fn test_no_credentials_is_anonymous() {
        assert_eq!(extract_token(&HeaderMap::new()).unwrap(), None);
        assert!(Caller::anonymous().require().is_err());
    }
}

//! Where a request's access token is read from.
//!
//! The recognized sources form one ordered list, resolved once at the
//! authentication boundary. The first source that carries a value wins.

use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap, StatusCode},
    Json,
};
use axum_extra::extract::cookie::CookieJar;
use service_core::error::ErrorResponse;

use crate::models::TokenClaims;
use crate::services::{AuthError, TokenService};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentitySource {
    /// `Authorization: Bearer <token>`
    Bearer,
    /// Named cookie holding the token
    Cookie(String),
}

impl IdentitySource {
    fn extract(&self, headers: &HeaderMap, jar: &CookieJar) -> Option<String> {
        match self {
            IdentitySource::Bearer => headers
                .get(header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.strip_prefix("Bearer "))
                .map(str::trim)
                .filter(|token| !token.is_empty())
                .map(str::to_string),
            IdentitySource::Cookie(name) => jar
                .get(name)
                .map(|cookie| cookie.value().to_string())
                .filter(|token| !token.is_empty()),
        }
    }
}

impl std::str::FromStr for IdentitySource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            None if s.eq_ignore_ascii_case("bearer") => Ok(IdentitySource::Bearer),
            Some(("cookie", name)) if !name.trim().is_empty() => {
                Ok(IdentitySource::Cookie(name.trim().to_string()))
            }
            _ => Err(format!("Invalid identity source: {}", s)),
        }
    }
}

/// Token from the first source in `sources` that has one.
pub fn resolve_token(sources: &[IdentitySource], headers: &HeaderMap) -> Option<String> {
    let jar = CookieJar::from_headers(headers);
    sources
        .iter()
        .find_map(|source| source.extract(headers, &jar))
}

/// Resolves and verifies the caller's access token.
pub fn authenticate(
    sources: &[IdentitySource],
    tokens: &TokenService,
    headers: &HeaderMap,
) -> Result<TokenClaims, AuthError> {
    let token = resolve_token(sources, headers).ok_or(AuthError::MissingCredentials)?;
    tokens.verify_access_token(&token)
}

/// Claims of the authenticated caller, placed in extensions by the guard.
pub struct AuthUser(pub TokenClaims);

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<ErrorResponse>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let claims = parts.extensions.get::<TokenClaims>().ok_or((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: "Auth claims missing from request extensions".to_string(),
                details: None,
            }),
        ))?;

        Ok(AuthUser(claims.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn sources() -> Vec<IdentitySource> {
        vec![
            IdentitySource::Bearer,
            IdentitySource::Cookie("access_token".into()),
            IdentitySource::Cookie("session_token".into()),
        ]
    }

    #[test]
    fn test_parse_sources() {
        assert_eq!("bearer".parse::<IdentitySource>().unwrap(), IdentitySource::Bearer);
        assert_eq!(
            "cookie:legacy".parse::<IdentitySource>().unwrap(),
            IdentitySource::Cookie("legacy".into())
        );
        assert!("cookie:".parse::<IdentitySource>().is_err());
        assert!("query:token".parse::<IdentitySource>().is_err());
    }

    #[test]
    fn test_bearer_wins_over_cookies() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));
        headers.insert(header::COOKIE, HeaderValue::from_static("access_token=from-cookie"));
        assert_eq!(resolve_token(&sources(), &headers).as_deref(), Some("from-header"));
    }

    #[test]
    fn test_legacy_cookie_fallback_in_order() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("session_token=legacy; theme=dark"),
        );
        assert_eq!(resolve_token(&sources(), &headers).as_deref(), Some("legacy"));

        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("session_token=legacy; access_token=current"),
        );
        assert_eq!(resolve_token(&sources(), &headers).as_deref(), Some("current"));
    }

    #[test]
    fn test_unlisted_source_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("session_token=legacy"));
        assert!(resolve_token(&[IdentitySource::Bearer], &headers).is_none());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(resolve_token(&[IdentitySource::Bearer], &headers).is_none());
    }
}

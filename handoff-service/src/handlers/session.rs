use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use axum_extra::extract::cookie::CookieJar;
use service_core::error::AppError;

use super::cookies::{with_token_cookies, without_token_cookies};
use crate::{
    dtos::{LogoutRequest, RefreshRequest},
    middleware::{identity::resolve_token, AuthUser},
    services::AuthError,
    AppState,
};

/// Refresh access token using refresh token
///
/// The token is read from the body first, then from the refresh cookie.
pub async fn refresh(
    State(state): State<AppState>,
    jar: CookieJar,
    body: Result<Json<RefreshRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let from_body = body.ok().and_then(|Json(req)| req.refresh_token);
    let token = from_body
        .filter(|t| !t.is_empty())
        .or_else(|| {
            jar.get(&state.config.cookies.refresh_name)
                .map(|c| c.value().to_string())
        })
        .ok_or(AuthError::MissingCredentials)?;

    let pair = state.sessions.refresh(&token).await?;
    let jar = with_token_cookies(jar, &state.config.cookies, &pair);

    Ok((StatusCode::OK, jar, Json(pair)))
}

/// Logout: revoke the session and clear cookies
pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    body: Result<Json<LogoutRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let token = body
        .ok()
        .and_then(|Json(req)| req.refresh_token)
        .filter(|t| !t.is_empty())
        .or_else(|| {
            jar.get(&state.config.cookies.refresh_name)
                .map(|c| c.value().to_string())
        })
        .or_else(|| resolve_token(&state.config.identity_sources, &headers));

    if let Some(token) = token {
        state.sessions.logout(&token).await?;
    }

    let jar = without_token_cookies(jar, &state.config.cookies);
    Ok((StatusCode::NO_CONTENT, jar))
}

/// Identity of the authenticated caller
pub async fn current_session(AuthUser(claims): AuthUser) -> impl IntoResponse {
    Json(serde_json::json!({
        "subjectId": claims.sub,
        "email": claims.email,
        "role": claims.role,
        "sessionId": claims.sid,
        "expiresAt": claims.exp,
    }))
}

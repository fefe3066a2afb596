use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    Json,
};
use axum_extra::extract::cookie::CookieJar;
use service_core::error::AppError;
use std::net::SocketAddr;
use validator::Validate;

use super::cookies::with_token_cookies;
use crate::{
    config::CATEGORY_AUTH_TICKET,
    dtos::{CallbackRequest, TicketRequest, TicketResponse},
    middleware::{client_ip_from, AuthUser},
    services::AuthError,
    utils::ValidatedJson,
    AppState,
};

/// Issue a handoff ticket for the authenticated caller.
///
/// A caller can only hand off its own identity: `email` and `role` must
/// match the session.
pub async fn issue_ticket(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ValidatedJson(req): ValidatedJson<TicketRequest>,
) -> Result<impl IntoResponse, AppError> {
    if !req.email.eq_ignore_ascii_case(&caller.email) || req.role != caller.role {
        tracing::warn!(
            subject_id = %caller.sub,
            requested_role = %req.role,
            "Ticket requested for a different identity"
        );
        return Err(AppError::Forbidden(anyhow::anyhow!(
            "Ticket identity must match the current session"
        )));
    }

    let issued = state.tickets.issue(&caller.email, caller.role, &req.aud, None)?;

    Ok((
        StatusCode::OK,
        Json(TicketResponse {
            token: issued.token,
            expires_at: issued.expires_at,
            expires_in: issued.expires_in,
        }),
    ))
}

/// Consume a handoff ticket: establish a session and redirect to the
/// role's landing page.
///
/// Every credential failure redirects to the login page with the same
/// opaque error code.
pub async fn consume_ticket(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    jar: CookieJar,
    body: Result<Json<CallbackRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let failure = || {
        Redirect::to(&format!("{}?error=invalid_ticket", state.config.ticket.login_url))
            .into_response()
    };

    let req = match body {
        Ok(Json(req)) if req.validate().is_ok() => req,
        _ => {
            tracing::debug!("Callback without a usable ticket");
            return Ok(failure());
        }
    };

    let claims = match state
        .tickets
        .verify(&req.token, &state.config.ticket.audience)
        .await
    {
        Ok(claims) => claims,
        Err(e @ (AuthError::Configuration(_) | AuthError::Store(_))) => return Err(e.into()),
        Err(_) => return Ok(failure()),
    };

    let pair = state
        .sessions
        .establish(&claims.sub, &claims.sub, claims.role)
        .await?;

    if let Some(ip) = client_ip_from(
        &headers,
        peer.map(|ConnectInfo(addr)| addr),
        &state.config.trusted_proxies,
    ) {
        state
            .rate_limiter
            .reset(&ip.to_string(), CATEGORY_AUTH_TICKET)
            .await?;
    }

    let jar = with_token_cookies(jar, &state.config.cookies, &pair);
    let destination = state.config.ticket.redirect_path(claims.role);

    Ok((jar, Redirect::to(&destination)).into_response())
}

//! Request guard: rate limit, then authenticate, then deduplicate, then run
//! the handler.

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::Response,
};
use service_core::error::AppError;
use service_core::utils::sha256_hex;
use std::net::{IpAddr, SocketAddr};

use super::identity;
use crate::services::{AuthError, BeginOutcome, CachedResponse, RateLimitDecision, RequestFingerprint};
use crate::AppState;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const IDEMPOTENCY_REPLAYED_HEADER: &str = "idempotency-replayed";

const MAX_IDEMPOTENCY_KEY_LENGTH: usize = 255;
const MAX_IDEMPOTENT_BODY_BYTES: usize = 1024 * 1024;

/// Which stages a route runs through. Rate limiting always applies.
#[derive(Debug, Clone, Copy)]
pub struct RequestGuard {
    pub category: &'static str,
    pub authenticate: bool,
    pub idempotent: bool,
}

impl RequestGuard {
    pub const fn new(category: &'static str) -> Self {
        Self {
            category,
            authenticate: false,
            idempotent: false,
        }
    }

    pub const fn authenticated(mut self) -> Self {
        self.authenticate = true;
        self
    }

    /// Mutating methods must carry `Idempotency-Key`.
    pub const fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }
}

/// Client address for rate limiting.
///
/// `X-Forwarded-For` is only read when the socket peer is a trusted proxy.
/// The chain is walked from the right and the first hop that is not itself
/// a trusted proxy is the client.
pub fn client_ip_from(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trusted_proxies: &[IpAddr],
) -> Option<IpAddr> {
    let peer_ip = peer?.ip();
    if !trusted_proxies.contains(&peer_ip) {
        return Some(peer_ip);
    }

    let hops: Vec<IpAddr> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|hop| hop.trim().parse::<IpAddr>())
        .collect::<Result<_, _>>()
        .unwrap_or_default();

    let client = hops
        .iter()
        .rev()
        .find(|ip| !trusted_proxies.contains(ip))
        .or_else(|| hops.first())
        .copied();

    client.or(Some(peer_ip))
}

pub fn client_ip(request: &Request, trusted_proxies: &[IpAddr]) -> Option<IpAddr> {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    client_ip_from(request.headers(), peer, trusted_proxies)
}

fn is_mutating(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

pub async fn request_guard_middleware(
    State((state, guard)): State<(AppState, RequestGuard)>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let client = match client_ip(&request, &state.config.trusted_proxies) {
        Some(ip) => ip.to_string(),
        None => {
            tracing::warn!("Could not determine IP for rate limiting");
            "unknown".to_string()
        }
    };

    if let RateLimitDecision::Deny {
        retry_after_seconds,
    } = state.rate_limiter.check(&client, guard.category).await?
    {
        return Err(AuthError::RateLimited {
            retry_after_seconds,
        }
        .into());
    }

    let subject = if guard.authenticate {
        let claims = identity::authenticate(
            &state.config.identity_sources,
            &state.tokens,
            request.headers(),
        )?;
        let subject = claims.sub.clone();
        request.extensions_mut().insert(claims);
        Some(subject)
    } else {
        None
    };

    if !guard.idempotent || !is_mutating(request.method()) {
        return Ok(next.run(request).await);
    }

    let key = request
        .headers()
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty() && k.len() <= MAX_IDEMPOTENCY_KEY_LENGTH)
        .map(str::to_string)
        .ok_or(AuthError::MissingIdempotencyKey)?;

    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_IDEMPOTENT_BODY_BYTES)
        .await
        .map_err(|e| AppError::BadRequest(anyhow::anyhow!("Unreadable request body: {}", e)))?;

    let fingerprint = RequestFingerprint::new(
        parts.method.as_str(),
        parts.uri.path(),
        sha256_hex(&bytes),
        subject.unwrap_or_else(|| client.clone()),
    );

    let reservation = match state.idempotency.begin(&key, &fingerprint).await? {
        BeginOutcome::New(reservation) => reservation,
        BeginOutcome::Replay(cached) => return Ok(replay_response(cached)),
        BeginOutcome::Conflict => return Err(AuthError::IdempotencyConflict.into()),
        BeginOutcome::InProgress => return Err(AuthError::IdempotencyInProgress.into()),
    };

    let response = next.run(Request::from_parts(parts, Body::from(bytes))).await;
    let (res_parts, res_body) = response.into_parts();

    let res_bytes = match axum::body::to_bytes(res_body, usize::MAX).await {
        Ok(b) => b,
        Err(e) => {
            if let Err(release_err) = state.idempotency.release(reservation).await {
                tracing::warn!(error = %release_err, "Failed to release idempotency key");
            }
            return Err(AppError::InternalError(anyhow::anyhow!(
                "Failed to read handler response: {}",
                e
            )));
        }
    };

    if res_parts.status.is_server_error() {
        // No record on failure: a retry with the same key executes fully.
        if let Err(e) = state.idempotency.release(reservation).await {
            tracing::warn!(error = %e, idempotency_key = %key, "Failed to release idempotency key");
        }
    } else {
        let cached = CachedResponse {
            status: res_parts.status.as_u16(),
            content_type: res_parts
                .headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            body: res_bytes.to_vec(),
        };
        if let Err(e) = state
            .idempotency
            .commit(reservation, cached, state.config.idempotency.ttl())
            .await
        {
            tracing::warn!(error = %e, idempotency_key = %key, "Failed to store idempotent response");
        }
    }

    Ok(Response::from_parts(res_parts, Body::from(res_bytes)))
}

fn replay_response(cached: CachedResponse) -> Response {
    let status = StatusCode::from_u16(cached.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = Response::new(Body::from(cached.body));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    if let Some(content_type) = cached
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
    {
        headers.insert(header::CONTENT_TYPE, content_type);
    }
    headers.insert(IDEMPOTENCY_REPLAYED_HEADER, HeaderValue::from_static("true"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn request_from(peer: [u8; 4], forwarded: Option<&str>) -> Request {
        let mut builder = axum::http::Request::builder();
        if let Some(value) = forwarded {
            builder = builder.header("x-forwarded-for", value);
        }
        let mut request = builder.body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((peer, 4000))));
        request
    }

    #[test]
    fn test_client_ip_ignores_forwarded_header_from_untrusted_peer() {
        let request = request_from([192, 0, 2, 1], Some("203.0.113.7"));
        assert_eq!(client_ip(&request, &[]), Some(ip("192.0.2.1")));
        assert_eq!(
            client_ip(&request, &[ip("10.0.0.1")]),
            Some(ip("192.0.2.1"))
        );
    }

    #[test]
    fn test_client_ip_behind_trusted_proxies() {
        let trusted = [ip("10.0.0.1"), ip("10.0.0.2")];
        let request = request_from([10, 0, 0, 1], Some("198.51.100.9, 203.0.113.7, 10.0.0.2"));
        // Leftmost hops are client supplied; the rightmost untrusted one is authoritative.
        assert_eq!(client_ip(&request, &trusted), Some(ip("203.0.113.7")));
    }

    #[test]
    fn test_client_ip_trusted_peer_without_usable_header() {
        let trusted = [ip("10.0.0.1")];
        assert_eq!(
            client_ip(&request_from([10, 0, 0, 1], None), &trusted),
            Some(ip("10.0.0.1"))
        );
        assert_eq!(
            client_ip(&request_from([10, 0, 0, 1], Some("not-an-ip")), &trusted),
            Some(ip("10.0.0.1"))
        );
    }

    #[test]
    fn test_client_ip_unknown_without_peer() {
        let request = axum::http::Request::builder()
            .header("x-forwarded-for", "203.0.113.7")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_ip(&request, &[ip("203.0.113.7")]), None);
    }

    #[tokio::test]
    async fn test_replay_response_keeps_non_utf8_body() {
        let cached = CachedResponse {
            status: 200,
            content_type: Some("application/octet-stream".to_string()),
            body: vec![0xff, 0x00, 0xfe, b'a'],
        };
        let response = replay_response(cached);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(bytes.as_ref(), &[0xff, 0x00, 0xfe, b'a']);
    }

    #[test]
    fn test_replay_response_marks_header() {
        let cached = CachedResponse::json(201, &serde_json::json!({"id": "inv_1"}));
        let response = replay_response(cached);
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()[IDEMPOTENCY_REPLAYED_HEADER], "true");
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
    }
}

pub mod config;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod utils;

use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use service_core::middleware::{
    metrics_middleware, request_id_middleware, security_headers_middleware, REQUEST_ID_HEADER,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::{HandoffConfig, CATEGORY_API, CATEGORY_AUTH_REFRESH, CATEGORY_AUTH_TICKET};
use crate::middleware::{guard::IDEMPOTENCY_KEY_HEADER, request_guard_middleware, RequestGuard};
use crate::services::{
    Clock, IdempotencyStore, KeyValueStore, NonceStore, RateLimiter, SessionService, SessionStore,
    TicketService, TokenService,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<HandoffConfig>,
    pub clock: Arc<dyn Clock>,
    pub store: Arc<dyn KeyValueStore>,
    pub tickets: TicketService,
    pub tokens: TokenService,
    pub sessions: SessionService,
    pub idempotency: IdempotencyStore,
    pub rate_limiter: RateLimiter,
}

impl AppState {
    /// Wires every service onto one store backend and clock.
    pub fn new(config: HandoffConfig, store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        let nonces = NonceStore::new(store.clone());
        let tickets = TicketService::new(&config.ticket, nonces, clock.clone());
        let tokens = TokenService::new(&config.token, clock.clone());
        let sessions = SessionService::new(
            tokens.clone(),
            SessionStore::new(store.clone(), clock.clone()),
            config.token.rotate_refresh_tokens,
        );
        let idempotency = IdempotencyStore::new(
            store.clone(),
            clock.clone(),
            config.idempotency.reservation_ttl(),
        );
        let rate_limiter = RateLimiter::new(store.clone(), clock.clone(), &config.rate_limit);

        Self {
            config: Arc::new(config),
            clock,
            store,
            tickets,
            tokens,
            sessions,
            idempotency,
            rate_limiter,
        }
    }
}

/// Builds the HTTP surface. `api` holds the business routes, mounted under
/// `/api` behind the full request guard.
pub fn build_router(state: AppState, api: Router<AppState>) -> Router {
    let guarded = |router: Router<AppState>, guard: RequestGuard| {
        router.route_layer(from_fn_with_state(
            (state.clone(), guard),
            request_guard_middleware,
        ))
    };

    let ticket_issue = guarded(
        Router::new().route("/sso/ticket", post(handlers::issue_ticket)),
        RequestGuard::new(CATEGORY_AUTH_TICKET).authenticated(),
    );

    let ticket_callback = guarded(
        Router::new().route("/sso/callback", post(handlers::consume_ticket)),
        RequestGuard::new(CATEGORY_AUTH_TICKET),
    );

    let session_routes = guarded(
        Router::new()
            .route("/auth/refresh", post(handlers::refresh))
            .route("/auth/logout", post(handlers::logout)),
        RequestGuard::new(CATEGORY_AUTH_REFRESH),
    );

    let api_routes = guarded(
        Router::new().nest("/api", api),
        RequestGuard::new(CATEGORY_API).authenticated().idempotent(),
    );

    let cors = CorsLayer::new()
        .allow_origin(
            state
                .config
                .allowed_origins
                .iter()
                .filter_map(|o| match o.parse::<HeaderValue>() {
                    Ok(origin) => Some(origin),
                    Err(e) => {
                        tracing::error!("Invalid CORS origin '{}': {}. Skipping.", o, e);
                        None
                    }
                })
                .collect::<Vec<HeaderValue>>(),
        )
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static(IDEMPOTENCY_KEY_HEADER),
        ])
        .allow_credentials(true);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics::metrics))
        .merge(ticket_issue)
        .merge(ticket_callback)
        .merge(session_routes)
        .merge(api_routes)
        .with_state(state.clone())
        .layer(from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    version = ?request.version(),
                )
            },
        ))
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(cors)
}

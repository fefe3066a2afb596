//! Test helpers for handoff-service integration tests.
//!
//! Every test gets its own in-memory store and a manual clock, and drives
//! the router through `tower::ServiceExt::oneshot`.

#![allow(dead_code)]

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header, HeaderMap, Method, Request, StatusCode},
    routing::post,
    Json, Router,
};
use handoff_service::{
    build_router,
    config::HandoffConfig,
    handlers,
    models::{Role, TokenPair},
    services::{Clock, KeyValueStore, ManualClock, MemoryStore},
    AppState,
};
use http_body_util::BodyExt;
use service_core::config::Config;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tower::util::ServiceExt;

pub const TICKET_SECRET: &str = "test-ticket-secret";
pub const TOKEN_SECRET: &str = "test-token-secret";
pub const CLIENT_IP: &str = "203.0.113.10";

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub clock: ManualClock,
    /// Executions of the business handlers mounted under `/api`.
    pub executions: Arc<AtomicUsize>,
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl TestResponse {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn set_cookies(&self) -> Vec<String> {
        self.headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok().map(str::to_string))
            .collect()
    }

    /// Value of the cookie `name` from the response's Set-Cookie headers.
    pub fn cookie(&self, name: &str) -> Option<String> {
        let prefix = format!("{}=", name);
        self.set_cookies().into_iter().find_map(|c| {
            c.split(';')
                .next()
                .and_then(|pair| pair.strip_prefix(&prefix))
                .map(str::to_string)
        })
    }
}

pub fn test_config(overrides: &[(&str, &str)]) -> HandoffConfig {
    let mut vars: HashMap<String, String> = HashMap::from([
        ("TICKET_SIGNING_SECRET".to_string(), TICKET_SECRET.to_string()),
        ("TOKEN_SIGNING_SECRET".to_string(), TOKEN_SECRET.to_string()),
        ("TICKET_AUDIENCE".to_string(), "tenant-app".to_string()),
        ("TICKET_LOGIN_URL".to_string(), "/login".to_string()),
    ]);
    for (k, v) in overrides {
        vars.insert(k.to_string(), v.to_string());
    }
    HandoffConfig::from_lookup(Config::default(), move |key| vars.get(key).cloned()).unwrap()
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(test_config(&[]))
    }

    pub fn with_config(config: HandoffConfig) -> Self {
        let clock = ManualClock::default();
        let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new(clock_arc.clone()));
        let state = AppState::new(config, store, clock_arc);

        let executions = Arc::new(AtomicUsize::new(0));
        let router = build_router(state.clone(), business_routes(executions.clone()));

        Self {
            router,
            state,
            clock,
            executions,
        }
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        headers: &[(&str, &str)],
        body: Option<serde_json::Value>,
    ) -> TestResponse {
        self.request_from(CLIENT_IP, method, uri, headers, body).await
    }

    /// Sends a request whose socket peer is `peer`, as `ConnectInfo` would
    /// report it behind `into_make_service_with_connect_info`.
    pub async fn request_from(
        &self,
        peer: &str,
        method: Method,
        uri: &str,
        headers: &[(&str, &str)],
        body: Option<serde_json::Value>,
    ) -> TestResponse {
        let peer: SocketAddr = SocketAddr::new(peer.parse().unwrap(), 40_000);
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .extension(ConnectInfo(peer));
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let response = self
            .router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes().to_vec();

        TestResponse {
            status,
            headers,
            body,
        }
    }

    /// Logs a user in directly through the session service.
    pub async fn login(&self, email: &str, role: Role) -> TokenPair {
        self.state
            .sessions
            .establish(&format!("user:{}", email), email, role)
            .await
            .unwrap()
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

/// `/api` routes: an invoice endpoint that counts its executions and a
/// flaky one that fails with 500 on its first call.
fn business_routes(executions: Arc<AtomicUsize>) -> Router<AppState> {
    let create = executions.clone();
    let flaky = executions;

    Router::new()
        .route(
            "/invoices",
            post(move |Json(body): Json<serde_json::Value>| {
                let create = create.clone();
                async move {
                    let n = create.fetch_add(1, Ordering::SeqCst) + 1;
                    (
                        StatusCode::CREATED,
                        Json(serde_json::json!({ "id": format!("inv_{}", n), "amount": body["amount"] })),
                    )
                }
            }),
        )
        .route(
            "/flaky",
            post(move || {
                let flaky = flaky.clone();
                async move {
                    if flaky.fetch_add(1, Ordering::SeqCst) == 0 {
                        (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "error": "boom" })))
                    } else {
                        (StatusCode::OK, Json(serde_json::json!({ "ok": true })))
                    }
                }
            }),
        )
        .route("/me", axum::routing::get(handlers::current_session))
}

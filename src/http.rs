//! HTTP surface: axum router, shared state, and thin handlers.
//!
//! Grounded on the teacher's `main.rs::create_router` — same
//! `ServiceBuilder` layering (`TraceLayer` then `CorsLayer`) and the same
//! plain-`Json<Value>` shape for `/health` — generalized to the gateway's
//! route table and backed by [`crate::lifecycle::Lifecycle`] instead of
//! the teacher's auth/convex services.

use crate::config::Config;
use crate::error::GatewayError;
use crate::lifecycle::Lifecycle;
use crate::log_store::LogStore;
use crate::rate_limit::RateLimiter;
use crate::registry::Registry;
use crate::types::ChatRequest;
use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<Lifecycle>,
    pub registry: Arc<Registry>,
    pub log_store: Arc<LogStore>,
    pub rate_limiter: Arc<RateLimiter>,
    pub config: Arc<Config>,
}

pub fn create_router(state: AppState) -> Router {
    let cors = if state.config.allowed_origins.is_empty() {
        CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
    } else {
        let origins: Vec<_> = state
            .config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(origins).allow_methods(Any).allow_headers(Any)
    };

    let max_content_length = state.config.validation.max_content_length_bytes;

    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/queue/status", get(queue_status))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/:backend_name/chat/completions", post(backend_chat_completions))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(middleware::from_fn(move |headers: HeaderMap, req: Request<Body>, next: Next| {
                    content_length_guard(headers, req, next, max_content_length)
                })),
        )
        .with_state(state)
}

async fn content_length_guard(headers: HeaderMap, req: Request<Body>, next: Next, max_bytes: u64) -> Response {
    if let Some(raw) = headers.get(axum::http::header::CONTENT_LENGTH) {
        match raw.to_str().ok().and_then(|s| s.parse::<u64>().ok()) {
            Some(len) if len <= max_bytes => {}
            _ => {
                return (StatusCode::BAD_REQUEST, Json(json!({"error": "content-length missing, malformed, or too large"})))
                    .into_response();
            }
        }
    }
    next.run(req).await
}

async fn root() -> &'static str {
    "ok"
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "healthy", "timestamp": chrono::Utc::now() }))
}

async fn queue_status(State(state): State<AppState>) -> Json<Value> {
    let mut pools = Vec::new();
    for entry in state.registry.all() {
        if let Some(pool) = &entry.pool {
            let stats = pool.stats().await;
            pools.push(json!({
                "backend": entry.backend.name(),
                "stats": stats,
            }));
        }
    }
    Json(json!({ "pools": pools }))
}

async fn list_models(State(state): State<AppState>) -> Json<Value> {
    let models: Vec<Value> = state
        .registry
        .all()
        .iter()
        .map(|entry| {
            json!({
                "id": entry.backend.name(),
                "object": "model",
                "owned_by": entry.backend.descriptor().provider_tag.clone().unwrap_or_else(|| entry.backend.name().to_string()),
            })
        })
        .collect();
    Json(json!({ "object": "list", "data": models }))
}

async fn chat_completions(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = match parse_request(&body, state.config.validation.strict) {
        Ok(request) => request,
        Err(e) => return error_response_from(&e),
    };
    dispatch(state, addr, headers, request).await
}

async fn backend_chat_completions(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(backend_name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut request = match parse_request(&body, state.config.validation.strict) {
        Ok(request) => request,
        Err(e) => return error_response_from(&e),
    };
    request.backend = Some(backend_name);
    dispatch(state, addr, headers, request).await
}

/// Parses a chat-completion request body, rejecting unknown top-level
/// fields first when `strict` is set (spec.md:255) — plain `serde`
/// deserialization alone would just silently drop them.
fn parse_request(body: &[u8], strict: bool) -> Result<ChatRequest, GatewayError> {
    let raw: Value = serde_json::from_slice(body).map_err(|e| GatewayError::Validation(format!("invalid JSON: {e}")))?;
    if strict {
        ChatRequest::reject_unknown_fields(&raw).map_err(GatewayError::Validation)?;
    }
    serde_json::from_value(raw).map_err(|e| GatewayError::Validation(format!("invalid request body: {e}")))
}

async fn dispatch(state: AppState, addr: SocketAddr, headers: HeaderMap, request: ChatRequest) -> Response {
    let client_ip = addr.ip().to_string();
    if !state.rate_limiter.check(&client_ip) {
        return error_response(&GatewayError::Validation("rate limit exceeded".to_string()), StatusCode::TOO_MANY_REQUESTS);
    }

    let user_agent = headers.get(axum::http::header::USER_AGENT).and_then(|v| v.to_str().ok()).map(str::to_string);
    let cancel = tokio_util::sync::CancellationToken::new();

    if request.stream {
        let stream = state.lifecycle.clone().stream(request, Some(client_ip), user_agent, cancel);
        Sse::new(stream).keep_alive(KeepAlive::new()).into_response()
    } else {
        match state.lifecycle.handle(request, Some(client_ip), user_agent, cancel).await {
            Ok(response) => Json(response).into_response(),
            Err(e) => error_response_from(&e),
        }
    }
}

fn error_response_from(error: &GatewayError) -> Response {
    let status = StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    error_response(error, status)
}

fn error_response(error: &GatewayError, status: StatusCode) -> Response {
    (status, Json(json!({ "error": error.client_message() }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::AllocationBalancer;
    use crate::config::SafeguardThresholds;
    use crate::lifecycle::Lifecycle;
    use crate::session::SessionStore;
    use crate::subscription::SubscriptionManager;
    use axum_test::TestServer;
    use std::time::Duration;

    #[test]
    fn parse_request_rejects_unknown_fields_in_strict_mode() {
        let body = br#"{"messages":[{"role":"user","content":"hi"}],"bogus_field":1}"#;
        assert!(parse_request(body, true).is_err());
    }

    #[test]
    fn parse_request_drops_unknown_fields_when_lenient() {
        let body = br#"{"messages":[{"role":"user","content":"hi"}],"bogus_field":1}"#;
        assert!(parse_request(body, false).is_ok());
    }

    #[test]
    fn error_response_uses_the_error_status_code() {
        let response = error_response_from(&GatewayError::Validation("bad".to_string()));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    fn test_state() -> AppState {
        let config = Arc::new(Config::from_env());
        let storage = Arc::new(crate::storage::Storage::new(config.storage.max_entries, config.storage.eviction_batch_percent));
        let safeguards = SafeguardThresholds {
            health_check_weekly_ratio: 0.95,
            allocation_weekly_ratio: 0.85,
            status_limited_ratio: 0.95,
            status_approaching_ratio: 0.8,
        };
        let subscriptions = Arc::new(SubscriptionManager::new(storage.clone(), 10, safeguards));
        let sessions = Arc::new(SessionStore::new(storage.clone(), 10));
        let registry = Arc::new(Registry::new(vec![], reqwest::Client::new(), Duration::from_secs(5), Duration::from_secs(5), Duration::from_secs(5)));
        let balancer = Arc::new(AllocationBalancer::new(subscriptions.clone(), sessions.clone(), 0.85, true, config.rebalance));
        let notify = Arc::new(crate::notify::NotificationManager::new(vec![], None, Duration::from_secs(5), reqwest::Client::new()));
        let usage = Arc::new(crate::usage::UsageTracker::new(storage.clone(), subscriptions.clone(), safeguards));
        let log_store = Arc::new(LogStore::new(100));
        let lifecycle = Arc::new(Lifecycle {
            registry: registry.clone(),
            balancer,
            subscriptions,
            sessions,
            usage,
            notify,
            log_store: log_store.clone(),
            validation: config.validation.clone(),
        });
        AppState { lifecycle, registry, log_store, rate_limiter: Arc::new(RateLimiter::new(Duration::from_secs(60), 1000)), config }
    }

    #[tokio::test]
    async fn health_endpoint_reports_healthy() {
        let server = TestServer::new(create_router(test_state())).unwrap();
        let response = server.get("/health").await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn models_endpoint_lists_registered_backends() {
        let server = TestServer::new(create_router(test_state())).unwrap();
        let response = server.get("/v1/models").await;
        response.assert_status_ok();
    }

    #[tokio::test]
    async fn queue_status_reports_no_pools_when_registry_is_empty() {
        let server = TestServer::new(create_router(test_state())).unwrap();
        let response = server.get("/queue/status").await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert!(body["pools"].as_array().unwrap().is_empty());
    }
}

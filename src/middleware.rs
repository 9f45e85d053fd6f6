//! HTTP middleware: request-id propagation, bearer auth on `/v1/*` and
//! per-client rate limiting.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use uuid::Uuid;

use crate::routes::common::RequestId;

/// Echoes an incoming `X-Request-Id` or generates one, exposing it to
/// handlers through a request extension and stamping every response.
pub async fn request_id(mut request: Request<Body>, next: Next) -> Response {
    let incoming = request
        .headers()
        .get("X-Request-Id")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    let id = incoming.unwrap_or_else(|| Uuid::new_v4().to_string());

    request.extensions_mut().insert(RequestId(id.clone()));
    let mut response = next.run(request).await;
    if let Ok(header) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("X-Request-Id", header);
    }
    response
}

/// Bearer-token auth on `/v1/*`. An empty configured token disables auth.
pub async fn auth(
    State(required_token): State<Arc<String>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !request.uri().path().starts_with("/v1/") || required_token.is_empty() {
        return next.run(request).await;
    }

    let provided = request
        .headers()
        .get("Authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .unwrap_or_default();

    if provided.is_empty() || provided != required_token.as_str() {
        let id = request
            .extensions()
            .get::<RequestId>()
            .map(|id| id.0.clone())
            .unwrap_or_else(|| "unknown".to_string());
        let body = json!({
            "error": {"code": "unauthorized", "message": "authentication required"},
            "request_id": id,
        });
        return (StatusCode::UNAUTHORIZED, Json(body)).into_response();
    }

    next.run(request).await
}

struct Visitor {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

/// Token-bucket limiter keyed by client address.
pub struct RateLimiter {
    rps: f64,
    burst: f64,
    visitors: Mutex<HashMap<String, Visitor>>,
}

const VISITOR_IDLE_SECS: u64 = 180;

impl RateLimiter {
    pub fn new(rps: f64, burst: u32) -> Self {
        let rps = if rps <= 0.0 { 20.0 } else { rps };
        let burst = if burst == 0 { 40 } else { burst };
        Self { rps, burst: burst as f64, visitors: Mutex::new(HashMap::new()) }
    }

    fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut visitors = self.visitors.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        // Idle visitors are reaped opportunistically instead of on a timer.
        if visitors.len() > 1024 {
            visitors.retain(|_, visitor| {
                now.duration_since(visitor.last_seen).as_secs() < VISITOR_IDLE_SECS
            });
        }

        let visitor = visitors.entry(key.to_string()).or_insert(Visitor {
            tokens: self.burst,
            last_refill: now,
            last_seen: now,
        });

        let elapsed = now.duration_since(visitor.last_refill).as_secs_f64();
        visitor.tokens = (visitor.tokens + elapsed * self.rps).min(self.burst);
        visitor.last_refill = now;
        visitor.last_seen = now;

        if visitor.tokens >= 1.0 {
            visitor.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

pub async fn rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let key = request
        .headers()
        .get("X-Forwarded-For")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("local")
        .to_string();

    if !limiter.allow(&key) {
        let id = request
            .extensions()
            .get::<RequestId>()
            .map(|id| id.0.clone())
            .unwrap_or_else(|| "unknown".to_string());
        let body = json!({
            "error": {"code": "rate_limited", "message": "too many requests"},
            "request_id": id,
        });
        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        response.headers_mut().insert("Retry-After", HeaderValue::from_static("1"));
        return response;
    }

    next.run(request).await
}

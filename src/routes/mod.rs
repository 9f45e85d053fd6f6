pub mod common;
pub mod health;
pub mod jobs;
pub mod metrics;
pub mod reports;
pub mod suggestions;
pub mod summaries;

use std::sync::Arc;

use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::{from_fn, from_fn_with_state};
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum::routing::any;
use axum::{Extension, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;
use crate::middleware::{auth, rate_limit, request_id, RateLimiter};
use self::common::RequestId;

#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    pub auth_token: String,
    pub rate_limit_rps: f64,
    pub rate_limit_burst: u32,
    pub cors_origins: Vec<String>,
}

const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Builds the HTTP surface: routes, middleware stack and the optional
/// Prometheus scrape endpoint.
pub fn build_router(
    state: AppState,
    config: RouterConfig,
    prometheus: Option<Arc<PrometheusHandle>>,
) -> Router {
    let mut router = Router::new()
        .route("/healthz", any(health::healthz))
        .route("/v1/suggestions", any(suggestions::suggestions))
        .route("/v1/summaries", any(summaries::summaries))
        .route("/v1/reports", any(reports::reports))
        .route("/v1/jobs/:id", any(jobs::job_status))
        .fallback(not_found)
        .with_state(state);

    if let Some(handle) = prometheus {
        router = router.route(
            "/metrics",
            axum::routing::get(metrics::prometheus_metrics).with_state(handle),
        );
    }

    let limiter = Arc::new(RateLimiter::new(config.rate_limit_rps, config.rate_limit_burst));
    let token = Arc::new(config.auth_token);

    router
        .layer(from_fn_with_state(token, auth))
        .layer(from_fn_with_state(limiter, rate_limit))
        .layer(cors_layer(&config.cors_origins))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(from_fn(request_id))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> =
        origins.iter().filter_map(|origin| origin.parse().ok()).collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            AUTHORIZATION,
            CONTENT_TYPE,
            HeaderName::from_static("idempotency-key"),
            HeaderName::from_static("x-request-id"),
        ])
}

async fn not_found(request_id: Option<Extension<RequestId>>) -> Response {
    let id = request_id.map(|Extension(id)| id.0).unwrap_or_else(|| "unknown".to_string());
    let body = json!({
        "error": {"code": "not_found", "message": "resource not found"},
        "request_id": id,
    });
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}

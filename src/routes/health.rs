use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum::Extension;
use serde_json::json;

use super::common::{method_not_allowed, RequestId};

/// GET /healthz — liveness probe.
pub async fn healthz(method: Method, Extension(request_id): Extension<RequestId>) -> Response {
    if method != Method::GET {
        return method_not_allowed(request_id.as_str());
    }
    (StatusCode::OK, Json(json!({"status": "ok"}))).into_response()
}

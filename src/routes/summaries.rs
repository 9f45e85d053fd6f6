use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum::Extension;
use chrono::SecondsFormat;
use serde_json::json;

use super::common::{
    hash_payload, internal_error, invalid_request, method_not_allowed, policy_violation,
    RequestId, MIN_IDEMPOTENCY_KEY_LEN,
};
use crate::app_state::AppState;
use crate::models::api::SummaryRequest;
use crate::services::policy;

/// POST /v1/summaries — enqueue an async summary job.
pub async fn summaries(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if method != Method::POST {
        return method_not_allowed(request_id.as_str());
    }

    let idempotency_key = headers
        .get("Idempotency-Key")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .unwrap_or_default()
        .to_string();
    if idempotency_key.chars().count() < MIN_IDEMPOTENCY_KEY_LEN {
        return invalid_request("Idempotency-Key header is required", request_id.as_str());
    }

    let mut request: SummaryRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => return invalid_request("invalid JSON payload", request_id.as_str()),
    };
    if request.conversation.normalize().is_err() {
        return invalid_request("conversation fields are required", request_id.as_str());
    }
    if request.summary_type.is_empty() {
        request.summary_type = "short".to_string();
    }
    if !matches!(request.summary_type.as_str(), "short" | "full") {
        return invalid_request("summary_type must be short or full", request_id.as_str());
    }

    let raw_payload = match serde_json::to_vec(&request) {
        Ok(payload) => payload,
        Err(_) => return internal_error("failed to encode request", request_id.as_str()),
    };
    let payload_hash = hash_payload(&raw_payload);

    if let Some(entry) = state.idempotency.get(&idempotency_key) {
        if entry.payload_hash != payload_hash {
            return super::common::write_error(
                StatusCode::CONFLICT,
                "idempotency_conflict",
                "Idempotency-Key already used with different payload",
                request_id.as_str(),
            );
        }
        return accepted_response(&entry.job_id, entry.created_at);
    }

    if policy::validate_manual_only(&raw_payload).is_err() {
        return policy_violation("automatic send is not allowed", request_id.as_str());
    }
    if policy::enforce_content_policy(&raw_payload).is_err() {
        return policy_violation("request blocked by policy", request_id.as_str());
    }
    let masked_payload = policy::mask_pii_json(&raw_payload);

    let job = match state
        .jobs
        .enqueue_summary(
            &request.conversation.tenant_id,
            &request.conversation.conversation_id,
            &masked_payload,
        )
        .await
    {
        Ok(job) => job,
        Err(err) => {
            tracing::error!(error = %err, "failed to enqueue summary job");
            return internal_error("failed to enqueue summary job", request_id.as_str());
        }
    };

    state.idempotency.put(&idempotency_key, payload_hash, &job.id);
    accepted_response(&job.id, job.created_at)
}

pub(super) fn accepted_response(job_id: &str, accepted_at: chrono::DateTime<chrono::Utc>) -> Response {
    let body = json!({
        "job_id": job_id,
        "status": "pending",
        "status_url": format!("/v1/jobs/{job_id}"),
        "accepted_at": accepted_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
        "hitl": policy::default_hitl_metadata(),
    });
    let mut response = (StatusCode::ACCEPTED, Json(body)).into_response();
    response
        .headers_mut()
        .insert("Retry-After", axum::http::HeaderValue::from_static("2"));
    response
}

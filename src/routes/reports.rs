use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum::Extension;
use chrono::SecondsFormat;
use serde_json::json;

use super::common::{
    hash_payload, internal_error, invalid_request, method_not_allowed, parse_optional_datetime,
    policy_violation, RequestId, MIN_IDEMPOTENCY_KEY_LEN,
};
use super::summaries::accepted_response;
use crate::app_state::AppState;
use crate::models::api::{ReportListQuery, ReportRequest};
use crate::models::job::ReportListFilter;
use crate::services::policy;

/// /v1/reports — POST enqueues a report job, GET lists report jobs.
pub async fn reports(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    method: Method,
    headers: HeaderMap,
    Query(query): Query<ReportListQuery>,
    body: Bytes,
) -> Response {
    match method {
        Method::POST => create_report(state, request_id, headers, body).await,
        Method::GET => list_reports(state, request_id, query).await,
        _ => method_not_allowed(request_id.as_str()),
    }
}

async fn create_report(
    state: AppState,
    request_id: RequestId,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let idempotency_key = headers
        .get("Idempotency-Key")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .unwrap_or_default()
        .to_string();
    if idempotency_key.chars().count() < MIN_IDEMPOTENCY_KEY_LEN {
        return invalid_request("Idempotency-Key header is required", request_id.as_str());
    }

    let mut request: ReportRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => return invalid_request("invalid JSON payload", request_id.as_str()),
    };
    if request.conversation.normalize().is_err() {
        return invalid_request("conversation fields are required", request_id.as_str());
    }
    if request.report_type.is_empty() {
        request.report_type = "timeline".to_string();
    }
    if !matches!(request.report_type.as_str(), "timeline" | "temas" | "atendimento") {
        return invalid_request(
            "report_type must be timeline, temas or atendimento",
            request_id.as_str(),
        );
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
        .enqueue_report(
            &request.conversation.tenant_id,
            &request.conversation.conversation_id,
            &masked_payload,
        )
        .await
    {
        Ok(job) => job,
        Err(err) => {
            tracing::error!(error = %err, "failed to enqueue report job");
            return internal_error("failed to enqueue report job", request_id.as_str());
        }
    };

    state.idempotency.put(&idempotency_key, payload_hash, &job.id);
    accepted_response(&job.id, job.created_at)
}

async fn list_reports(state: AppState, request_id: RequestId, query: ReportListQuery) -> Response {
    let page = query.page.filter(|page| *page > 0).unwrap_or(1);
    let page_size = query
        .page_size
        .filter(|size| *size > 0 && *size <= 100)
        .unwrap_or(20);

    let from = match parse_optional_datetime(query.from.as_deref()) {
        Ok(from) => from,
        Err(()) => return invalid_request("invalid from date", request_id.as_str()),
    };
    let to = match parse_optional_datetime(query.to.as_deref()) {
        Ok(to) => to,
        Err(()) => return invalid_request("invalid to date", request_id.as_str()),
    };

    let filter = ReportListFilter {
        tenant_id: query.tenant_id.unwrap_or_default().trim().to_string(),
        page,
        page_size,
        from,
        to,
        topic: query.topic.unwrap_or_default().trim().to_string(),
    };

    let (items, total) = match state.jobs.list_reports(filter).await {
        Ok(result) => result,
        Err(err) => {
            tracing::error!(error = %err, "failed to list reports");
            return internal_error("failed to list reports", request_id.as_str());
        }
    };

    let payload_items: Vec<serde_json::Value> = items
        .iter()
        .map(|item| {
            json!({
                "report_id": item.report_id,
                "conversation_id": item.conversation_id,
                "status": item.status,
                "created_at": item.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
                "title": item.title,
            })
        })
        .collect();

    let response = json!({
        "items": payload_items,
        "page": page,
        "page_size": page_size,
        "total": total,
        "has_next": page * page_size < total,
    });
    (StatusCode::OK, Json(response)).into_response()
}

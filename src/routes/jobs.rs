use axum::extract::{Path, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum::Extension;
use serde_json::json;

use super::common::{internal_error, invalid_request, method_not_allowed, write_error, RequestId};
use crate::app_state::AppState;
use crate::db::RepositoryError;

/// GET /v1/jobs/{id} — async job status poll.
pub async fn job_status(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    method: Method,
    Path(job_id): Path<String>,
) -> Response {
    if method != Method::GET {
        return method_not_allowed(request_id.as_str());
    }

    let job_id = job_id.trim();
    if job_id.is_empty() {
        return invalid_request("job_id is required", request_id.as_str());
    }

    let job = match state.jobs.get_job(job_id).await {
        Ok(job) => job,
        Err(RepositoryError::NotFound) => {
            return write_error(StatusCode::NOT_FOUND, "not_found", "job not found", request_id.as_str());
        }
        Err(err) => {
            tracing::error!(job_id, error = %err, "failed to load job");
            return internal_error("failed to load job", request_id.as_str());
        }
    };

    let mut response = json!({
        "job_id": job.id,
        "status": job.status,
        "kind": job.kind,
        "updated_at": job.updated_at,
    });
    if !job.result.is_empty() {
        response["result"] = decoded_or_raw(&job.result);
    }
    if !job.error_message.trim().is_empty() {
        response["error"] = json!({
            "code": "processing_error",
            "message": job.error_message,
        });
    }

    (StatusCode::OK, Json(response)).into_response()
}

fn decoded_or_raw(value: &[u8]) -> serde_json::Value {
    serde_json::from_slice(value)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(value).into_owned()))
}

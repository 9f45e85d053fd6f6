//! Shared handler plumbing: the error envelope, request-id propagation,
//! conversation validation and the idempotency store.

use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::Mutex;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use fnv::FnvHasher;
use serde_json::json;

/// Request id propagated by the request-id middleware.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

pub fn write_error(
    status: StatusCode,
    code: &str,
    message: &str,
    request_id: &str,
) -> Response {
    let body = json!({
        "error": {"code": code, "message": message},
        "request_id": request_id,
    });
    (status, Json(body)).into_response()
}

pub fn invalid_request(message: &str, request_id: &str) -> Response {
    write_error(StatusCode::BAD_REQUEST, "invalid_request", message, request_id)
}

pub fn method_not_allowed(request_id: &str) -> Response {
    write_error(
        StatusCode::METHOD_NOT_ALLOWED,
        "method_not_allowed",
        "method not allowed",
        request_id,
    )
}

pub fn policy_violation(message: &str, request_id: &str) -> Response {
    write_error(StatusCode::UNPROCESSABLE_ENTITY, "policy_violation", message, request_id)
}

pub fn internal_error(message: &str, request_id: &str) -> Response {
    write_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message, request_id)
}

/// Parses an optional RFC3339 timestamp query/body value.
pub fn parse_optional_datetime(value: Option<&str>) -> Result<Option<DateTime<Utc>>, ()> {
    match value {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(raw.trim())
            .map(|parsed| Some(parsed.with_timezone(&Utc)))
            .map_err(|_| ()),
    }
}

/// 64-bit FNV-1a over the canonical JSON encoding of a request body.
pub fn hash_payload(payload: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(payload);
    hasher.finish()
}

#[derive(Debug, Clone)]
pub struct IdempotencyEntry {
    pub payload_hash: u64,
    pub job_id: String,
    pub created_at: DateTime<Utc>,
}

/// Replay store for async endpoints: a repeated `Idempotency-Key` with the
/// same payload hash returns the prior job id; a different hash conflicts.
#[derive(Default)]
pub struct IdempotencyStore {
    entries: Mutex<HashMap<String, IdempotencyEntry>>,
}

impl IdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<IdempotencyEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    pub fn put(&self, key: &str, payload_hash: u64, job_id: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(
                key.to_string(),
                IdempotencyEntry {
                    payload_hash,
                    job_id: job_id.to_string(),
                    created_at: Utc::now(),
                },
            );
    }
}

pub const MIN_IDEMPOTENCY_KEY_LEN: usize = 16;

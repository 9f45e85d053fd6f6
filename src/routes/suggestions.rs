use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum::Extension;
use garde::Validate;
use serde_json::json;

use super::common::{
    internal_error, invalid_request, method_not_allowed, policy_violation, RequestId,
};
use crate::app_state::AppState;
use crate::models::api::SuggestionRequest;
use crate::services::generation::SuggestionsInput;
use crate::services::policy::{self, PolicyError};

/// POST /v1/suggestions — synchronous reply suggestions.
pub async fn suggestions(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    method: Method,
    body: Bytes,
) -> Response {
    if method != Method::POST {
        return method_not_allowed(request_id.as_str());
    }

    let mut request: SuggestionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => return invalid_request("invalid JSON payload", request_id.as_str()),
    };
    if request.conversation.normalize().is_err() {
        return invalid_request("conversation fields are required", request_id.as_str());
    }

    request.locale = request.locale.trim().to_string();
    if request.locale.is_empty() || request.locale.chars().count() > 16 {
        return invalid_request(
            "locale is required and must have at most 16 chars",
            request_id.as_str(),
        );
    }

    let tone = request.tone.trim().to_lowercase();
    if !matches!(tone.as_str(), "formal" | "neutro" | "amigavel") {
        return invalid_request("tone must be formal, neutro or amigavel", request_id.as_str());
    }
    request.tone = tone;

    if request.validate().is_err() {
        return invalid_request("context_window must be between 5 and 80", request_id.as_str());
    }

    let raw_payload = match serde_json::to_vec(&request) {
        Ok(payload) => payload,
        Err(_) => return internal_error("failed to encode request", request_id.as_str()),
    };

    if policy::validate_manual_only(&raw_payload).is_err() {
        return policy_violation("automatic send is not allowed", request_id.as_str());
    }
    if let Err(err) = policy::enforce_content_policy(&raw_payload) {
        let message = match &err {
            PolicyError::ContentViolation(violations) if !violations.is_empty() => {
                violations[0].message.clone()
            }
            _ => "request blocked by policy".to_string(),
        };
        return policy_violation(&message, request_id.as_str());
    }
    let masked_payload = policy::mask_pii_json(&raw_payload);

    let output = state
        .suggestions
        .generate(SuggestionsInput {
            tenant_id: request.conversation.tenant_id.clone(),
            conversation_id: request.conversation.conversation_id.clone(),
            locale: request.locale.clone(),
            tone: request.tone.clone(),
            context_window: request.context_window,
            payload: masked_payload,
        })
        .await;

    let response = json!({
        "request_id": request_id.as_str(),
        "model_id": output.model_id,
        "prompt_version": output.prompt_version,
        "suggestions": output.suggestions,
        "quality_score": output.quality_score,
        "hitl_required": true,
        "hitl": policy::default_hitl_metadata(),
    });
    (StatusCode::OK, Json(response)).into_response()
}

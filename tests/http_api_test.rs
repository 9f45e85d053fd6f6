//! HTTP surface tests driven fully in-process: in-memory repository,
//! in-process queue and the degraded (no-generator) suggestion path.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use wa_copilot::app_state::AppState;
use wa_copilot::db::MemoryJobsRepository;
use wa_copilot::routes::{build_router, RouterConfig};
use wa_copilot::services::jobs::JobsService;
use wa_copilot::services::queue::LocalQueue;
use wa_copilot::services::suggestions::SuggestionsService;

fn test_router(auth_token: &str) -> axum::Router {
    let repo = Arc::new(MemoryJobsRepository::new());
    let queue = Arc::new(LocalQueue::new(64, 3));
    let state = AppState::new(
        JobsService::new(repo, queue),
        SuggestionsService::new(None),
    );
    build_router(
        state,
        RouterConfig {
            auth_token: auth_token.to_string(),
            rate_limit_rps: 10_000.0,
            rate_limit_burst: 10_000,
            cors_origins: vec!["https://web.whatsapp.com".to_string()],
        },
        None,
    )
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post_json_with_key(uri: &str, key: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("Content-Type", "application/json")
        .header("Idempotency-Key", key)
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn read_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn suggestion_body(conversation_id: &str) -> serde_json::Value {
    serde_json::json!({
        "conversation": {
            "tenant_id": "tenant-1",
            "conversation_id": conversation_id,
            "channel": "whatsapp_web"
        },
        "locale": "pt-BR",
        "tone": "neutro",
        "context_window": 20
    })
}

fn summary_body(summary_type: &str) -> serde_json::Value {
    serde_json::json!({
        "conversation": {
            "tenant_id": "tenant-1",
            "conversation_id": "conv-1",
            "channel": "whatsapp_web"
        },
        "summary_type": summary_type,
        "include_actions": true
    })
}

#[tokio::test]
async fn healthz_responds_ok_with_request_id() {
    let router = test_router("");
    let response = router
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("X-Request-Id"));

    let body = read_json(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn healthz_rejects_post() {
    let router = test_router("");
    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    let body = read_json(response).await;
    assert_eq!(body["error"]["code"], "method_not_allowed");
}

#[tokio::test]
async fn suggestions_blocked_by_policy_then_clean_request_succeeds() {
    let router = test_router("");

    // Conversation id carrying a blocked keyword trips the content policy.
    let response = router
        .clone()
        .oneshot(post_json("/v1/suggestions", suggestion_body("phishing-campaign-1")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = read_json(response).await;
    assert_eq!(body["error"]["code"], "policy_violation");

    // A clean request for the same tenant succeeds with HITL metadata.
    let response = router
        .oneshot(post_json("/v1/suggestions", suggestion_body("conv-clean")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["hitl_required"], true);
    assert_eq!(body["hitl"]["required"], true);
    let allowed: Vec<&str> = body["hitl"]["allowed_actions"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|value| value.as_str())
        .collect();
    assert!(allowed.contains(&"copy"));
    assert!(!body["suggestions"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn suggestions_echo_incoming_request_id() {
    let router = test_router("");
    let mut request = post_json("/v1/suggestions", suggestion_body("conv-1"));
    request
        .headers_mut()
        .insert("X-Request-Id", "req-fixed-123".parse().unwrap());

    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.headers()["X-Request-Id"], "req-fixed-123");
    let body = read_json(response).await;
    assert_eq!(body["request_id"], "req-fixed-123");
}

#[tokio::test]
async fn suggestions_validate_tone_locale_and_window() {
    let router = test_router("");

    let mut invalid_tone = suggestion_body("conv-1");
    invalid_tone["tone"] = serde_json::json!("sarcastic");
    let response =
        router.clone().oneshot(post_json("/v1/suggestions", invalid_tone)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let mut invalid_window = suggestion_body("conv-1");
    invalid_window["context_window"] = serde_json::json!(100);
    let response =
        router.clone().oneshot(post_json("/v1/suggestions", invalid_window)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = read_json(response).await;
    assert_eq!(body["error"]["code"], "invalid_request");

    let mut missing_locale = suggestion_body("conv-1");
    missing_locale["locale"] = serde_json::json!("");
    let response = router.oneshot(post_json("/v1/suggestions", missing_locale)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn suggestions_reject_auto_send_payload() {
    let router = test_router("");
    let mut body = suggestion_body("conv-1");
    body["messages"] = serde_json::json!(["please use auto send for this"]);
    let response = router.oneshot(post_json("/v1/suggestions", body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn summary_enqueue_is_idempotent_per_key_and_payload() {
    let router = test_router("");
    let key = "summary-e2e-flow-0001";

    let first = router
        .clone()
        .oneshot(post_json_with_key("/v1/summaries", key, summary_body("short")))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::ACCEPTED);
    assert_eq!(first.headers()["Retry-After"], "2");
    let first_body = read_json(first).await;
    let first_job = first_body["job_id"].as_str().unwrap().to_string();
    assert_eq!(first_body["status"], "pending");
    assert_eq!(first_body["hitl"]["required"], true);

    let second = router
        .clone()
        .oneshot(post_json_with_key("/v1/summaries", key, summary_body("short")))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::ACCEPTED);
    let second_body = read_json(second).await;
    assert_eq!(second_body["job_id"].as_str().unwrap(), first_job);

    // Same key with a different payload conflicts.
    let third = router
        .oneshot(post_json_with_key("/v1/summaries", key, summary_body("full")))
        .await
        .unwrap();
    assert_eq!(third.status(), StatusCode::CONFLICT);
    let third_body = read_json(third).await;
    assert_eq!(third_body["error"]["code"], "idempotency_conflict");
}

#[tokio::test]
async fn summary_requires_idempotency_key() {
    let router = test_router("");
    let response =
        router.oneshot(post_json("/v1/summaries", summary_body("short"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = read_json(response).await;
    assert_eq!(body["error"]["code"], "invalid_request");
}

#[tokio::test]
async fn report_enqueue_then_list_and_poll_status() {
    let router = test_router("");

    let report_body = serde_json::json!({
        "conversation": {
            "tenant_id": "tenant-list",
            "conversation_id": "conv-report",
            "channel": "whatsapp_web"
        },
        "report_type": "timeline",
        "topic_filter": "contrato"
    });
    let created = router
        .clone()
        .oneshot(post_json_with_key("/v1/reports", "report-e2e-key-0001", report_body))
        .await
        .unwrap();
    assert_eq!(created.status(), StatusCode::ACCEPTED);
    let created_body = read_json(created).await;
    let job_id = created_body["job_id"].as_str().unwrap().to_string();

    let listed = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/reports?tenant_id=tenant-list&page=1&page_size=10")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(listed.status(), StatusCode::OK);
    let listed_body = read_json(listed).await;
    assert_eq!(listed_body["total"], 1);
    assert_eq!(listed_body["page"], 1);
    assert_eq!(listed_body["has_next"], false);
    assert_eq!(listed_body["items"][0]["report_id"].as_str().unwrap(), job_id);

    let status = router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/v1/jobs/{job_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(status.status(), StatusCode::OK);
    let status_body = read_json(status).await;
    assert_eq!(status_body["job_id"].as_str().unwrap(), job_id);
    assert_eq!(status_body["kind"], "report");

    let missing = router
        .oneshot(
            Request::builder()
                .uri("/v1/jobs/00000000-0000-0000-0000-000000000000")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    let missing_body = read_json(missing).await;
    assert_eq!(missing_body["error"]["code"], "not_found");
}

#[tokio::test]
async fn report_type_is_validated() {
    let router = test_router("");
    let body = serde_json::json!({
        "conversation": {
            "tenant_id": "t1",
            "conversation_id": "c1",
            "channel": "whatsapp_web"
        },
        "report_type": "grafico"
    });
    let response = router
        .oneshot(post_json_with_key("/v1/reports", "report-bad-type-0001", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn v1_routes_require_bearer_token_when_configured() {
    let router = test_router("secret-token");

    let denied = router
        .clone()
        .oneshot(post_json("/v1/suggestions", suggestion_body("conv-1")))
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
    let denied_body = read_json(denied).await;
    assert_eq!(denied_body["error"]["code"], "unauthorized");

    let mut authorized = post_json("/v1/suggestions", suggestion_body("conv-1"));
    authorized
        .headers_mut()
        .insert("Authorization", "Bearer secret-token".parse().unwrap());
    let allowed = router.clone().oneshot(authorized).await.unwrap();
    assert_eq!(allowed.status(), StatusCode::OK);

    // Health stays open.
    let health = router
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_route_returns_not_found_envelope() {
    let router = test_router("");
    let response = router
        .oneshot(Request::builder().uri("/v2/unknown").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = read_json(response).await;
    assert_eq!(body["error"]["code"], "not_found");
}

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use serde_json::{json, Value};
use slipstream_core::GatewayConfig;
use slipstream_gateway::{build_router, AppState};
use tempfile::TempDir;
use tower::ServiceExt;

fn test_config(dir: &TempDir) -> GatewayConfig {
    GatewayConfig {
        host: "127.0.0.1".into(),
        port: 0,
        service_name: "slipstream-gateway".into(),
        tls_cert_path: None,
        tls_key_path: None,
        platform_host: "platform.invalid".into(),
        sessions_file: dir.path().join("sessions.json"),
        users_file: dir.path().join("users.json"),
        account_pool_file: dir.path().join("accounts.json"),
        max_rpm_per_token: 30,
        event_retention: 100,
        max_users_per_session: 4,
        payload_limit_bytes: 1024 * 1024,
        upstream_timeout_ms: 2_000,
        session_keepalive_interval_ms: 300_000,
        session_healthcheck_interval_ms: 60_000,
        session_healthcheck_timeout_ms: 5_000,
        session_max_age_ms: 0,
        session_affinity_ttl_ms: 1_800_000,
        account_healthcheck_interval_ms: 30_000,
        account_healthcheck_timeout_ms: 2_500,
        default_account_daily_limit: 0,
        trial_initial_credits: 1000.0,
        trial_low_credits_threshold: 50.0,
        token_refresh_interval_ms: 2_700_000,
        token_endpoint: None,
        firebase_api_key: None,
        jwt_secret: None,
        simulate_enabled: true,
        refund_on_upstream_error: false,
        log_level: "info".into(),
        log_format: "pretty".into(),
    }
}

fn state_with_user(dir: &TempDir) -> AppState {
    let state = AppState::new(test_config(dir)).expect("state");
    state
        .users
        .create(
            json!({"name": "tester", "token": "tok-test", "creditLimit": 1000.0}),
            1000.0,
        )
        .expect("seed user");
    state
}

fn chat_request(token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_service_name() {
    let dir = TempDir::new().unwrap();
    let router = build_router(state_with_user(&dir));
    let response = router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["service"], "slipstream-gateway");
}

#[tokio::test]
async fn models_listing_is_openai_shaped() {
    let dir = TempDir::new().unwrap();
    let router = build_router(state_with_user(&dir));
    let response = router
        .oneshot(Request::get("/v1/models").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["object"], "list");
    assert!(body["data"].as_array().unwrap().len() > 5);
    assert_eq!(body["data"][0]["object"], "model");
}

#[tokio::test]
async fn chat_requires_bearer() {
    let dir = TempDir::new().unwrap();
    let router = build_router(state_with_user(&dir));
    let response = router
        .oneshot(chat_request(
            None,
            json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"]["kind"], "unauthorized");
}

#[tokio::test]
async fn chat_rejects_empty_messages() {
    let dir = TempDir::new().unwrap();
    let router = build_router(state_with_user(&dir));
    let response = router
        .oneshot(chat_request(
            Some("tok-test"),
            json!({"model": "gpt-4o", "messages": []}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("messages_required"));
}

#[tokio::test]
async fn chat_rejects_oversized_payload() {
    let dir = TempDir::new().unwrap();
    let router = build_router(state_with_user(&dir));
    let huge = "x".repeat(1024 * 1024 + 1);
    let response = router
        .oneshot(chat_request(
            Some("tok-test"),
            json!({"model": "gpt-4o", "messages": [{"role": "user", "content": huge}]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let body = body_json(response).await;
    assert_eq!(body["error"]["kind"], "payload_too_large");
}

#[tokio::test]
async fn chat_rejects_invalid_json() {
    let dir = TempDir::new().unwrap();
    let router = build_router(state_with_user(&dir));
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, "Bearer tok-test")
        .body(Body::from("{not json"))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["kind"], "invalid_json");
}

#[tokio::test]
async fn rate_limit_boundary_is_exact() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.max_rpm_per_token = 3;
    let state = AppState::new(config).expect("state");
    state
        .users
        .create(
            json!({"name": "tester", "token": "tok-test", "creditLimit": 1000.0}),
            1000.0,
        )
        .unwrap();
    let router = build_router(state.clone());

    for _ in 0..3 {
        let response = router
            .clone()
            .oneshot(chat_request(
                Some("tok-test"),
                json!({"model": "swe-1", "messages": [{"role": "user", "content": "hi"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = router
        .oneshot(chat_request(
            Some("tok-test"),
            json!({"model": "swe-1", "messages": [{"role": "user", "content": "hi"}]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = body_json(response).await;
    assert_eq!(body["error"]["kind"], "rate_limited");

    // event log saw three successes and one rejection
    let events = state.events.recent(10);
    assert_eq!(events.iter().filter(|e| e.status == 200).count(), 3);
    assert_eq!(events.iter().filter(|e| e.status == 429).count(), 1);
}

#[tokio::test]
async fn simulate_mode_serves_deterministic_completion() {
    let dir = TempDir::new().unwrap();
    let router = build_router(state_with_user(&dir));
    let response = router
        .oneshot(chat_request(
            Some("tok-test"),
            json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "ping"}]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["lab_meta"]["mode"], "simulate");
    let content = body["choices"][0]["message"]["content"].as_str().unwrap();
    assert!(content.contains("[simulated:gpt-4o]"));
    assert!(content.contains("ping"));
}

#[tokio::test]
async fn simulate_mode_deducts_user_credits() {
    let dir = TempDir::new().unwrap();
    let state = state_with_user(&dir);
    let user_id = state.users.snapshot()[0].id.clone();
    let router = build_router(state.clone());

    let response = router
        .oneshot(chat_request(
            Some("tok-test"),
            json!({"model": "claude-sonnet-4", "messages": [{"role": "user", "content": "hi"}]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(state.users.get(&user_id).unwrap().used_credits, 5.0);
}

#[tokio::test]
async fn credit_exhaustion_reports_available_and_next_recovery() {
    let dir = TempDir::new().unwrap();
    let state = state_with_user(&dir);
    let user_id = state.users.snapshot()[0].id.clone();
    state.users.consume(&user_id, 999.0).unwrap();
    let router = build_router(state.clone());

    // gpt-5 costs 1.5; only 1 credit is left
    let response = router
        .oneshot(chat_request(
            Some("tok-test"),
            json!({"model": "gpt-5", "messages": [{"role": "user", "content": "hi"}]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = body_json(response).await;
    assert_eq!(body["error"]["kind"], "credits_exhausted");
    assert_eq!(body["credits"]["available"], 1.0);
    assert!(body["nextRecoveryIn"].as_str().unwrap().starts_with('~'));
    // the failed pre-check deducted nothing
    assert_eq!(state.users.get(&user_id).unwrap().used_credits, 999.0);
}

#[tokio::test]
async fn passthrough_without_sessions_is_503() {
    let dir = TempDir::new().unwrap();
    let state = state_with_user(&dir);
    let router = build_router(state.clone());
    let request = Request::builder()
        .method("POST")
        .uri("/exa.api_server_pb.ApiServerService/GetChatMessage")
        .header(header::CONTENT_TYPE, "application/connect+proto")
        .body(Body::from(vec![0u8, 0, 0, 0, 0]))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["error"]["kind"], "no_available_account");

    let events = state.events.recent(5);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, 503);
}

#[tokio::test]
async fn non_platform_service_path_is_404() {
    let dir = TempDir::new().unwrap();
    let router = build_router(state_with_user(&dir));
    let request = Request::builder()
        .method("POST")
        .uri("/grpc.health.v1.Health/Check")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn soc_events_expose_recent_records() {
    let dir = TempDir::new().unwrap();
    let state = state_with_user(&dir);
    let router = build_router(state.clone());
    router
        .clone()
        .oneshot(chat_request(
            Some("tok-test"),
            json!({"model": "swe-1", "messages": [{"role": "user", "content": "hi"}]}),
        ))
        .await
        .unwrap();

    let response = router
        .oneshot(Request::get("/soc/events?limit=10").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["total"], 1);
    assert_eq!(body["events"][0]["mode"], "simulate");
    // token appears only as its fingerprint
    let token_hash = body["events"][0]["tokenHash"].as_str().unwrap();
    assert_eq!(token_hash.len(), 12);
    assert!(!serde_json::to_string(&body).unwrap().contains("tok-test"));
}

#[tokio::test]
async fn admin_bandwidth_reports_smoothness() {
    let dir = TempDir::new().unwrap();
    let state = state_with_user(&dir);
    state
        .bandwidth
        .record(std::time::Duration::from_millis(100), 10, 20, 200);
    let router = build_router(state);
    let response = router
        .oneshot(Request::get("/admin/bandwidth").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["metrics"]["windowRequests"], 1);
    assert_eq!(body["metrics"]["bucket"], "smooth");
    assert!(body["metrics"]["smoothnessScore"].as_u64().unwrap() >= 70);
}

#[tokio::test]
async fn admin_user_lifecycle_roundtrips() {
    let dir = TempDir::new().unwrap();
    let state = state_with_user(&dir);
    let router = build_router(state.clone());

    let create = Request::builder()
        .method("POST")
        .uri("/admin/users/create")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({"name": "second", "creditLimit": 100.0}).to_string(),
        ))
        .unwrap();
    let response = router.clone().oneshot(create).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let created = body_json(response).await;
    let id = created["id"].as_str().unwrap().to_string();
    // admin views mask tokens
    assert!(created["token"].as_str().unwrap().starts_with("****"));

    let update = Request::builder()
        .method("POST")
        .uri("/admin/users/update")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({"id": id, "enabled": false}).to_string(),
        ))
        .unwrap();
    let response = router.clone().oneshot(update).await.unwrap();
    assert_eq!(body_json(response).await["enabled"], false);

    let delete = Request::builder()
        .method("POST")
        .uri("/admin/users/delete")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({"id": id}).to_string()))
        .unwrap();
    let response = router.oneshot(delete).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(state.users.get(&id).is_none());
}

#[tokio::test]
async fn session_register_and_remove_roundtrip() {
    let dir = TempDir::new().unwrap();
    let state = state_with_user(&dir);
    let router = build_router(state.clone());

    let register = Request::builder()
        .method("POST")
        .uri("/admin/sessions/register")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({
                "id": "sess-1",
                "apiKey": "harvested-key",
                "firebaseIdToken": "not-a-real-jwt",
                "email": "pool@example.com",
                "credits": 500.0,
            })
            .to_string(),
        ))
        .unwrap();
    let response = router.clone().oneshot(register).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let session = state.sessions.get("sess-1").expect("registered");
    assert_eq!(session.credits_remaining, 500.0);
    assert!(state.config.sessions_file.exists());

    let remove = Request::builder()
        .method("POST")
        .uri("/admin/sessions/remove")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({"id": "sess-1"}).to_string()))
        .unwrap();
    let response = router.oneshot(remove).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(state.sessions.get("sess-1").is_none());
}

#[tokio::test]
async fn credits_endpoint_reflects_consumption() {
    let dir = TempDir::new().unwrap();
    let state = state_with_user(&dir);
    let user_id = state.users.snapshot()[0].id.clone();
    state.users.consume(&user_id, 100.0).unwrap();
    let router = build_router(state);

    let request = Request::get("/v1/credits")
        .header(header::AUTHORIZATION, "Bearer tok-test")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["credits"]["available"], 900.0);
    assert_eq!(body["credits"]["limit"], 1000.0);
    assert_eq!(body["credits"]["usagePercent"], 10.0);
}

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use httpmock::Method::POST;
use httpmock::MockServer;
use serde_json::{json, Value};
use tower::util::ServiceExt;

fn post_json(uri: &str, token: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("authorization", format!("Bearer {token}"))
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

async fn body_json(body: Body) -> Value {
    let bytes = to_bytes(body, usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn openai_facade_over_anthropic_upstream_maps_model_and_shape() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST)
            .path("/v1/messages")
            .header("x-api-key", "sk-ant-test")
            .body_contains("claude-sonnet-4-5");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({
                "id": "msg_up",
                "type": "message",
                "role": "assistant",
                "model": "claude-sonnet-4-5",
                "content": [{ "type": "text", "text": "hi" }],
                "stop_reason": "end_turn",
                "usage": { "input_tokens": 1, "output_tokens": 1 },
            }));
    });

    let gw = common::gateway().await;
    let provider = gw
        .seed_provider("anthropic", &upstream.base_url(), None, None)
        .await;
    let cred = gw.seed_credential(provider, "sk-ant-test", 1).await;
    gw.seed_pool(
        "pool-key",
        "weighted_rr",
        &[cred],
        Some(r#"{"sonnet": "claude-sonnet-4-5"}"#),
    )
    .await;

    let req = post_json(
        "/v1/chat/completions",
        "pool-key",
        &json!({
            "model": "sonnet",
            "messages": [{ "role": "user", "content": "hi" }],
            "max_tokens": 10,
        }),
    );
    let resp = gw.app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().contains_key("x-request-id"));

    let body = body_json(resp.into_body()).await;
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(body["choices"][0]["message"]["content"], "hi");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["prompt_tokens"], 1);
    assert_eq!(body["usage"]["completion_tokens"], 1);
    assert_eq!(body["usage"]["total_tokens"], 2);
    mock.assert();
}

#[tokio::test]
async fn anthropic_facade_passthrough_forwards_body_and_echoes_request_id() {
    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST).path("/v1/messages");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({
                "id": "msg_up",
                "type": "message",
                "role": "assistant",
                "model": "claude-sonnet-4-5",
                "content": [{ "type": "text", "text": "pong" }],
                "stop_reason": "end_turn",
                "usage": { "input_tokens": 2, "output_tokens": 3 },
            }));
    });

    let gw = common::gateway().await;
    let provider = gw
        .seed_provider("anthropic", &upstream.base_url(), None, None)
        .await;
    let cred = gw.seed_credential(provider, "sk-ant-test", 1).await;
    gw.seed_pool("pool-key", "weighted_rr", &[cred], None).await;

    let mut req = post_json(
        "/v1/messages",
        "pool-key",
        &json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 16,
            "messages": [{ "role": "user", "content": "ping" }],
        }),
    );
    req.headers_mut()
        .insert("x-request-id", "req-fixed-1".parse().unwrap());

    let resp = gw.app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get("x-request-id").unwrap(), "req-fixed-1");
    let body = body_json(resp.into_body()).await;
    assert_eq!(body["content"][0]["text"], "pong");
}

#[tokio::test]
async fn unknown_client_key_is_unauthorized() {
    let gw = common::gateway().await;
    let provider = gw.seed_provider("anthropic", "http://127.0.0.1:1", None, None).await;
    let cred = gw.seed_credential(provider, "k", 1).await;
    gw.seed_pool("real-key", "weighted_rr", &[cred], None).await;

    let req = post_json(
        "/v1/chat/completions",
        "wrong-key",
        &json!({ "model": "m", "messages": [] }),
    );
    let resp = gw.app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(resp.into_body()).await;
    assert_eq!(body["error"]["code"], "unauthorized");
}

#[tokio::test]
async fn empty_config_is_not_configured() {
    let gw = common::gateway().await;
    let req = post_json(
        "/v1/messages",
        "any-key",
        &json!({ "model": "m", "max_tokens": 5, "messages": [] }),
    );
    let resp = gw.app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(resp.into_body()).await;
    assert_eq!(body["error"]["type"], "overloaded_error");
}

#[tokio::test]
async fn missing_token_is_rejected_before_routing() {
    let gw = common::gateway().await;
    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"model":"m","messages":[]}"#))
        .unwrap();
    let resp = gw.app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn shared_client_token_is_enforced_when_configured() {
    let gw = common::gateway_with_client_token(Some("shared-token".to_string())).await;
    let req = post_json("/v1/chat/completions", "other", &json!({ "model": "m" }));
    let resp = gw.app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn model_validation_rejects_empty_model_and_max_tokens() {
    let gw = common::gateway().await;

    let req = post_json(
        "/v1/chat/completions",
        "k",
        &json!({ "model": "", "messages": [] }),
    );
    let resp = gw.app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let req = post_json(
        "/v1/messages",
        "k",
        &json!({ "model": "m", "max_tokens": 0, "messages": [] }),
    );
    let resp = gw.app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn model_listing_unions_pool_and_provider_models() {
    let gw = common::gateway().await;
    let provider = gw
        .seed_provider(
            "anthropic",
            "http://127.0.0.1:1",
            Some(r#"{"fast": "claude-haiku-4-5"}"#),
            Some(r#"["claude-sonnet-4-5", "claude-haiku-4-5"]"#),
        )
        .await;
    let cred = gw.seed_credential(provider, "k", 1).await;
    gw.seed_pool(
        "pool-key",
        "weighted_rr",
        &[cred],
        Some(r#"{"sonnet": "claude-sonnet-4-5"}"#),
    )
    .await;

    let req = Request::builder()
        .method("GET")
        .uri("/v1/models")
        .header("authorization", "Bearer pool-key")
        .body(Body::empty())
        .unwrap();
    let resp = gw.app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp.into_body()).await;
    assert_eq!(body["object"], "list");
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&"sonnet"));
    assert!(ids.contains(&"fast"));
    assert!(ids.contains(&"claude-sonnet-4-5"));
    assert!(ids.contains(&"claude-haiku-4-5"));
    for model in body["data"].as_array().unwrap() {
        assert_eq!(model["object"], "model");
        assert_eq!(model["owned_by"], "gateway");
    }
}

#[tokio::test]
async fn healthz_and_metrics_endpoints_respond() {
    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST).path("/v1/messages");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({
                "id": "msg_up", "type": "message", "role": "assistant",
                "model": "m", "content": [{ "type": "text", "text": "x" }],
                "stop_reason": "end_turn",
                "usage": { "input_tokens": 1, "output_tokens": 1 },
            }));
    });

    let gw = common::gateway().await;
    let provider = gw
        .seed_provider("anthropic", &upstream.base_url(), None, None)
        .await;
    let cred = gw.seed_credential(provider, "k", 1).await;
    gw.seed_pool("pool-key", "weighted_rr", &[cred], None).await;

    let resp = gw
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let req = post_json(
        "/v1/messages",
        "pool-key",
        &json!({ "model": "m", "max_tokens": 5, "messages": [{ "role": "user", "content": "q" }] }),
    );
    let resp = gw.app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = gw
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let text = String::from_utf8(
        to_bytes(resp.into_body(), usize::MAX).await.unwrap().to_vec(),
    )
    .unwrap();
    assert!(text.contains(
        "llm_relay_requests_total{facade=\"anthropic\",provider=\"anthropic\",status=\"200\"} 1"
    ));
}

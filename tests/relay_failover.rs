mod common;

use std::collections::HashSet;
use std::time::Instant;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use httpmock::Method::POST;
use httpmock::MockServer;
use llm_relay::proto::Facade;
use serde_json::json;
use tower::util::ServiceExt;

#[tokio::test]
async fn non_stream_request_fails_over_to_second_credential_on_500() {
    let bad = MockServer::start();
    let bad_mock = bad.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(500).body("upstream exploded");
    });
    let good = MockServer::start();
    let good_mock = good.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({
                "id": "c1",
                "object": "chat.completion",
                "created": 0,
                "model": "m",
                "choices": [{
                    "index": 0,
                    "message": { "role": "assistant", "content": "recovered" },
                    "finish_reason": "stop",
                }],
                "usage": { "prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2 },
            }));
    });

    let gw = common::gateway().await;
    let bad_provider = gw.seed_provider("openai", &bad.base_url(), None, None).await;
    let good_provider = gw.seed_provider("openai", &good.base_url(), None, None).await;
    let bad_cred = gw.seed_credential(bad_provider, "sk-bad", 5).await;
    let good_cred = gw.seed_credential(good_provider, "sk-good", 1).await;
    gw.seed_pool(
        "pool-key",
        "priority_failover",
        &[bad_cred, good_cred],
        None,
    )
    .await;

    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", "Bearer pool-key")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::to_vec(&json!({
                "model": "m",
                "messages": [{ "role": "user", "content": "hi" }],
            }))
            .unwrap(),
        ))
        .unwrap();

    let resp = gw.app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "recovered");

    assert_eq!(bad_mock.hits(), 1);
    assert_eq!(good_mock.hits(), 1);

    // The 500 opened the failing credential's circuit and both inflight
    // counters balanced back to zero.
    assert!(gw.state.health.is_open(bad_cred, Instant::now()));
    assert!(!gw.state.health.is_open(good_cred, Instant::now()));
    assert_eq!(gw.state.health.inflight(bad_cred), 0);
    assert_eq!(gw.state.health.inflight(good_cred), 0);

    // The next pick skips the open circuit without needing the exclude set.
    let picked = gw
        .state
        .router
        .pick("pool-key", Facade::OpenAi, "m", &HashSet::new())
        .await
        .unwrap();
    assert_eq!(picked.credential_id, good_cred);
    gw.state
        .health
        .end_request(picked.credential_id, true, 200, std::time::Duration::from_millis(1));
}

#[tokio::test]
async fn successful_route_sticks_across_rotating_strategy() {
    let gw = common::gateway().await;
    let provider = gw
        .seed_provider("openai", "http://127.0.0.1:1", None, None)
        .await;
    let cred_a = gw.seed_credential(provider, "sk-a", 1).await;
    let cred_b = gw.seed_credential(provider, "sk-b", 1).await;
    gw.seed_pool("pool-key", "weighted_rr", &[cred_a, cred_b], None)
        .await;

    let first = gw
        .state
        .router
        .pick("pool-key", Facade::OpenAi, "gpt-4o", &HashSet::new())
        .await
        .unwrap();
    gw.state.health.end_request(
        first.credential_id,
        true,
        200,
        std::time::Duration::from_millis(1),
    );
    gw.state.router.record_route_result(
        first.pool_id,
        Facade::OpenAi,
        "gpt-4o",
        first.credential_id,
        true,
        200,
    );

    // Weighted round-robin would otherwise alternate; the sticky entry pins
    // the credential for the same (pool, facade, model) tuple.
    for _ in 0..10 {
        let next = gw
            .state
            .router
            .pick("pool-key", Facade::OpenAi, "gpt-4o", &HashSet::new())
            .await
            .unwrap();
        assert_eq!(next.credential_id, first.credential_id);
        gw.state.health.end_request(
            next.credential_id,
            true,
            200,
            std::time::Duration::from_millis(1),
        );
    }

    // A different model is not covered by the sticky entry.
    let other = gw
        .state
        .router
        .pick("pool-key", Facade::OpenAi, "gpt-4o-mini", &HashSet::new())
        .await
        .unwrap();
    gw.state.health.end_request(
        other.credential_id,
        true,
        200,
        std::time::Duration::from_millis(1),
    );

    // An eviction-class failure drops the entry when it points at the
    // failing credential.
    gw.state.router.record_route_result(
        first.pool_id,
        Facade::OpenAi,
        "gpt-4o",
        first.credential_id,
        false,
        500,
    );
    let after = gw
        .state
        .router
        .pick("pool-key", Facade::OpenAi, "gpt-4o", &HashSet::new())
        .await
        .unwrap();
    gw.state.health.end_request(
        after.credential_id,
        true,
        200,
        std::time::Duration::from_millis(1),
    );
}

#[tokio::test]
async fn streaming_requests_are_never_retried() {
    let bad = MockServer::start();
    let bad_mock = bad.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(500).body("boom");
    });

    let gw = common::gateway().await;
    let provider = gw.seed_provider("openai", &bad.base_url(), None, None).await;
    let cred = gw.seed_credential(provider, "sk-bad", 1).await;
    gw.seed_pool("pool-key", "weighted_rr", &[cred], None).await;

    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", "Bearer pool-key")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::to_vec(&json!({
                "model": "m",
                "messages": [{ "role": "user", "content": "hi" }],
                "stream": true,
            }))
            .unwrap(),
        ))
        .unwrap();

    let resp = gw.app.clone().oneshot(req).await.unwrap();
    // Upstream error status is forwarded; only one attempt was made.
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let _ = to_bytes(resp.into_body(), usize::MAX).await;
    assert_eq!(bad_mock.hits(), 1);
    assert_eq!(gw.state.health.inflight(cred), 0);
}

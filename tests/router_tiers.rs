mod common;

use std::collections::HashSet;
use std::time::Duration;

use llm_relay::proto::Facade;
use llm_relay::store::PoolRow;

async fn seed_tiered_pool(gw: &common::TestGateway, client_key: &str, tiers_json: &str) -> u64 {
    gw.store
        .insert_pool(PoolRow {
            id: 0,
            name: "tiered".to_string(),
            client_key: client_key.to_string(),
            strategy: "weighted_rr".to_string(),
            tiers_json: Some(tiers_json.to_string()),
            credential_ids_json: None,
            model_map_json: None,
            enabled: true,
        })
        .await
        .expect("seed pool")
}

#[tokio::test]
async fn priority_tier_prefers_first_provider_with_a_candidate() {
    let gw = common::gateway().await;
    let first = gw
        .seed_provider("anthropic", "http://127.0.0.1:1", None, None)
        .await;
    let second = gw
        .seed_provider("openai", "http://127.0.0.1:2", None, None)
        .await;
    let first_cred = gw.seed_credential(first, "sk-first", 1).await;
    let second_cred = gw.seed_credential(second, "sk-second", 1).await;

    let tiers = format!(
        r#"[{{"name":"main","strategy":"priority","items":[
            {{"provider_id":{first},"weight":1}},
            {{"provider_id":{second},"weight":1}}
        ]}}]"#
    );
    seed_tiered_pool(&gw, "tier-key", &tiers).await;

    let picked = gw
        .state
        .router
        .pick("tier-key", Facade::Anthropic, "claude-sonnet-4-5", &HashSet::new())
        .await
        .unwrap();
    assert_eq!(picked.credential_id, first_cred);
    gw.state
        .health
        .end_request(first_cred, true, 200, Duration::from_millis(1));

    // With the first provider's credential excluded, the tier falls through
    // to the second item.
    let mut exclude = HashSet::new();
    exclude.insert(first_cred);
    let picked = gw
        .state
        .router
        .pick("tier-key", Facade::Anthropic, "claude-sonnet-4-5", &exclude)
        .await
        .unwrap();
    assert_eq!(picked.credential_id, second_cred);
    gw.state
        .health
        .end_request(second_cred, true, 200, Duration::from_millis(1));
}

#[tokio::test]
async fn tier_model_restriction_routes_by_requested_model() {
    let gw = common::gateway().await;
    let fast = gw
        .seed_provider("openai", "http://127.0.0.1:1", None, None)
        .await;
    let big = gw
        .seed_provider("anthropic", "http://127.0.0.1:2", None, None)
        .await;
    let fast_cred = gw.seed_credential(fast, "sk-fast", 1).await;
    let big_cred = gw.seed_credential(big, "sk-big", 1).await;

    let tiers = format!(
        r#"[
            {{"name":"fast","strategy":"priority","models":["gpt-4o-mini"],
              "items":[{{"provider_id":{fast},"weight":1}}]}},
            {{"name":"big","strategy":"priority",
              "items":[{{"provider_id":{big},"weight":1}}]}}
        ]"#
    );
    seed_tiered_pool(&gw, "tier-key", &tiers).await;

    let picked = gw
        .state
        .router
        .pick("tier-key", Facade::OpenAi, "gpt-4o-mini", &HashSet::new())
        .await
        .unwrap();
    assert_eq!(picked.credential_id, fast_cred);
    gw.state
        .health
        .end_request(fast_cred, true, 200, Duration::from_millis(1));

    // A model outside the first tier's list skips straight to the
    // unrestricted tier.
    let picked = gw
        .state
        .router
        .pick("tier-key", Facade::OpenAi, "claude-sonnet-4-5", &HashSet::new())
        .await
        .unwrap();
    assert_eq!(picked.credential_id, big_cred);
    gw.state
        .health
        .end_request(big_cred, true, 200, Duration::from_millis(1));
}

#[tokio::test]
async fn tiers_json_wrapped_in_a_string_is_unwrapped() {
    let gw = common::gateway().await;
    let provider = gw
        .seed_provider("openai", "http://127.0.0.1:1", None, None)
        .await;
    let cred = gw.seed_credential(provider, "sk", 1).await;

    let inner = format!(
        r#"[{{"name":"t","strategy":"priority","items":[{{"provider_id":{provider},"weight":1}}]}}]"#
    );
    let wrapped = serde_json::to_string(&inner).unwrap();
    seed_tiered_pool(&gw, "tier-key", &wrapped).await;

    let picked = gw
        .state
        .router
        .pick("tier-key", Facade::OpenAi, "gpt-4o", &HashSet::new())
        .await
        .unwrap();
    assert_eq!(picked.credential_id, cred);
    gw.state
        .health
        .end_request(cred, true, 200, Duration::from_millis(1));
}

#[tokio::test]
async fn provider_catalog_restricts_tier_and_drives_alias_substitution() {
    let gw = common::gateway().await;
    let provider = gw
        .seed_provider(
            "anthropic",
            "http://127.0.0.1:1",
            None,
            Some(r#"["claude-sonnet-4-5", "claude-haiku-4-5"]"#),
        )
        .await;
    let cred = gw.seed_credential(provider, "sk", 1).await;
    let tiers = format!(
        r#"[{{"name":"t","strategy":"priority","items":[{{"provider_id":{provider},"weight":1}}]}}]"#
    );
    seed_tiered_pool(&gw, "tier-key", &tiers).await;

    // "haiku" is not in the catalog verbatim; the alias heuristic picks the
    // small model.
    let picked = gw
        .state
        .router
        .pick("tier-key", Facade::Anthropic, "haiku", &HashSet::new())
        .await
        .unwrap();
    assert_eq!(picked.credential_id, cred);
    assert_eq!(picked.model, "claude-haiku-4-5");
    gw.state
        .health
        .end_request(cred, true, 200, Duration::from_millis(1));
}

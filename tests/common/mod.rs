//! Shared harness: a seeded sqlite config store behind a full `AppState`
//! and axum router.
#![allow(dead_code)]

use std::sync::Arc;

use llm_relay::crypto::KeyCipher;
use llm_relay::server::{app, AppState};
use llm_relay::store::{CredentialRow, PoolRow, ProviderRow, SqliteStore};

pub const ADMIN_TOKEN: &str = "admin-secret";
pub const MASTER_KEY: [u8; 32] = [42u8; 32];

pub struct TestGateway {
    pub state: Arc<AppState>,
    pub app: axum::Router,
    pub store: Arc<SqliteStore>,
    pub cipher: KeyCipher,
    _db_path: std::path::PathBuf,
}

pub async fn gateway() -> TestGateway {
    gateway_with_client_token(None).await
}

pub async fn gateway_with_client_token(client_token: Option<String>) -> TestGateway {
    let db_path = std::env::temp_dir().join(format!("llm-relay-test-{}.db", uuid::Uuid::new_v4()));
    let store = Arc::new(SqliteStore::new(&db_path));
    store.init().await.expect("store init");

    let state = AppState::new(
        store.clone(),
        KeyCipher::new(&MASTER_KEY).expect("cipher"),
        client_token,
        ADMIN_TOKEN.to_string(),
    );
    let app = app(state.clone(), &["*".to_string()]);

    TestGateway {
        state,
        app,
        store,
        cipher: KeyCipher::new(&MASTER_KEY).expect("cipher"),
        _db_path: db_path,
    }
}

impl TestGateway {
    pub async fn seed_provider(
        &self,
        provider_type: &str,
        base_url: &str,
        model_map_json: Option<&str>,
        models_json: Option<&str>,
    ) -> u64 {
        self.store
            .insert_provider(ProviderRow {
                id: 0,
                provider_type: provider_type.to_string(),
                base_url: base_url.to_string(),
                default_headers_json: None,
                model_map_json: model_map_json.map(str::to_string),
                models_json: models_json.map(str::to_string),
                enabled: true,
            })
            .await
            .expect("seed provider")
    }

    pub async fn seed_credential(&self, provider_id: u64, api_key: &str, weight: u32) -> u64 {
        let ciphertext = self.cipher.seal(api_key.as_bytes()).expect("seal key");
        self.store
            .insert_credential(CredentialRow {
                id: 0,
                provider_id,
                api_key_ciphertext: ciphertext,
                weight,
                concurrency_limit: None,
                enabled: true,
            })
            .await
            .expect("seed credential")
    }

    pub async fn seed_pool(
        &self,
        client_key: &str,
        strategy: &str,
        credential_ids: &[u64],
        model_map_json: Option<&str>,
    ) -> u64 {
        let ids_json = serde_json::to_string(credential_ids).expect("ids json");
        self.store
            .insert_pool(PoolRow {
                id: 0,
                name: format!("pool-{client_key}"),
                client_key: client_key.to_string(),
                strategy: strategy.to_string(),
                tiers_json: None,
                credential_ids_json: Some(ids_json),
                model_map_json: model_map_json.map(str::to_string),
                enabled: true,
            })
            .await
            .expect("seed pool")
    }
}

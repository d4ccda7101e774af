use std::process::ExitCode;
use std::sync::Arc;

use llm_relay::crypto::KeyCipher;
use llm_relay::env::EnvConfig;
use llm_relay::server::{serve, AppState};
use llm_relay::store::SqliteStore;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match EnvConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("config: {err}");
            return ExitCode::FAILURE;
        }
    };

    let cipher = match KeyCipher::from_base64_key(&config.key_enc_master_b64) {
        Ok(cipher) => cipher,
        Err(err) => {
            eprintln!("cipher: {err}");
            return ExitCode::FAILURE;
        }
    };

    let store = SqliteStore::new(&config.store_dsn);
    if let Err(err) = store.init().await {
        eprintln!("store: {err}");
        return ExitCode::FAILURE;
    }

    let state = AppState::new(
        Arc::new(store),
        cipher,
        config.client_token.clone(),
        config.admin_token.clone(),
    );

    if let Err(err) = serve(state, &config.http_addr, &config.cors_allowed_origins).await {
        eprintln!("serve: {err}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

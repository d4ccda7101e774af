//! Process configuration. Read once at startup; nothing here is touched on
//! the request path.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("{0} is required")]
    Missing(&'static str),
}

#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub http_addr: String,
    pub store_dsn: String,
    pub admin_token: String,
    pub key_enc_master_b64: String,
    pub client_token: Option<String>,
    pub cors_allowed_origins: Vec<String>,
}

impl EnvConfig {
    pub fn from_env() -> Result<Self, EnvError> {
        let store_dsn = require("STORE_DSN")?;
        let admin_token = require("ADMIN_TOKEN")?;
        let key_enc_master_b64 = require("KEY_ENC_MASTER_B64")?;

        let client_token = optional("CLIENT_TOKEN");
        let cors_allowed_origins = match optional("CORS_ALLOWED_ORIGINS") {
            Some(raw) => split_csv(&raw),
            None => vec!["*".to_string()],
        };

        Ok(Self {
            http_addr: optional("HTTP_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            store_dsn,
            admin_token,
            key_enc_master_b64,
            client_token,
            cors_allowed_origins,
        })
    }
}

fn require(key: &'static str) -> Result<String, EnvError> {
    optional(key).ok_or(EnvError::Missing(key))
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::split_csv;

    #[test]
    fn csv_trims_and_drops_empties() {
        assert_eq!(
            split_csv(" https://a.example ,, https://b.example "),
            vec!["https://a.example", "https://b.example"]
        );
    }
}

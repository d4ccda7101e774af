//! Outbound HTTP to the three upstream shapes.
//!
//! Paths are idempotent across a `base_url` that does or does not already
//! end in `/v1` (or `/v1beta`). Provider `default_headers` are applied
//! last and may override anything except the auth header, which is set
//! from the decrypted credential.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};

use crate::error::{GatewayError, Result};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// One upstream endpoint plus the decrypted key for a single call.
#[derive(Clone, Debug)]
pub struct Upstream {
    pub base_url: String,
    pub api_key: String,
    pub headers: HashMap<String, String>,
    pub timeout: Duration,
}

#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
}

impl UpstreamClient {
    pub fn new() -> Self {
        // Per-request timeouts only: streaming responses outlive any
        // reasonable whole-request deadline, so the client itself is
        // unbounded and callers pass a timeout per call.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { http }
    }

    pub async fn anthropic_messages(
        &self,
        up: &Upstream,
        api_version: &str,
        body: Vec<u8>,
    ) -> Result<reqwest::Response> {
        let url = join_url(&up.base_url, "/v1", "/messages");
        let mut headers = base_headers();
        insert_header(&mut headers, "anthropic-version", api_version);
        insert_header(&mut headers, "x-api-key", &up.api_key);
        apply_default_headers(&mut headers, &up.headers);
        self.post(&url, headers, body, up.timeout).await
    }

    pub async fn anthropic_models(&self, up: &Upstream) -> Result<reqwest::Response> {
        let url = join_url(&up.base_url, "/v1", "/models");
        let mut headers = base_headers();
        insert_header(&mut headers, "anthropic-version", ANTHROPIC_VERSION);
        insert_header(&mut headers, "x-api-key", &up.api_key);
        apply_default_headers(&mut headers, &up.headers);
        self.get(&url, headers, up.timeout).await
    }

    pub async fn openai_chat_completions(
        &self,
        up: &Upstream,
        body: Vec<u8>,
    ) -> Result<reqwest::Response> {
        let url = join_url(&up.base_url, "/v1", "/chat/completions");
        self.post(&url, self.openai_headers(up), body, up.timeout).await
    }

    pub async fn openai_responses(&self, up: &Upstream, body: Vec<u8>) -> Result<reqwest::Response> {
        let url = join_url(&up.base_url, "/v1", "/responses");
        self.post(&url, self.openai_headers(up), body, up.timeout).await
    }

    pub async fn openai_models(&self, up: &Upstream) -> Result<reqwest::Response> {
        let url = join_url(&up.base_url, "/v1", "/models");
        self.get(&url, self.openai_headers(up), up.timeout).await
    }

    pub async fn gemini_generate_content(
        &self,
        up: &Upstream,
        model: &str,
        body: Vec<u8>,
    ) -> Result<reqwest::Response> {
        let url = join_url(
            &up.base_url,
            "/v1beta",
            &format!("/models/{model}:generateContent"),
        );
        let mut headers = base_headers();
        insert_header(&mut headers, "x-goog-api-key", up.api_key.trim());
        apply_default_headers(&mut headers, &up.headers);
        self.post(&url, headers, body, up.timeout).await
    }

    fn openai_headers(&self, up: &Upstream) -> HeaderMap {
        let mut headers = base_headers();
        let key = up.api_key.trim();
        if !key.is_empty() {
            insert_header(&mut headers, "authorization", &format!("Bearer {key}"));
        }
        apply_default_headers(&mut headers, &up.headers);
        headers
    }

    async fn post(
        &self,
        url: &str,
        headers: HeaderMap,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<reqwest::Response> {
        self.http
            .post(url)
            .headers(headers)
            .timeout(timeout)
            .body(body)
            .send()
            .await
            .map_err(|err| GatewayError::UpstreamNetwork(err.to_string()))
    }

    async fn get(&self, url: &str, headers: HeaderMap, timeout: Duration) -> Result<reqwest::Response> {
        self.http
            .get(url)
            .headers(headers)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| GatewayError::UpstreamNetwork(err.to_string()))
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

fn base_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) {
    if value.trim().is_empty() {
        return;
    }
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        headers.insert(name, value);
    }
}

fn apply_default_headers(headers: &mut HeaderMap, defaults: &HashMap<String, String>) {
    for (name, value) in defaults {
        let name_trimmed = name.trim();
        if name_trimmed.is_empty() || value.trim().is_empty() {
            continue;
        }
        // Never let configured headers clobber the credential auth.
        if matches!(
            name_trimmed.to_ascii_lowercase().as_str(),
            "authorization" | "x-api-key" | "x-goog-api-key"
        ) {
            continue;
        }
        insert_header(headers, name_trimmed, value);
    }
}

fn join_url(base: &str, version_prefix: &str, path: &str) -> String {
    let base = base.trim().trim_end_matches('/');
    if base.ends_with(version_prefix) {
        format!("{base}{path}")
    } else {
        format!("{base}{version_prefix}{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_join_is_idempotent_across_v1_suffix() {
        assert_eq!(
            join_url("https://api.example.com", "/v1", "/messages"),
            "https://api.example.com/v1/messages"
        );
        assert_eq!(
            join_url("https://api.example.com/v1", "/v1", "/messages"),
            "https://api.example.com/v1/messages"
        );
        assert_eq!(
            join_url("https://api.example.com/v1/", "/v1", "/chat/completions"),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            join_url("https://g.example", "/v1beta", "/models/gemini-pro:generateContent"),
            "https://g.example/v1beta/models/gemini-pro:generateContent"
        );
        assert_eq!(
            join_url("https://g.example/v1beta", "/v1beta", "/models/m:generateContent"),
            "https://g.example/v1beta/models/m:generateContent"
        );
    }

    #[test]
    fn default_headers_cannot_override_auth() {
        let mut headers = base_headers();
        insert_header(&mut headers, "x-api-key", "real-key");
        let mut defaults = HashMap::new();
        defaults.insert("x-api-key".to_string(), "spoofed".to_string());
        defaults.insert("x-extra".to_string(), "kept".to_string());
        apply_default_headers(&mut headers, &defaults);
        assert_eq!(headers.get("x-api-key").unwrap(), "real-key");
        assert_eq!(headers.get("x-extra").unwrap(), "kept");
    }
}

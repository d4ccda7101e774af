//! Versioned in-memory view of the routing configuration.
//!
//! A snapshot is immutable once built; reloading swaps the whole value so
//! a single pick never observes providers and pools from different loads.
//! Reads outside the TTL window trigger a reload under the write lock with
//! a double-check.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::{GatewayError, Result};
use crate::proto::ProviderKind;
use crate::store::ConfigStore;

pub const SNAPSHOT_TTL: Duration = Duration::from_secs(5);
const MAX_WEIGHT_EXPANSION: u32 = 50;

#[derive(Clone, Debug)]
pub struct Provider {
    pub id: u64,
    pub kind: Option<ProviderKind>,
    pub type_name: String,
    pub base_url: String,
    pub default_headers: HashMap<String, String>,
    /// Keys lowercased for lookup; values sent verbatim.
    pub model_map: HashMap<String, String>,
    pub models: HashSet<String>,
    pub enabled: bool,
}

impl Provider {
    pub fn mapped_model(&self, requested: &str) -> Option<&str> {
        self.model_map
            .get(&requested.to_ascii_lowercase())
            .map(String::as_str)
            .filter(|mapped| !mapped.is_empty())
    }
}

#[derive(Clone, Debug)]
pub struct Credential {
    pub id: u64,
    pub provider_id: u64,
    pub api_key_ciphertext: Vec<u8>,
    pub weight: u32,
    pub concurrency_limit: Option<u32>,
    pub enabled: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolStrategy {
    WeightedRr,
    LeastInflight,
    PriorityFailover,
}

impl PoolStrategy {
    fn parse(raw: &str) -> Self {
        match raw.trim() {
            "least_inflight" => PoolStrategy::LeastInflight,
            "priority_failover" => PoolStrategy::PriorityFailover,
            _ => PoolStrategy::WeightedRr,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Tier {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub strategy: String,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub items: Vec<TierItem>,
}

impl Tier {
    pub fn applies_to_model(&self, model: &str) -> bool {
        if self.models.is_empty() {
            return true;
        }
        let model = model.trim();
        if model.is_empty() {
            return true;
        }
        self.models
            .iter()
            .any(|candidate| candidate.trim().eq_ignore_ascii_case(model))
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct TierItem {
    #[serde(default)]
    pub provider_id: u64,
    #[serde(default)]
    pub weight: u32,
}

#[derive(Clone, Debug)]
pub struct Pool {
    pub id: u64,
    pub name: String,
    pub client_key: String,
    pub strategy: PoolStrategy,
    pub tiers: Vec<Tier>,
    pub credential_ids: Vec<u64>,
    /// Weighted-RR expansion of `credential_ids`, each id repeated
    /// `min(weight, 50)` times; computed once per snapshot.
    pub expanded_credential_ids: Vec<u64>,
    /// Keys lowercased for lookup; applied after the provider map.
    pub model_map: HashMap<String, String>,
    pub enabled: bool,
}

impl Pool {
    pub fn mapped_model(&self, requested: &str) -> Option<&str> {
        self.model_map
            .get(&requested.to_ascii_lowercase())
            .map(String::as_str)
            .filter(|mapped| !mapped.is_empty())
    }
}

#[derive(Debug)]
pub struct ConfigSnapshot {
    pub loaded_at: Instant,
    pub providers: HashMap<u64, Provider>,
    pub credentials: HashMap<u64, Credential>,
    pub provider_creds: HashMap<u64, Vec<u64>>,
    pub pools: HashMap<u64, Pool>,
    pub pool_by_client_key: HashMap<String, u64>,
}

impl ConfigSnapshot {
    pub fn pool_for_client_key(&self, client_key: &str) -> Option<&Pool> {
        self.pool_by_client_key
            .get(client_key)
            .and_then(|id| self.pools.get(id))
    }
}

pub struct SnapshotLoader {
    store: Arc<dyn ConfigStore>,
    ttl: Duration,
    cache: RwLock<Option<Arc<ConfigSnapshot>>>,
}

impl SnapshotLoader {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self {
            store,
            ttl: SNAPSHOT_TTL,
            cache: RwLock::new(None),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub async fn get(&self) -> Result<Arc<ConfigSnapshot>> {
        let now = Instant::now();
        {
            let cache = self.cache.read().await;
            if let Some(snapshot) = cache.as_ref() {
                if now.duration_since(snapshot.loaded_at) <= self.ttl {
                    return Ok(snapshot.clone());
                }
            }
        }

        let mut cache = self.cache.write().await;
        if let Some(snapshot) = cache.as_ref() {
            if now.duration_since(snapshot.loaded_at) <= self.ttl {
                return Ok(snapshot.clone());
            }
        }
        let snapshot = Arc::new(self.load().await?);
        *cache = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Forces the next `get` to reload, regardless of TTL.
    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }

    async fn load(&self) -> Result<ConfigSnapshot> {
        let provider_rows = self.store.list_providers().await?;
        let credential_rows = self.store.list_credentials().await?;
        let pool_rows = self.store.list_pools().await?;

        let mut providers = HashMap::with_capacity(provider_rows.len());
        for row in provider_rows {
            providers.insert(
                row.id,
                Provider {
                    id: row.id,
                    kind: ProviderKind::parse(&row.provider_type),
                    type_name: row.provider_type,
                    base_url: row.base_url,
                    default_headers: parse_string_map(row.default_headers_json.as_deref()),
                    model_map: lowercase_keys(parse_string_map(row.model_map_json.as_deref())),
                    models: parse_model_set(row.models_json.as_deref()),
                    enabled: row.enabled,
                },
            );
        }

        let mut credentials = HashMap::with_capacity(credential_rows.len());
        let mut provider_creds: HashMap<u64, Vec<u64>> = HashMap::new();
        for row in credential_rows {
            provider_creds.entry(row.provider_id).or_default().push(row.id);
            credentials.insert(
                row.id,
                Credential {
                    id: row.id,
                    provider_id: row.provider_id,
                    api_key_ciphertext: row.api_key_ciphertext,
                    weight: row.weight.max(1),
                    concurrency_limit: row.concurrency_limit,
                    enabled: row.enabled,
                },
            );
        }

        let mut pools = HashMap::with_capacity(pool_rows.len());
        let mut pool_by_client_key = HashMap::new();
        for row in pool_rows {
            let strategy = PoolStrategy::parse(&row.strategy);
            let credential_ids: Vec<u64> =
                parse_json_in_json(row.credential_ids_json.as_deref()).unwrap_or_default();
            let tiers: Vec<Tier> =
                parse_json_in_json(row.tiers_json.as_deref()).unwrap_or_default();
            let expanded_credential_ids = if strategy == PoolStrategy::WeightedRr {
                expand_weights(&credential_ids, &credentials)
            } else {
                Vec::new()
            };
            let pool = Pool {
                id: row.id,
                name: row.name,
                client_key: row.client_key.clone(),
                strategy,
                tiers,
                credential_ids,
                expanded_credential_ids,
                model_map: lowercase_keys(parse_string_map(row.model_map_json.as_deref())),
                enabled: row.enabled,
            };
            if !pool.client_key.is_empty() {
                pool_by_client_key.insert(pool.client_key.clone(), pool.id);
            }
            pools.insert(pool.id, pool);
        }

        Ok(ConfigSnapshot {
            loaded_at: Instant::now(),
            providers,
            credentials,
            provider_creds,
            pools,
            pool_by_client_key,
        })
    }
}

fn expand_weights(credential_ids: &[u64], credentials: &HashMap<u64, Credential>) -> Vec<u64> {
    let mut expanded = Vec::new();
    for id in credential_ids {
        let Some(credential) = credentials.get(id).filter(|c| c.enabled) else {
            continue;
        };
        let weight = credential.weight.clamp(1, MAX_WEIGHT_EXPANSION);
        for _ in 0..weight {
            expanded.push(*id);
        }
    }
    expanded
}

/// Config JSON columns arrive either as native JSON or as a JSON-encoded
/// string containing JSON; unwrap the outer string before decoding.
fn parse_json_in_json<T: serde::de::DeserializeOwned>(raw: Option<&str>) -> Option<T> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    if raw.starts_with('"') && raw.ends_with('"') {
        let unwrapped: String = serde_json::from_str(raw).ok()?;
        return serde_json::from_str(&unwrapped).ok();
    }
    serde_json::from_str(raw).ok()
}

pub(crate) fn parse_string_map(raw: Option<&str>) -> HashMap<String, String> {
    let Some(value) = parse_json_in_json::<Value>(raw) else {
        return HashMap::new();
    };
    let Some(obj) = value.as_object() else {
        return HashMap::new();
    };
    obj.iter()
        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
        .collect()
}

fn lowercase_keys(map: HashMap<String, String>) -> HashMap<String, String> {
    map.into_iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v))
        .collect()
}

/// Accepts `["id", ...]`, `[{"id": ...}, ...]`, or an OpenAI-style
/// `{"data": [{"id": ...}]}` envelope.
pub(crate) fn parse_model_set(raw: Option<&str>) -> HashSet<String> {
    let Some(value) = parse_json_in_json::<Value>(raw) else {
        return HashSet::new();
    };
    let mut out = HashSet::new();
    match value {
        Value::Array(items) => collect_model_ids(&items, &mut out),
        Value::Object(obj) => {
            if let Some(Value::Array(items)) = obj.get("data") {
                collect_model_ids(items, &mut out);
            }
        }
        _ => {}
    }
    out
}

fn collect_model_ids(items: &[Value], out: &mut HashSet<String>) {
    for item in items {
        match item {
            Value::String(s) => {
                let s = s.trim();
                if !s.is_empty() {
                    out.insert(s.to_string());
                }
            }
            Value::Object(obj) => {
                if let Some(id) = obj.get("id").and_then(Value::as_str) {
                    let id = id.trim();
                    if !id.is_empty() {
                        out.insert(id.to_string());
                    }
                }
            }
            _ => {}
        }
    }
}

/// Convenience for callers that treat any load failure as "not configured".
pub async fn get_or_not_configured(loader: &SnapshotLoader) -> Result<Arc<ConfigSnapshot>> {
    let snapshot = loader.get().await?;
    if snapshot.pools.is_empty() || snapshot.credentials.is_empty() || snapshot.providers.is_empty()
    {
        return Err(GatewayError::NotConfigured);
    }
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_in_json_unwraps_outer_string() {
        let direct: Vec<u64> = parse_json_in_json(Some("[1,2,3]")).unwrap();
        assert_eq!(direct, vec![1, 2, 3]);
        let wrapped: Vec<u64> = parse_json_in_json(Some("\"[1,2,3]\"")).unwrap();
        assert_eq!(wrapped, vec![1, 2, 3]);
        assert!(parse_json_in_json::<Vec<u64>>(Some("")).is_none());
        assert!(parse_json_in_json::<Vec<u64>>(None).is_none());
    }

    #[test]
    fn model_set_accepts_all_three_shapes() {
        let list = parse_model_set(Some(r#"["a", "b", " "]"#));
        assert_eq!(list.len(), 2);
        let objects = parse_model_set(Some(r#"[{"id": "a"}, {"id": "b"}]"#));
        assert_eq!(objects.len(), 2);
        let envelope = parse_model_set(Some(r#"{"data": [{"id": "a"}]}"#));
        assert!(envelope.contains("a"));
        let wrapped = parse_model_set(Some(r#""[\"x\"]""#));
        assert!(wrapped.contains("x"));
    }

    #[test]
    fn string_map_keys_lowercased_values_verbatim() {
        let map = lowercase_keys(parse_string_map(Some(r#"{"Sonnet": "Claude-Sonnet-4-5"}"#)));
        assert_eq!(map.get("sonnet").map(String::as_str), Some("Claude-Sonnet-4-5"));
    }

    #[test]
    fn weight_expansion_caps_at_fifty() {
        let mut credentials = HashMap::new();
        credentials.insert(
            1,
            Credential {
                id: 1,
                provider_id: 1,
                api_key_ciphertext: Vec::new(),
                weight: 80,
                concurrency_limit: None,
                enabled: true,
            },
        );
        credentials.insert(
            2,
            Credential {
                id: 2,
                provider_id: 1,
                api_key_ciphertext: Vec::new(),
                weight: 1,
                concurrency_limit: None,
                enabled: false,
            },
        );
        let expanded = expand_weights(&[1, 2], &credentials);
        assert_eq!(expanded.len(), 50);
        assert!(expanded.iter().all(|id| *id == 1));
    }

    #[test]
    fn tier_model_match_is_case_insensitive() {
        let tier = Tier {
            name: String::new(),
            strategy: "priority".to_string(),
            models: vec!["GPT-4o".to_string()],
            items: Vec::new(),
        };
        assert!(tier.applies_to_model("gpt-4o"));
        assert!(!tier.applies_to_model("claude"));
        assert!(tier.applies_to_model(""));
    }
}

//! Upstream selection.
//!
//! `pick` resolves `(client_key, facade, model)` to a decrypted upstream:
//! pool lookup, stickiness cache, tiered or flat credential selection,
//! model mapping with catalog-aware alias fallback, then a
//! `start_request` on the chosen credential. Callers own the matching
//! `end_request`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::crypto::KeyCipher;
use crate::error::{GatewayError, Result};
use crate::health::HealthRegistry;
use crate::proto::{Facade, ProviderKind};
use crate::snapshot::{
    get_or_not_configured, ConfigSnapshot, Pool, PoolStrategy, SnapshotLoader,
};

pub const ROUTE_CACHE_TTL: Duration = Duration::from_secs(90);
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a facade needs to issue one upstream call.
#[derive(Clone, Debug)]
pub struct RoutedUpstream {
    pub pool_id: u64,
    pub credential_id: u64,
    pub provider_id: u64,
    pub provider_kind: Option<ProviderKind>,
    pub provider_type: String,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub headers: HashMap<String, String>,
    pub timeout: Duration,
}

#[derive(Clone, Debug)]
struct RouteCacheEntry {
    credential_id: u64,
    expires_at: Instant,
}

type RouteKey = (u64, String, String);

pub struct Router {
    loader: Arc<SnapshotLoader>,
    health: Arc<HealthRegistry>,
    cipher: Arc<KeyCipher>,
    route_cache: RwLock<HashMap<RouteKey, RouteCacheEntry>>,
    route_cache_ttl: Duration,
    pool_counters: Mutex<HashMap<u64, Arc<AtomicU64>>>,
}

impl Router {
    pub fn new(
        loader: Arc<SnapshotLoader>,
        health: Arc<HealthRegistry>,
        cipher: Arc<KeyCipher>,
    ) -> Self {
        Self {
            loader,
            health,
            cipher,
            route_cache: RwLock::new(HashMap::new()),
            route_cache_ttl: ROUTE_CACHE_TTL,
            pool_counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    pub async fn pick(
        &self,
        client_key: &str,
        facade: Facade,
        model: &str,
        exclude: &HashSet<u64>,
    ) -> Result<RoutedUpstream> {
        let cfg = get_or_not_configured(&self.loader).await?;

        let pool = cfg
            .pool_for_client_key(client_key)
            .ok_or(GatewayError::Unauthorized)?;

        // A credential whose blob fails to open is skipped in favor of a
        // different credential before the failure is surfaced.
        let mut skip_overlay: Option<HashSet<u64>> = None;
        let (credential, provider, api_key) = loop {
            let effective = skip_overlay.as_ref().unwrap_or(exclude);
            let credential_id = self
                .pick_credential_from_pool(&cfg, pool, facade, model, effective)
                .ok_or(GatewayError::NotConfigured)?;

            let credential = cfg
                .credentials
                .get(&credential_id)
                .ok_or(GatewayError::NotConfigured)?;
            let provider = cfg
                .providers
                .get(&credential.provider_id)
                .ok_or(GatewayError::NotConfigured)?;

            match self.cipher.open(&credential.api_key_ciphertext) {
                Ok(api_key_bytes) => {
                    let api_key = String::from_utf8(api_key_bytes).map_err(|_| {
                        GatewayError::BadUpstream("credential key is not UTF-8".to_string())
                    })?;
                    break (credential, provider, api_key);
                }
                Err(err) => {
                    let mut next = effective.clone();
                    if !next.insert(credential_id) || next.len() >= cfg.credentials.len() {
                        return Err(err.into());
                    }
                    tracing::warn!(credential_id, error = %err, "skipping undecryptable credential");
                    skip_overlay = Some(next);
                }
            }
        };

        let mut upstream_model = model.to_string();
        if let Some(mapped) = provider.mapped_model(model) {
            upstream_model = mapped.to_string();
        }
        if let Some(mapped) = pool.mapped_model(model) {
            upstream_model = mapped.to_string();
        }
        if !provider.models.is_empty() && !provider.models.contains(&upstream_model) {
            if let Some(fallback) = pick_model_for_alias(&provider.models, model) {
                upstream_model = fallback;
            }
        }

        self.health.start_request(credential.id);

        Ok(RoutedUpstream {
            pool_id: pool.id,
            credential_id: credential.id,
            provider_id: provider.id,
            provider_kind: provider.kind,
            provider_type: provider.type_name.clone(),
            base_url: provider.base_url.clone(),
            api_key,
            model: upstream_model,
            headers: provider.default_headers.clone(),
            timeout: DEFAULT_UPSTREAM_TIMEOUT,
        })
    }

    /// Updates the stickiness cache after a request completes. Successes
    /// refresh the entry; eviction-class failures remove it when it still
    /// points at the failing credential.
    pub fn record_route_result(
        &self,
        pool_id: u64,
        facade: Facade,
        model: &str,
        credential_id: u64,
        ok: bool,
        status: u16,
    ) {
        if pool_id == 0 || credential_id == 0 {
            return;
        }
        let key = route_key(pool_id, facade, model);
        if ok {
            let mut cache = self.route_cache.write().expect("route cache poisoned");
            cache.insert(
                key,
                RouteCacheEntry {
                    credential_id,
                    expires_at: Instant::now() + self.route_cache_ttl,
                },
            );
            return;
        }
        if matches!(status, 0 | 401 | 403 | 429) || status >= 500 {
            let mut cache = self.route_cache.write().expect("route cache poisoned");
            if cache
                .get(&key)
                .is_some_and(|entry| entry.credential_id == credential_id)
            {
                cache.remove(&key);
            }
        }
    }

    fn pick_credential_from_pool(
        &self,
        cfg: &ConfigSnapshot,
        pool: &Pool,
        facade: Facade,
        model: &str,
        exclude: &HashSet<u64>,
    ) -> Option<u64> {
        let now = Instant::now();

        let available = |credential_id: u64| -> bool {
            if exclude.contains(&credential_id) {
                return false;
            }
            let Some(credential) = cfg.credentials.get(&credential_id) else {
                return false;
            };
            if !credential.enabled {
                return false;
            }
            if !cfg
                .providers
                .get(&credential.provider_id)
                .is_some_and(|provider| provider.enabled)
            {
                return false;
            }
            if self.health.is_open(credential_id, now) {
                return false;
            }
            if let Some(limit) = credential.concurrency_limit {
                if self.health.inflight(credential_id) >= i64::from(limit) {
                    return false;
                }
            }
            true
        };

        // Sticky route first: an unexpired cache entry pointing at an
        // available credential short-circuits strategy selection.
        let key = route_key(pool.id, facade, model);
        let cached = {
            let cache = self.route_cache.read().expect("route cache poisoned");
            cache
                .get(&key)
                .map(|entry| (entry.credential_id, entry.expires_at))
        };
        if let Some((credential_id, expires_at)) = cached {
            if now < expires_at && available(credential_id) {
                return Some(credential_id);
            }
            if now >= expires_at {
                let mut cache = self.route_cache.write().expect("route cache poisoned");
                if cache.get(&key).is_some_and(|entry| now >= entry.expires_at) {
                    cache.remove(&key);
                }
            }
        }

        if !pool.tiers.is_empty() {
            return self.pick_from_tiers(cfg, pool, model, &available);
        }

        let ids: &[u64] = if pool.strategy == PoolStrategy::WeightedRr
            && !pool.expanded_credential_ids.is_empty()
        {
            &pool.expanded_credential_ids
        } else {
            &pool.credential_ids
        };
        if ids.is_empty() {
            return None;
        }

        match pool.strategy {
            PoolStrategy::LeastInflight => ids
                .iter()
                .copied()
                .filter(|id| available(*id))
                .min_by_key(|id| self.health.inflight(*id)),
            PoolStrategy::PriorityFailover => ids.iter().copied().find(|id| available(*id)),
            PoolStrategy::WeightedRr => {
                let counter = self.pool_counter(pool.id).fetch_add(1, Ordering::SeqCst) + 1;
                let n = ids.len() as u64;
                (0..n)
                    .map(|i| ids[((counter + i) % n) as usize])
                    .find(|id| available(*id))
            }
        }
    }

    fn pick_from_tiers(
        &self,
        cfg: &ConfigSnapshot,
        pool: &Pool,
        model: &str,
        available: &dyn Fn(u64) -> bool,
    ) -> Option<u64> {
        for tier in &pool.tiers {
            if !tier.applies_to_model(model) || tier.items.is_empty() {
                continue;
            }

            // Best available credential of one tier item's provider, by score.
            let best_of_provider = |provider_id: u64| -> Option<(u64, f64)> {
                let provider = cfg.providers.get(&provider_id)?;
                if !provider.models.is_empty() {
                    let mut mapped = model.to_string();
                    if let Some(m) = provider.mapped_model(model) {
                        mapped = m.to_string();
                    }
                    if let Some(m) = pool.mapped_model(model) {
                        mapped = m.to_string();
                    }
                    if !provider.models.contains(&mapped)
                        && pick_model_for_alias(&provider.models, model).is_none()
                    {
                        return None;
                    }
                }
                cfg.provider_creds
                    .get(&provider_id)?
                    .iter()
                    .copied()
                    .filter(|id| available(*id))
                    .map(|id| {
                        let weight = cfg.credentials.get(&id).map(|c| c.weight).unwrap_or(1);
                        (id, self.health.score(id, weight))
                    })
                    .max_by(|a, b| a.1.total_cmp(&b.1))
            };

            if tier.strategy.trim() == "priority" {
                for item in &tier.items {
                    if let Some((credential_id, _)) = best_of_provider(item.provider_id) {
                        return Some(credential_id);
                    }
                }
                continue;
            }

            let mut candidates = Vec::<(u64, f64)>::new();
            let mut total_weight = 0.0;
            for item in &tier.items {
                let item_weight = f64::from(item.weight.max(1));
                let Some((credential_id, score)) = best_of_provider(item.provider_id) else {
                    continue;
                };
                let weighted = item_weight * score;
                candidates.push((credential_id, weighted));
                total_weight += weighted;
            }

            if candidates.is_empty() {
                continue;
            }
            if total_weight <= 0.0 {
                return Some(candidates[0].0);
            }
            let counter = self.pool_counter(pool.id).fetch_add(1, Ordering::SeqCst) + 1;
            let pick = (counter % 1000) as f64 / 1000.0 * total_weight;
            let mut current = 0.0;
            for (credential_id, weighted) in &candidates {
                current += weighted;
                if pick <= current {
                    return Some(*credential_id);
                }
            }
            return Some(candidates[candidates.len() - 1].0);
        }
        None
    }

    fn pool_counter(&self, pool_id: u64) -> Arc<AtomicU64> {
        let mut counters = self.pool_counters.lock().expect("pool counters poisoned");
        counters.entry(pool_id).or_default().clone()
    }

    /// Every model name a pool's client can ask for: pool map keys, tier
    /// model lists, and each reachable provider's catalog and map keys.
    pub async fn pool_models(&self, client_key: &str) -> Result<Vec<String>> {
        let cfg = self.loader.get().await?;
        let pool = cfg
            .pool_for_client_key(client_key)
            .ok_or(GatewayError::Unauthorized)?;

        let mut models = HashSet::<String>::new();
        for key in pool.model_map.keys() {
            if !key.is_empty() {
                models.insert(key.clone());
            }
        }

        let mut provider_ids = HashSet::<u64>::new();
        for credential_id in &pool.credential_ids {
            if let Some(credential) = cfg.credentials.get(credential_id) {
                provider_ids.insert(credential.provider_id);
            }
        }
        for tier in &pool.tiers {
            for model in &tier.models {
                if !model.is_empty() {
                    models.insert(model.clone());
                }
            }
            for item in &tier.items {
                provider_ids.insert(item.provider_id);
            }
        }

        for provider_id in provider_ids {
            if let Some(provider) = cfg.providers.get(&provider_id) {
                models.extend(provider.models.iter().cloned());
                models.extend(provider.model_map.keys().filter(|k| !k.is_empty()).cloned());
            }
        }

        let mut out: Vec<String> = models.into_iter().collect();
        out.sort();
        Ok(out)
    }
}

fn route_key(pool_id: u64, facade: Facade, model: &str) -> RouteKey {
    (
        pool_id,
        facade.as_str().to_string(),
        model.trim().to_string(),
    )
}

/// Catalog-aware alias substitution: when a provider's catalog lacks the
/// requested model, score every catalog id against the alias's size class
/// and return the best match.
pub fn pick_model_for_alias(models: &HashSet<String>, alias: &str) -> Option<String> {
    let alias = alias.trim().to_ascii_lowercase();
    if alias.is_empty() || models.is_empty() {
        return None;
    }
    let small =
        alias.contains("small") || alias.contains("haiku") || alias.contains("fast");

    let score_of = |id: &str| -> i32 {
        let s = id.to_ascii_lowercase();
        let has = |needle: &str| s.contains(needle);
        let mut score = 0;
        if small {
            if has("haiku") {
                score += 6;
            }
            if has("mini") || has("small") {
                score += 5;
            }
            if has("flash") || has("lite") {
                score += 4;
            }
            if has("nano") {
                score += 3;
            }
            if has("3b") || has("4b") || has("7b") || has("8b") {
                score += 2;
            }
            if has("sonnet") || has("opus") {
                score -= 3;
            }
        } else {
            if has("sonnet") {
                score += 6;
            }
            if has("opus") {
                score += 5;
            }
            if has("claude") {
                score += 4;
            }
            if has("gpt-4") || has("kimi") || has("glm") || has("deepseek") {
                score += 3;
            }
            if has("coder") || has("code") {
                score += 4;
            }
            if has("reasoner") || has("thinking") {
                score += 2;
            }
            if has("haiku") || has("mini") || has("flash") || has("lite") {
                score -= 2;
            }
        }
        score - (id.len() as i32 / 12).min(6)
    };

    models
        .iter()
        .map(|id| (id, score_of(id)))
        .max_by(|(a_id, a_score), (b_id, b_score)| {
            a_score.cmp(b_score).then_with(|| {
                // Ties prefer the shorter id, then lexicographically smaller.
                b_id.len()
                    .cmp(&a_id.len())
                    .then_with(|| b_id.as_str().cmp(a_id.as_str()))
            })
        })
        .map(|(id, _)| id.clone())
}

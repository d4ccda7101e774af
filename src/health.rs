//! Per-credential health state: inflight counters, EWMA latency, and
//! graded open-circuit windows.
//!
//! Entries are created on first reference and live for the process
//! lifetime; deleting a credential from the config does not purge its
//! entry. Inflight uses an atomic so reads stay lock-free; everything
//! else sits behind a per-credential mutex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const EWMA_KEEP: f64 = 0.8;
const EWMA_BLEND: f64 = 0.2;

#[derive(Debug, Default)]
struct HealthState {
    failures: u32,
    successes: u64,
    total: u64,
    ewma_latency_ms: f64,
    open_until: Option<Instant>,
    last_status: u16,
    last_latency: Duration,
    last_seen: Option<Instant>,
}

#[derive(Debug, Default)]
struct CredentialHealth {
    inflight: AtomicI64,
    state: Mutex<HealthState>,
}

/// Point-in-time view of one credential's health, for admin surfaces and
/// tests.
#[derive(Clone, Debug)]
pub struct HealthSnapshot {
    pub inflight: i64,
    pub consecutive_failures: u32,
    pub successes: u64,
    pub total: u64,
    pub ewma_latency_ms: f64,
    pub open: bool,
    pub last_status: u16,
}

#[derive(Debug, Default)]
pub struct HealthRegistry {
    entries: Mutex<HashMap<u64, Arc<CredentialHealth>>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, credential_id: u64) -> Arc<CredentialHealth> {
        let mut entries = self.entries.lock().expect("health registry poisoned");
        entries.entry(credential_id).or_default().clone()
    }

    fn peek(&self, credential_id: u64) -> Option<Arc<CredentialHealth>> {
        let entries = self.entries.lock().expect("health registry poisoned");
        entries.get(&credential_id).cloned()
    }

    pub fn start_request(&self, credential_id: u64) {
        self.entry(credential_id)
            .inflight
            .fetch_add(1, Ordering::SeqCst);
    }

    /// Must be called exactly once per `start_request`, on every control
    /// path.
    pub fn end_request(&self, credential_id: u64, ok: bool, status: u16, latency: Duration) {
        if credential_id == 0 {
            return;
        }
        let entry = self.entry(credential_id);
        entry.inflight.fetch_sub(1, Ordering::SeqCst);

        let now = Instant::now();
        let mut st = entry.state.lock().expect("credential state poisoned");

        st.last_latency = latency;
        st.last_seen = Some(now);
        st.last_status = status;
        st.total += 1;
        let latency_ms = latency.as_millis() as f64;
        if st.ewma_latency_ms == 0.0 {
            st.ewma_latency_ms = latency_ms;
        } else if latency_ms > 0.0 {
            st.ewma_latency_ms = st.ewma_latency_ms * EWMA_KEEP + latency_ms * EWMA_BLEND;
        }

        if ok && (200..500).contains(&status) && !matches!(status, 401 | 403 | 429) {
            st.successes += 1;
            st.failures = 0;
            st.open_until = None;
            return;
        }

        st.failures += 1;
        let open_for = match status {
            401 | 403 => Some(Duration::from_secs(15 * 60)),
            429 => {
                let d = Duration::from_secs(5 * (1 << st.failures.min(6)));
                Some(d.min(Duration::from_secs(120)))
            }
            s if s >= 500 || s == 0 => {
                let d = Duration::from_secs(15 * (1 << st.failures.min(6)));
                Some(d.min(Duration::from_secs(300)))
            }
            _ if st.failures >= 3 => Some(Duration::from_secs(30)),
            _ => None,
        };
        if let Some(d) = open_for {
            st.open_until = Some(now + d);
        }
    }

    pub fn is_open(&self, credential_id: u64, now: Instant) -> bool {
        let Some(entry) = self.peek(credential_id) else {
            return false;
        };
        let st = entry.state.lock().expect("credential state poisoned");
        st.open_until.is_some_and(|until| now < until)
    }

    pub fn inflight(&self, credential_id: u64) -> i64 {
        self.peek(credential_id)
            .map(|entry| entry.inflight.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Selection score for a credential: base weight discounted by the
    /// smoothed success ratio, consecutive failures, EWMA latency, and
    /// current inflight. Monotone in each health dimension.
    pub fn score(&self, credential_id: u64, base_weight: u32) -> f64 {
        let weight = f64::from(base_weight.max(1));
        let inflight = self.inflight(credential_id) as f64;
        let Some(entry) = self.peek(credential_id) else {
            return weight / (1.0 + inflight);
        };
        let st = entry.state.lock().expect("credential state poisoned");
        let health = (st.successes as f64 + 1.0) / (st.total as f64 + 2.0);
        let fail_penalty = 1.0 / (1.0 + f64::from(st.failures));
        let latency_penalty = if st.ewma_latency_ms > 0.0 {
            // Tuned so a 3 s EWMA difference costs roughly a 2x score gap.
            1.0 / (1.0 + st.ewma_latency_ms / 2500.0)
        } else {
            1.0
        };
        let inflight_penalty = 1.0 / (1.0 + inflight);
        weight * health * fail_penalty * latency_penalty * inflight_penalty
    }

    pub fn snapshot(&self, credential_id: u64) -> HealthSnapshot {
        let now = Instant::now();
        let Some(entry) = self.peek(credential_id) else {
            return HealthSnapshot {
                inflight: 0,
                consecutive_failures: 0,
                successes: 0,
                total: 0,
                ewma_latency_ms: 0.0,
                open: false,
                last_status: 0,
            };
        };
        let inflight = entry.inflight.load(Ordering::SeqCst);
        let st = entry.state.lock().expect("credential state poisoned");
        HealthSnapshot {
            inflight,
            consecutive_failures: st.failures,
            successes: st.successes,
            total: st.total,
            ewma_latency_ms: st.ewma_latency_ms,
            open: st.open_until.is_some_and(|until| now < until),
            last_status: st.last_status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inflight_balances_to_zero() {
        let reg = HealthRegistry::new();
        reg.start_request(1);
        reg.start_request(1);
        assert_eq!(reg.inflight(1), 2);
        reg.end_request(1, true, 200, Duration::from_millis(10));
        reg.end_request(1, true, 200, Duration::from_millis(10));
        assert_eq!(reg.inflight(1), 0);
    }

    #[test]
    fn success_resets_failures_and_circuit() {
        let reg = HealthRegistry::new();
        reg.start_request(1);
        reg.end_request(1, false, 500, Duration::from_millis(5));
        assert!(reg.is_open(1, Instant::now()));
        reg.start_request(1);
        reg.end_request(1, true, 200, Duration::from_millis(5));
        assert!(!reg.is_open(1, Instant::now()));
        assert_eq!(reg.snapshot(1).consecutive_failures, 0);
    }

    #[test]
    fn auth_failure_opens_long_circuit() {
        let reg = HealthRegistry::new();
        reg.start_request(1);
        reg.end_request(1, false, 401, Duration::from_millis(5));
        // 15 minutes out is still open well past any backoff cap.
        assert!(reg.is_open(1, Instant::now() + Duration::from_secs(14 * 60)));
    }

    #[test]
    fn rate_limit_backoff_grows_and_caps() {
        let reg = HealthRegistry::new();
        for _ in 0..3 {
            reg.start_request(7);
            reg.end_request(7, false, 429, Duration::from_millis(5));
        }
        // failures=3 -> 5 * 2^3 = 40 s
        let now = Instant::now();
        assert!(reg.is_open(7, now + Duration::from_secs(39)));
        assert!(!reg.is_open(7, now + Duration::from_secs(121)));

        for _ in 0..10 {
            reg.start_request(7);
            reg.end_request(7, false, 429, Duration::from_millis(5));
        }
        // capped at 120 s
        let now = Instant::now();
        assert!(reg.is_open(7, now + Duration::from_secs(119)));
        assert!(!reg.is_open(7, now + Duration::from_secs(121)));
    }

    #[test]
    fn plain_4xx_opens_only_after_three_failures() {
        let reg = HealthRegistry::new();
        reg.start_request(2);
        reg.end_request(2, false, 404, Duration::from_millis(5));
        reg.start_request(2);
        reg.end_request(2, false, 404, Duration::from_millis(5));
        assert!(!reg.is_open(2, Instant::now()));
        reg.start_request(2);
        reg.end_request(2, false, 404, Duration::from_millis(5));
        assert!(reg.is_open(2, Instant::now()));
    }

    #[test]
    fn rate_limited_status_counts_as_failure_even_when_transport_ok() {
        let reg = HealthRegistry::new();
        reg.start_request(3);
        reg.end_request(3, true, 429, Duration::from_millis(5));
        assert!(reg.is_open(3, Instant::now()));
    }

    #[test]
    fn ewma_seeds_then_blends() {
        let reg = HealthRegistry::new();
        reg.start_request(4);
        reg.end_request(4, true, 200, Duration::from_millis(100));
        assert_eq!(reg.snapshot(4).ewma_latency_ms, 100.0);
        reg.start_request(4);
        reg.end_request(4, true, 200, Duration::from_millis(200));
        let ewma = reg.snapshot(4).ewma_latency_ms;
        assert!((ewma - 120.0).abs() < 1e-9);
    }

    #[test]
    fn score_is_monotone_in_failures_latency_inflight() {
        let reg = HealthRegistry::new();
        let base = reg.score(10, 1);

        reg.start_request(10);
        let busier = reg.score(10, 1);
        assert!(busier < base);
        reg.end_request(10, false, 500, Duration::from_millis(4000));
        let failed = reg.score(10, 1);
        assert!(failed < base);

        // A clean credential with the same weight scores higher.
        assert!(reg.score(11, 1) > failed);
        // Weight scales the score upward.
        assert!(reg.score(11, 5) > reg.score(11, 1));
    }
}

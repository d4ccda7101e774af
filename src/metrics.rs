//! Request counters and latency histograms, rendered as Prometheus text.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

const LATENCY_BUCKETS_MS: [f64; 12] = [
    5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0, 30000.0,
];

#[derive(Clone, Debug, Default)]
struct LatencyHistogram {
    buckets: [u64; LATENCY_BUCKETS_MS.len()],
    sum_ms: f64,
    count: u64,
}

impl LatencyHistogram {
    fn observe(&mut self, value_ms: f64) {
        for (i, bound) in LATENCY_BUCKETS_MS.iter().enumerate() {
            if value_ms <= *bound {
                self.buckets[i] += 1;
            }
        }
        self.sum_ms += value_ms;
        self.count += 1;
    }
}

type SeriesKey = (String, String, u16);

#[derive(Debug, Default)]
struct MetricsInner {
    requests_total: BTreeMap<SeriesKey, u64>,
    latency: BTreeMap<SeriesKey, LatencyHistogram>,
}

#[derive(Debug, Default)]
pub struct Metrics {
    inner: Mutex<MetricsInner>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe_request(&self, facade: &str, provider: &str, status: u16, latency: Duration) {
        let key = (facade.to_string(), provider.to_string(), status);
        let mut inner = self.inner.lock().expect("metrics poisoned");
        *inner.requests_total.entry(key.clone()).or_default() += 1;
        inner
            .latency
            .entry(key)
            .or_default()
            .observe(latency.as_millis() as f64);
    }

    /// Prometheus exposition text for `GET /metrics`.
    pub fn render(&self) -> String {
        let inner = self.inner.lock().expect("metrics poisoned");
        let mut out = String::new();

        out.push_str("# HELP llm_relay_requests_total Total requests processed by the relay.\n");
        out.push_str("# TYPE llm_relay_requests_total counter\n");
        for ((facade, provider, status), count) in &inner.requests_total {
            out.push_str(&format!(
                "llm_relay_requests_total{{facade=\"{facade}\",provider=\"{provider}\",status=\"{status}\"}} {count}\n"
            ));
        }

        out.push_str("# HELP llm_relay_request_latency_ms Request latency in milliseconds.\n");
        out.push_str("# TYPE llm_relay_request_latency_ms histogram\n");
        for ((facade, provider, status), histogram) in &inner.latency {
            let labels = format!("facade=\"{facade}\",provider=\"{provider}\",status=\"{status}\"");
            for (i, bound) in LATENCY_BUCKETS_MS.iter().enumerate() {
                out.push_str(&format!(
                    "llm_relay_request_latency_ms_bucket{{{labels},le=\"{bound}\"}} {}\n",
                    histogram.buckets[i]
                ));
            }
            out.push_str(&format!(
                "llm_relay_request_latency_ms_bucket{{{labels},le=\"+Inf\"}} {}\n",
                histogram.count
            ));
            out.push_str(&format!(
                "llm_relay_request_latency_ms_sum{{{labels}}} {}\n",
                histogram.sum_ms
            ));
            out.push_str(&format!(
                "llm_relay_request_latency_ms_count{{{labels}}} {}\n",
                histogram.count
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_and_histogram_accumulate() {
        let metrics = Metrics::new();
        metrics.observe_request("openai", "anthropic", 200, Duration::from_millis(30));
        metrics.observe_request("openai", "anthropic", 200, Duration::from_millis(700));
        metrics.observe_request("anthropic", "openai", 502, Duration::from_millis(5));

        let text = metrics.render();
        assert!(text.contains(
            "llm_relay_requests_total{facade=\"openai\",provider=\"anthropic\",status=\"200\"} 2"
        ));
        assert!(text.contains(
            "llm_relay_requests_total{facade=\"anthropic\",provider=\"openai\",status=\"502\"} 1"
        ));
        // 30 ms lands in the 50 ms bucket; 700 ms only in >=1000 ms buckets.
        assert!(text.contains(
            "llm_relay_request_latency_ms_bucket{facade=\"openai\",provider=\"anthropic\",status=\"200\",le=\"50\"} 1"
        ));
        assert!(text.contains(
            "llm_relay_request_latency_ms_bucket{facade=\"openai\",provider=\"anthropic\",status=\"200\",le=\"1000\"} 2"
        ));
        assert!(text.contains(
            "llm_relay_request_latency_ms_count{facade=\"openai\",provider=\"anthropic\",status=\"200\"} 2"
        ));
    }
}

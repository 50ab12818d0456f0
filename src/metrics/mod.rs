//! Metrics collector: counters, gauges, and timing histograms with adaptive
//! sampling driven by live connection count (§4.6).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::config::AdaptiveThresholds;

/// Current collection fidelity, driven by connection-count thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum CollectionMode {
    Detailed,
    Normal,
    Minimal,
}

impl CollectionMode {
    /// Fraction of timing observations actually recorded at this mode.
    fn histogram_sample_rate(self) -> f64 {
        match self {
            CollectionMode::Detailed => 1.0,
            CollectionMode::Normal => 0.10,
            CollectionMode::Minimal => 0.01,
        }
    }

    fn byte_accounting_sample_rate(self) -> f64 {
        match self {
            CollectionMode::Detailed => 1.0,
            CollectionMode::Normal => 0.10,
            CollectionMode::Minimal => 0.0,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct HistogramStats {
    count: u64,
    sum: f64,
    max: f64,
}

/// Counters, gauges, and histograms, keyed by a metric name that already
/// encodes its label values (e.g. `"http_requests_total{status=200}"`).
pub struct MetricsCollector {
    counters: DashMap<String, AtomicU64>,
    gauges: DashMap<String, Mutex<f64>>,
    histograms: DashMap<String, Mutex<HistogramStats>>,
    mode: RwLock<CollectionMode>,
    connection_count: AtomicU64,
    thresholds: AdaptiveThresholds,
}

impl MetricsCollector {
    pub fn new(thresholds: AdaptiveThresholds) -> Arc<Self> {
        Arc::new(Self {
            counters: DashMap::new(),
            gauges: DashMap::new(),
            histograms: DashMap::new(),
            mode: RwLock::new(CollectionMode::Detailed),
            connection_count: AtomicU64::new(0),
            thresholds,
        })
    }

    pub fn mode(&self) -> CollectionMode {
        *self.mode.read()
    }

    fn mode_for_count(&self, count: u64) -> CollectionMode {
        if count >= self.thresholds.minimal_threshold {
            CollectionMode::Minimal
        } else if count >= self.thresholds.normal_threshold {
            CollectionMode::Normal
        } else {
            CollectionMode::Detailed
        }
    }

    /// Called whenever the live connection count changes; re-evaluates the
    /// collection mode immediately.
    pub fn set_connection_count(&self, count: u64) {
        self.connection_count.store(count, Ordering::Relaxed);
        self.reevaluate_mode(count);
    }

    fn reevaluate_mode(&self, count: u64) {
        let target = self.mode_for_count(count);
        let mut mode = self.mode.write();
        if *mode != target {
            tracing::info!(from = %*mode, to = %target, connections = count, "metrics collection mode changed");
            *mode = target;
        }
    }

    fn increment_counter(&self, key: impl Into<String>) {
        self.counters.entry(key.into()).or_insert_with(|| AtomicU64::new(0)).fetch_add(1, Ordering::Relaxed);
    }

    fn observe_histogram(&self, key: impl Into<String>, value: f64) {
        let mut stats = self
            .histograms
            .entry(key.into())
            .or_insert_with(|| Mutex::new(HistogramStats::default()))
            .lock();
        stats.count += 1;
        stats.sum += value;
        stats.max = stats.max.max(value);
    }

    fn should_sample(&self, rate: f64) -> bool {
        rate >= 1.0 || rand::random::<f64>() < rate
    }

    pub fn record_http_request(&self, method: &str, path: &str, status: u16, seconds: f64) {
        self.increment_counter(format!("http_requests_total{{method={method},path={path},status={status}}}"));
        let mode = self.mode();
        if self.should_sample(mode.histogram_sample_rate()) {
            self.observe_histogram("http_request_duration_seconds", seconds);
        }
    }

    pub fn record_bridge_request(
        &self,
        protocol: &str,
        service: &str,
        status: &str,
        seconds: f64,
        bytes: u64,
    ) {
        self.increment_counter(format!(
            "bridge_requests_total{{protocol={protocol},service={service},status={status}}}"
        ));
        let mode = self.mode();
        if self.should_sample(mode.histogram_sample_rate()) {
            self.observe_histogram("bridge_request_duration_seconds", seconds);
        }
        if self.should_sample(mode.byte_accounting_sample_rate()) {
            self.observe_histogram("bridge_request_bytes", bytes as f64);
        }
    }

    pub fn record_network(&self, bytes_in: u64, bytes_out: u64) {
        self.increment_counter("network_bytes_in_events_total");
        self.increment_counter("network_bytes_out_events_total");
        let mode = self.mode();
        if self.should_sample(mode.byte_accounting_sample_rate()) {
            self.observe_histogram("network_bytes_in", bytes_in as f64);
            self.observe_histogram("network_bytes_out", bytes_out as f64);
        }
    }

    pub fn set_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        let key = gauge_key(name, labels);
        *self.gauges.entry(key).or_insert_with(|| Mutex::new(0.0)).lock() = value;
    }

    pub fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        self.gauges.get(&gauge_key(name, labels)).map(|g| *g.lock())
    }

    pub fn counter(&self, key: &str) -> u64 {
        self.counters.get(key).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
    }

    /// Periodically re-checks the collection mode against the last known
    /// connection count, so the collector cannot get stuck at a higher
    /// fidelity level if load drops without an explicit notification.
    pub fn spawn_safety_tick(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let count = self.connection_count.load(Ordering::Relaxed);
                self.reevaluate_mode(count);
            }
        })
    }
}

fn gauge_key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let pairs = labels.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(",");
    format!("{name}{{{pairs}}}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> AdaptiveThresholds {
        AdaptiveThresholds { normal_threshold: 10, minimal_threshold: 20 }
    }

    #[test]
    fn starts_in_detailed_mode() {
        let metrics = MetricsCollector::new(thresholds());
        assert_eq!(metrics.mode(), CollectionMode::Detailed);
    }

    #[test]
    fn escalates_to_normal_then_minimal() {
        let metrics = MetricsCollector::new(thresholds());
        metrics.set_connection_count(15);
        assert_eq!(metrics.mode(), CollectionMode::Normal);
        metrics.set_connection_count(25);
        assert_eq!(metrics.mode(), CollectionMode::Minimal);
    }

    #[test]
    fn drops_back_to_detailed_when_load_falls() {
        let metrics = MetricsCollector::new(thresholds());
        metrics.set_connection_count(25);
        metrics.set_connection_count(1);
        assert_eq!(metrics.mode(), CollectionMode::Detailed);
    }

    #[test]
    fn http_request_increments_counter() {
        let metrics = MetricsCollector::new(thresholds());
        metrics.record_http_request("GET", "/health", 200, 0.01);
        assert_eq!(metrics.counter("http_requests_total{method=GET,path=/health,status=200}"), 1);
    }

    #[test]
    fn gauge_roundtrips() {
        let metrics = MetricsCollector::new(thresholds());
        metrics.set_gauge("pool_size", 4.0, &[("protocol", "rpc")]);
        assert_eq!(metrics.gauge("pool_size", &[("protocol", "rpc")]), Some(4.0));
    }
}

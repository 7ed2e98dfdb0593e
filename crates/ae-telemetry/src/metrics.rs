use ahash::AHashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

/// Distribution of observed values across fixed buckets.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    /// f64 bits, updated with a CAS loop.
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let mut current = self.sum.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + value).to_bits();
            match self
                .sum
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        if let Some(i) = self.buckets.iter().position(|b| value <= *b) {
            self.counts[i].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get_sum(&self) -> f64 {
        f64::from_bits(self.sum.load(Ordering::Relaxed))
    }

    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// `(upper bound, cumulative count)` pairs, excluding `+Inf`.
    pub fn cumulative(&self) -> Vec<(f64, u64)> {
        let mut running = 0;
        self.buckets
            .iter()
            .zip(&self.counts)
            .map(|(bound, count)| {
                running += count.load(Ordering::Relaxed);
                (*bound, running)
            })
            .collect()
    }
}

/// Buckets for stage durations in seconds: tool runs take from seconds to
/// an hour.
pub fn stage_duration_buckets() -> Vec<f64> {
    vec![
        1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0, 3600.0,
    ]
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// A sorted list of key=value pairs distinguishing members of one metric
/// family.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut v: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        v.sort_by(|a, b| a.0.cmp(&b.0));
        Self(v)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `{key="value",key2="value2"}`, or the empty string without labels.
    pub fn prometheus_str(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let inner: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, escape_label(v)))
            .collect();
        format!("{{{}}}", inner.join(","))
    }

    /// Same as `prometheus_str` with one extra pair appended last.
    fn prometheus_str_with(&self, key: &str, value: &str) -> String {
        let mut inner: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, escape_label(v)))
            .collect();
        inner.push(format!("{key}=\"{value}\""));
        format!("{{{}}}", inner.join(","))
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

type Key = (String, Labels);

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Counters, gauges and histograms keyed by name plus label set.
///
/// Registration takes a write lock once per series; updates after that are
/// a read lock plus an atomic op.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: RwLock<AHashMap<Key, AtomicU64>>,
    gauges: RwLock<AHashMap<Key, AtomicI64>>,
    histograms: RwLock<AHashMap<Key, Histogram>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Counters -----------------------------------------------------------

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.increment_counter_by(name, labels, 1);
    }

    pub fn increment_counter_by(&self, name: &str, labels: &[(&str, &str)], amount: u64) {
        let key = (name.to_string(), Labels::new(labels));
        if let Some(c) = read(&self.counters).get(&key) {
            c.fetch_add(amount, Ordering::Relaxed);
            return;
        }
        write(&self.counters)
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(amount, Ordering::Relaxed);
    }

    pub fn get_counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (name.to_string(), Labels::new(labels));
        read(&self.counters)
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    // -- Gauges -------------------------------------------------------------

    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: i64) {
        let key = (name.to_string(), Labels::new(labels));
        if let Some(g) = read(&self.gauges).get(&key) {
            g.store(value, Ordering::Relaxed);
            return;
        }
        write(&self.gauges)
            .entry(key)
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    /// Add `delta` (possibly negative) to a gauge.
    pub fn add_gauge(&self, name: &str, labels: &[(&str, &str)], delta: i64) {
        let key = (name.to_string(), Labels::new(labels));
        if let Some(g) = read(&self.gauges).get(&key) {
            g.fetch_add(delta, Ordering::Relaxed);
            return;
        }
        write(&self.gauges)
            .entry(key)
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get_gauge(&self, name: &str, labels: &[(&str, &str)]) -> i64 {
        let key = (name.to_string(), Labels::new(labels));
        read(&self.gauges)
            .get(&key)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    // -- Histograms ---------------------------------------------------------

    /// Record into a histogram, creating it with stage-duration buckets on
    /// first use.
    pub fn record_histogram(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = (name.to_string(), Labels::new(labels));
        if let Some(h) = read(&self.histograms).get(&key) {
            h.observe(value);
            return;
        }
        write(&self.histograms)
            .entry(key)
            .or_insert_with(|| Histogram::new(stage_duration_buckets()))
            .observe(value);
    }

    /// `(count, sum)` of a histogram, if it exists.
    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> Option<(u64, f64)> {
        let key = (name.to_string(), Labels::new(labels));
        read(&self.histograms)
            .get(&key)
            .map(|h| (h.get_count(), h.get_sum()))
    }

    // -- Export --------------------------------------------------------------

    /// All metrics in Prometheus text exposition format, families sorted by
    /// name.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        {
            let map = read(&self.counters);
            let mut series: Vec<(&Key, u64)> = map
                .iter()
                .map(|(k, v)| (k, v.load(Ordering::Relaxed)))
                .collect();
            series.sort_by(|a, b| a.0.cmp(b.0));
            let mut last: Option<&str> = None;
            for ((name, labels), value) in series {
                if last != Some(name.as_str()) {
                    let _ = writeln!(out, "# TYPE {name} counter");
                    last = Some(name.as_str());
                }
                let _ = writeln!(out, "{name}{} {value}", labels.prometheus_str());
            }
        }

        {
            let map = read(&self.gauges);
            let mut series: Vec<(&Key, i64)> = map
                .iter()
                .map(|(k, v)| (k, v.load(Ordering::Relaxed)))
                .collect();
            series.sort_by(|a, b| a.0.cmp(b.0));
            let mut last: Option<&str> = None;
            for ((name, labels), value) in series {
                if last != Some(name.as_str()) {
                    let _ = writeln!(out, "# TYPE {name} gauge");
                    last = Some(name.as_str());
                }
                let _ = writeln!(out, "{name}{} {value}", labels.prometheus_str());
            }
        }

        {
            let map = read(&self.histograms);
            let mut series: Vec<(&Key, &Histogram)> = map.iter().collect();
            series.sort_by(|a, b| a.0.cmp(b.0));
            let mut last: Option<&str> = None;
            for ((name, labels), h) in series {
                if last != Some(name.as_str()) {
                    let _ = writeln!(out, "# TYPE {name} histogram");
                    last = Some(name.as_str());
                }
                for (bound, cumulative) in h.cumulative() {
                    let le = bound.to_string();
                    let _ = writeln!(
                        out,
                        "{name}_bucket{} {cumulative}",
                        labels.prometheus_str_with("le", &le)
                    );
                }
                let _ = writeln!(
                    out,
                    "{name}_bucket{} {}",
                    labels.prometheus_str_with("le", "+Inf"),
                    h.get_count()
                );
                let _ = writeln!(out, "{name}_sum{} {}", labels.prometheus_str(), h.get_sum());
                let _ = writeln!(out, "{name}_count{} {}", labels.prometheus_str(), h.get_count());
            }
        }

        out
    }

    /// Counters and gauges as a flat JSON object, keyed by series.
    pub fn export_json(&self) -> serde_json::Value {
        let series_key = |name: &str, labels: &Labels| {
            if labels.is_empty() {
                name.to_string()
            } else {
                format!("{name}{}", labels.prometheus_str())
            }
        };

        let mut counters = serde_json::Map::new();
        for ((name, labels), v) in read(&self.counters).iter() {
            counters.insert(
                series_key(name, labels),
                serde_json::json!(v.load(Ordering::Relaxed)),
            );
        }
        let mut gauges = serde_json::Map::new();
        for ((name, labels), v) in read(&self.gauges).iter() {
            gauges.insert(
                series_key(name, labels),
                serde_json::json!(v.load(Ordering::Relaxed)),
            );
        }
        serde_json::json!({ "counters": counters, "gauges": gauges })
    }
}

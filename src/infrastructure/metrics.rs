use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Mutex;
use std::time::Instant;

const HISTOGRAM_SAMPLE_CAP: usize = 1000;

#[derive(Default)]
struct Histogram {
    samples: Vec<f64>,
    count: u64,
    sum: f64,
}

impl Histogram {
    fn record(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        if self.samples.len() >= HISTOGRAM_SAMPLE_CAP {
            self.samples.remove(0);
        }
        self.samples.push(value);
    }

    fn percentile(&self, p: f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    }
}

type LabelSet = BTreeMap<String, String>;

/// Prometheus-style counters/histograms/gauges with stable label ordering
/// on exposition. Labels are joined into a single string key internally;
/// the original label map is kept alongside for rendering.
pub struct Metrics {
    start: Instant,
    counters: Mutex<BTreeMap<String, (LabelSet, u64)>>,
    histograms: Mutex<BTreeMap<String, (LabelSet, Histogram)>>,
    gauges: Mutex<BTreeMap<String, (LabelSet, f64)>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            counters: Mutex::new(BTreeMap::new()),
            histograms: Mutex::new(BTreeMap::new()),
            gauges: Mutex::new(BTreeMap::new()),
        }
    }

    fn make_key(name: &str, labels: &[(&str, &str)]) -> String {
        let mut parts: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
        parts.sort();
        format!("{name}{{{}}}", parts.join(","))
    }

    pub fn incr_counter(&self, name: &str, labels: &[(&str, &str)], by: u64) {
        let key = Self::make_key(name, labels);
        let mut counters = self.counters.lock().unwrap();
        let entry = counters
            .entry(key)
            .or_insert_with(|| (labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(), 0));
        entry.1 += by;
    }

    pub fn observe_histogram(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = Self::make_key(name, labels);
        let mut histograms = self.histograms.lock().unwrap();
        let entry = histograms.entry(key).or_insert_with(|| {
            (
                labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
                Histogram::default(),
            )
        });
        entry.1.record(value);
    }

    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = Self::make_key(name, labels);
        let mut gauges = self.gauges.lock().unwrap();
        let entry = gauges
            .entry(key)
            .or_insert_with(|| (labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(), 0.0));
        entry.1 = value;
    }

    /// Record the outcome of one fetch attempt: duration histogram, error
    /// counter (if applicable), and new-item counter.
    pub fn record_fetch(
        &self,
        feed_id: i64,
        host: &str,
        status_code: u16,
        duration_ms: u64,
        items_new: u64,
        error_reason: Option<&str>,
    ) {
        let feed_id_str = feed_id.to_string();
        self.observe_histogram(
            "fetch_duration_seconds",
            &[
                ("feed_id", feed_id_str.as_str()),
                ("host", host),
                ("status", status_code.to_string().as_str()),
            ],
            duration_ms as f64 / 1000.0,
        );

        if let Some(reason) = error_reason {
            self.incr_counter("fetch_errors_total", &[("host", host), ("reason", reason)], 1);
        }

        if items_new > 0 {
            self.incr_counter("items_new_total", &[("feed_id", feed_id_str.as_str())], items_new);
        }
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Render all series as a Prometheus text-exposition page with stable
    /// (sorted) label ordering — `BTreeMap` iteration order suffices.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();

        let counters = self.counters.lock().unwrap();
        for (key, (_, value)) in counters.iter() {
            let _ = writeln!(out, "{key} {value}");
        }

        let histograms = self.histograms.lock().unwrap();
        for (key, (labels, histogram)) in histograms.iter() {
            let base = strip_braces(key);
            let label_str = render_labels(labels);
            let _ = writeln!(out, "{base}_count{{{label_str}}} {}", histogram.count);
            let _ = writeln!(out, "{base}_sum{{{label_str}}} {}", histogram.sum);
            let _ = writeln!(out, "{base}_p50{{{label_str}}} {}", histogram.percentile(0.50));
            let _ = writeln!(out, "{base}_p95{{{label_str}}} {}", histogram.percentile(0.95));
            let _ = writeln!(out, "{base}_p99{{{label_str}}} {}", histogram.percentile(0.99));
        }

        let gauges = self.gauges.lock().unwrap();
        for (key, (_, value)) in gauges.iter() {
            let _ = writeln!(out, "{key} {value}");
        }

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn strip_braces(key: &str) -> &str {
    key.split('{').next().unwrap_or(key)
}

fn render_labels(labels: &BTreeMap<String, String>) -> String {
    let mut parts: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
    parts.sort();
    parts.join(",")
}

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use osqmon_common::error::{OsqmonError, Result};

use crate::types::{CollectedMetric, MetricDescriptor, MetricSample, MetricType, MetricValue};

type LabelValues = Vec<String>;

trait RegisteredMetric: Send + Sync {
    fn descriptor(&self) -> MetricDescriptor;
    fn collect(&self) -> Vec<MetricSample>;
}

pub struct MetricsRegistry {
    metrics: RwLock<HashMap<String, Arc<dyn RegisteredMetric>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            metrics: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_counter(
        &self,
        name: &str,
        help: &str,
        variable_labels: &[&str],
    ) -> Result<Arc<CounterMetric>> {
        let metric = Arc::new(CounterMetric::new(name, help, variable_labels));
        self.register(metric.clone())?;
        Ok(metric)
    }

    pub fn register_gauge(
        &self,
        name: &str,
        help: &str,
        variable_labels: &[&str],
    ) -> Result<Arc<GaugeMetric>> {
        let metric = Arc::new(GaugeMetric::new(name, help, variable_labels));
        self.register(metric.clone())?;
        Ok(metric)
    }

    pub fn register_histogram(
        &self,
        name: &str,
        help: &str,
        variable_labels: &[&str],
        buckets: &[f64],
    ) -> Result<Arc<HistogramMetric>> {
        let metric = Arc::new(HistogramMetric::new(name, help, variable_labels, buckets));
        self.register(metric.clone())?;
        Ok(metric)
    }

    pub fn register_summary(
        &self,
        name: &str,
        help: &str,
        variable_labels: &[&str],
    ) -> Result<Arc<SummaryMetric>> {
        let metric = Arc::new(SummaryMetric::new(name, help, variable_labels));
        self.register(metric.clone())?;
        Ok(metric)
    }

    pub fn collect_all(&self) -> Vec<CollectedMetric> {
        let metrics = match self.metrics.read() {
            Ok(guard) => guard,
            Err(_) => return Vec::new(),
        };

        let mut collected = metrics
            .values()
            .map(|metric| CollectedMetric {
                descriptor: metric.descriptor(),
                samples: metric.collect(),
            })
            .collect::<Vec<_>>();

        collected.sort_by(|left, right| left.descriptor.name.cmp(&right.descriptor.name));
        collected
    }

    pub fn render_prometheus(&self) -> String {
        render_prometheus(&self.collect_all())
    }

    fn register<M: RegisteredMetric + 'static>(&self, metric: Arc<M>) -> Result<()> {
        let descriptor = metric.descriptor();
        let name = descriptor.name.clone();
        let mut metrics = self.metrics.write().map_err(|_| {
            OsqmonError::InternalError("failed to acquire metrics registry lock".to_string())
        })?;

        if metrics.contains_key(&name) {
            return Err(OsqmonError::InvalidArgument(format!(
                "metric already registered: {name}"
            )));
        }

        metrics.insert(name, metric);
        Ok(())
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CounterMetric {
    descriptor: MetricDescriptor,
    series: RwLock<HashMap<LabelValues, Arc<AtomicU64>>>,
}

impl CounterMetric {
    fn new(name: &str, help: &str, variable_labels: &[&str]) -> Self {
        Self {
            descriptor: descriptor(name, help, MetricType::Counter, variable_labels),
            series: RwLock::new(HashMap::new()),
        }
    }

    pub fn inc(&self, labels: &[&str], value: u64) {
        let series = get_or_create_series(&self.descriptor, &self.series, labels, || {
            AtomicU64::new(0)
        });
        series.fetch_add(value, Ordering::Relaxed);
    }

    pub fn inc_one(&self, labels: &[&str]) {
        self.inc(labels, 1);
    }

    pub fn get(&self, labels: &[&str]) -> Option<u64> {
        let label_values = normalize_labels(&self.descriptor, labels);
        let guard = self.series.read().ok()?;
        guard
            .get(&label_values)
            .map(|value| value.load(Ordering::Relaxed))
    }
}

impl RegisteredMetric for CounterMetric {
    fn descriptor(&self) -> MetricDescriptor {
        self.descriptor.clone()
    }

    fn collect(&self) -> Vec<MetricSample> {
        let series = match self.series.read() {
            Ok(guard) => guard,
            Err(_) => return Vec::new(),
        };

        series
            .iter()
            .map(|(label_values, value)| MetricSample {
                labels: materialize_labels(&self.descriptor, label_values),
                value: MetricValue::Counter(value.load(Ordering::Relaxed) as f64),
            })
            .collect()
    }
}

// Gauge values are stored as f64 bit patterns.
pub struct GaugeMetric {
    descriptor: MetricDescriptor,
    series: RwLock<HashMap<LabelValues, Arc<AtomicU64>>>,
}

impl GaugeMetric {
    fn new(name: &str, help: &str, variable_labels: &[&str]) -> Self {
        Self {
            descriptor: descriptor(name, help, MetricType::Gauge, variable_labels),
            series: RwLock::new(HashMap::new()),
        }
    }

    pub fn set(&self, labels: &[&str], value: f64) {
        let series = get_or_create_series(&self.descriptor, &self.series, labels, || {
            AtomicU64::new(0.0_f64.to_bits())
        });
        series.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self, labels: &[&str]) -> Option<f64> {
        let label_values = normalize_labels(&self.descriptor, labels);
        let guard = self.series.read().ok()?;
        guard
            .get(&label_values)
            .map(|value| f64::from_bits(value.load(Ordering::Relaxed)))
    }
}

impl RegisteredMetric for GaugeMetric {
    fn descriptor(&self) -> MetricDescriptor {
        self.descriptor.clone()
    }

    fn collect(&self) -> Vec<MetricSample> {
        let series = match self.series.read() {
            Ok(guard) => guard,
            Err(_) => return Vec::new(),
        };

        series
            .iter()
            .map(|(label_values, value)| MetricSample {
                labels: materialize_labels(&self.descriptor, label_values),
                value: MetricValue::Gauge(f64::from_bits(value.load(Ordering::Relaxed))),
            })
            .collect()
    }
}

pub struct HistogramMetric {
    descriptor: MetricDescriptor,
    buckets: Vec<f64>,
    series: RwLock<HashMap<LabelValues, Arc<HistogramSeries>>>,
}

struct HistogramSeries {
    bucket_counts: Vec<AtomicU64>,
    count: AtomicU64,
    sum: Mutex<f64>,
}

impl HistogramSeries {
    fn new(bucket_len: usize) -> Self {
        Self {
            bucket_counts: (0..bucket_len + 1).map(|_| AtomicU64::new(0)).collect(),
            count: AtomicU64::new(0),
            sum: Mutex::new(0.0),
        }
    }
}

impl HistogramMetric {
    fn new(name: &str, help: &str, variable_labels: &[&str], buckets: &[f64]) -> Self {
        let mut sorted_buckets = buckets.to_vec();
        sorted_buckets.sort_by(|left, right| left.total_cmp(right));

        Self {
            descriptor: descriptor(name, help, MetricType::Histogram, variable_labels),
            buckets: sorted_buckets,
            series: RwLock::new(HashMap::new()),
        }
    }

    pub fn observe(&self, labels: &[&str], value: f64) {
        let bucket_len = self.buckets.len();
        let series = get_or_create_series(&self.descriptor, &self.series, labels, || {
            HistogramSeries::new(bucket_len)
        });

        let bucket_index = self
            .buckets
            .iter()
            .position(|bucket| value <= *bucket)
            .unwrap_or(self.buckets.len());

        if let Some(bucket) = series.bucket_counts.get(bucket_index) {
            bucket.fetch_add(1, Ordering::Relaxed);
        }

        series.count.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut sum) = series.sum.lock() {
            *sum += value;
        }
    }
}

impl RegisteredMetric for HistogramMetric {
    fn descriptor(&self) -> MetricDescriptor {
        self.descriptor.clone()
    }

    fn collect(&self) -> Vec<MetricSample> {
        let series = match self.series.read() {
            Ok(guard) => guard,
            Err(_) => return Vec::new(),
        };

        series
            .iter()
            .map(|(label_values, entry)| {
                let mut buckets = self
                    .buckets
                    .iter()
                    .enumerate()
                    .map(|(index, bound)| {
                        (*bound, entry.bucket_counts[index].load(Ordering::Relaxed))
                    })
                    .collect::<Vec<_>>();

                let inf_count = entry.bucket_counts[self.buckets.len()].load(Ordering::Relaxed);
                buckets.push((f64::INFINITY, inf_count));

                let sum = match entry.sum.lock() {
                    Ok(value) => *value,
                    Err(_) => 0.0,
                };

                MetricSample {
                    labels: materialize_labels(&self.descriptor, label_values),
                    value: MetricValue::Histogram {
                        buckets,
                        count: entry.count.load(Ordering::Relaxed),
                        sum,
                    },
                }
            })
            .collect()
    }
}

const SUMMARY_OBJECTIVES: [f64; 3] = [0.5, 0.9, 0.99];
const SUMMARY_MAX_AGE: Duration = Duration::from_secs(10 * 60);
const SUMMARY_WINDOW_CAPACITY: usize = 1024;

// Quantiles are computed over the observations of the last SUMMARY_MAX_AGE,
// capped at SUMMARY_WINDOW_CAPACITY per series. `_sum` and `_count` cover the
// whole lifetime.
pub struct SummaryMetric {
    descriptor: MetricDescriptor,
    series: RwLock<HashMap<LabelValues, Arc<SummarySeries>>>,
}

#[derive(Default)]
struct SummarySeries {
    count: AtomicU64,
    sum: Mutex<f64>,
    window: Mutex<VecDeque<(Instant, f64)>>,
}

impl SummarySeries {
    fn quantiles(&self, now: Instant) -> Vec<(f64, f64)> {
        let mut values = match self.window.lock() {
            Ok(mut window) => {
                expire_observations(&mut window, now);
                window.iter().map(|(_, value)| *value).collect::<Vec<_>>()
            }
            Err(_) => Vec::new(),
        };
        values.sort_by(|left, right| left.total_cmp(right));

        SUMMARY_OBJECTIVES
            .iter()
            .map(|objective| (*objective, nearest_rank(&values, *objective)))
            .collect()
    }
}

impl SummaryMetric {
    fn new(name: &str, help: &str, variable_labels: &[&str]) -> Self {
        Self {
            descriptor: descriptor(name, help, MetricType::Summary, variable_labels),
            series: RwLock::new(HashMap::new()),
        }
    }

    pub fn observe(&self, labels: &[&str], value: f64) {
        let series =
            get_or_create_series(&self.descriptor, &self.series, labels, SummarySeries::default);
        series.count.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut sum) = series.sum.lock() {
            *sum += value;
        }
        if let Ok(mut window) = series.window.lock() {
            let now = Instant::now();
            expire_observations(&mut window, now);
            if window.len() == SUMMARY_WINDOW_CAPACITY {
                window.pop_front();
            }
            window.push_back((now, value));
        }
    }
}

impl RegisteredMetric for SummaryMetric {
    fn descriptor(&self) -> MetricDescriptor {
        self.descriptor.clone()
    }

    fn collect(&self) -> Vec<MetricSample> {
        let series = match self.series.read() {
            Ok(guard) => guard,
            Err(_) => return Vec::new(),
        };

        let now = Instant::now();
        series
            .iter()
            .map(|(label_values, entry)| MetricSample {
                labels: materialize_labels(&self.descriptor, label_values),
                value: MetricValue::Summary {
                    quantiles: entry.quantiles(now),
                    count: entry.count.load(Ordering::Relaxed),
                    sum: entry.sum.lock().map(|value| *value).unwrap_or(0.0),
                },
            })
            .collect()
    }
}

fn expire_observations(window: &mut VecDeque<(Instant, f64)>, now: Instant) {
    while let Some((observed_at, _)) = window.front() {
        if now.saturating_duration_since(*observed_at) <= SUMMARY_MAX_AGE {
            break;
        }
        window.pop_front();
    }
}

// Empty windows report NaN, as Prometheus client libraries do.
fn nearest_rank(sorted: &[f64], objective: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let rank = (objective * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn descriptor(
    name: &str,
    help: &str,
    metric_type: MetricType,
    variable_labels: &[&str],
) -> MetricDescriptor {
    MetricDescriptor {
        name: name.to_string(),
        help: help.to_string(),
        metric_type,
        variable_labels: variable_labels.iter().map(|label| (*label).to_string()).collect(),
    }
}

fn get_or_create_series<T>(
    descriptor: &MetricDescriptor,
    series: &RwLock<HashMap<LabelValues, Arc<T>>>,
    labels: &[&str],
    init: impl FnOnce() -> T,
) -> Arc<T> {
    let label_values = normalize_labels(descriptor, labels);
    if let Ok(guard) = series.read()
        && let Some(existing) = guard.get(&label_values)
    {
        return existing.clone();
    }

    match series.write() {
        Ok(mut guard) => guard
            .entry(label_values)
            .or_insert_with(|| Arc::new(init()))
            .clone(),
        Err(_) => Arc::new(init()),
    }
}

fn normalize_labels(descriptor: &MetricDescriptor, labels: &[&str]) -> LabelValues {
    let expected = descriptor.variable_labels.len();
    (0..expected)
        .map(|index| labels.get(index).copied().unwrap_or_default().to_string())
        .collect()
}

fn materialize_labels(descriptor: &MetricDescriptor, values: &[String]) -> Vec<(String, String)> {
    descriptor
        .variable_labels
        .iter()
        .zip(values.iter())
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

pub fn render_prometheus(metrics: &[CollectedMetric]) -> String {
    let mut output = String::new();

    for metric in metrics {
        output.push_str("# HELP ");
        output.push_str(&metric.descriptor.name);
        output.push(' ');
        output.push_str(&escape_help(&metric.descriptor.help));
        output.push('\n');

        output.push_str("# TYPE ");
        output.push_str(&metric.descriptor.name);
        output.push(' ');
        output.push_str(metric.descriptor.metric_type.as_prometheus_type());
        output.push('\n');

        let mut samples = metric.samples.iter().collect::<Vec<_>>();
        samples.sort_by(|left, right| left.labels.cmp(&right.labels));

        for sample in samples {
            match &sample.value {
                MetricValue::Counter(value) | MetricValue::Gauge(value) => {
                    output.push_str(&render_sample_line(
                        &metric.descriptor.name,
                        &sample.labels,
                        *value,
                    ));
                }
                MetricValue::Histogram {
                    buckets,
                    count,
                    sum,
                } => {
                    let mut cumulative = 0_u64;
                    for (bound, bucket_count) in buckets {
                        cumulative = cumulative.saturating_add(*bucket_count);
                        let mut labels = sample.labels.clone();
                        labels.push(("le".to_string(), format_bucket_bound(*bound)));
                        output.push_str(&render_sample_line(
                            &format!("{}_bucket", metric.descriptor.name),
                            &labels,
                            cumulative as f64,
                        ));
                    }

                    output.push_str(&render_sample_line(
                        &format!("{}_sum", metric.descriptor.name),
                        &sample.labels,
                        *sum,
                    ));
                    output.push_str(&render_sample_line(
                        &format!("{}_count", metric.descriptor.name),
                        &sample.labels,
                        *count as f64,
                    ));
                }
                MetricValue::Summary {
                    quantiles,
                    count,
                    sum,
                } => {
                    for (objective, value) in quantiles {
                        let mut labels = sample.labels.clone();
                        labels.push(("quantile".to_string(), objective.to_string()));
                        output.push_str(&render_sample_line(
                            &metric.descriptor.name,
                            &labels,
                            *value,
                        ));
                    }
                    output.push_str(&render_sample_line(
                        &format!("{}_sum", metric.descriptor.name),
                        &sample.labels,
                        *sum,
                    ));
                    output.push_str(&render_sample_line(
                        &format!("{}_count", metric.descriptor.name),
                        &sample.labels,
                        *count as f64,
                    ));
                }
            }
        }
    }

    output
}

fn render_sample_line(name: &str, labels: &[(String, String)], value: f64) -> String {
    let mut rendered = String::new();
    rendered.push_str(name);

    if !labels.is_empty() {
        rendered.push('{');
        for (index, (key, value)) in labels.iter().enumerate() {
            if index > 0 {
                rendered.push(',');
            }
            rendered.push_str(key);
            rendered.push_str("=\"");
            rendered.push_str(&escape_label_value(value));
            rendered.push('"');
        }
        rendered.push('}');
    }

    rendered.push(' ');
    rendered.push_str(&format_metric_value(value));
    rendered.push('\n');
    rendered
}

fn format_metric_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "+Inf" } else { "-Inf" }.to_string()
    } else if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.0}")
    } else {
        value.to_string()
    }
}

fn format_bucket_bound(value: f64) -> String {
    if value.is_infinite() {
        "+Inf".to_string()
    } else {
        value.to_string()
    }
}

fn escape_help(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n")
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use crate::types::MetricValue;

    use super::{MetricsRegistry, SUMMARY_WINDOW_CAPACITY, nearest_rank};

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = MetricsRegistry::new();
        registry.register_gauge("up", "Up", &[]).unwrap();
        assert!(registry.register_counter("up", "Up again", &[]).is_err());
    }

    #[test]
    fn gauge_keeps_last_set_value_per_label_set() {
        let registry = MetricsRegistry::new();
        let gauge = registry
            .register_gauge("query_success", "Query execution status", &["name"])
            .unwrap();

        gauge.set(&["uptime"], 1.0);
        gauge.set(&["uptime"], 0.0);
        gauge.set(&["processes"], 1.0);

        assert_eq!(gauge.get(&["uptime"]), Some(0.0));
        assert_eq!(gauge.get(&["processes"]), Some(1.0));
        assert_eq!(gauge.get(&["missing"]), None);
    }

    #[test]
    fn renders_summary_and_gauge_families() {
        let registry = MetricsRegistry::new();
        let summary = registry
            .register_summary("query_duration", "Query duration", &["name"])
            .unwrap();
        let gauge = registry
            .register_gauge("resultsets", "Number of query result sets", &["name"])
            .unwrap();

        summary.observe(&["uptime"], 0.25);
        summary.observe(&["uptime"], 0.5);
        gauge.set(&["uptime"], 3.0);

        let rendered = registry.render_prometheus();
        assert!(rendered.contains("# TYPE query_duration summary\n"));
        assert!(rendered.contains("query_duration{name=\"uptime\",quantile=\"0.5\"} 0.25\n"));
        assert!(rendered.contains("query_duration{name=\"uptime\",quantile=\"0.99\"} 0.5\n"));
        assert!(rendered.contains("query_duration_sum{name=\"uptime\"} 0.75\n"));
        assert!(rendered.contains("query_duration_count{name=\"uptime\"} 2\n"));
        assert!(rendered.contains("# TYPE resultsets gauge\n"));
        assert!(rendered.contains("resultsets{name=\"uptime\"} 3\n"));
    }

    #[test]
    fn summary_quantiles_follow_observations() {
        let registry = MetricsRegistry::new();
        let summary = registry
            .register_summary("query_duration", "Query duration", &[])
            .unwrap();

        let empty = registry.collect_all();
        assert!(empty[0].samples.is_empty());

        for value in 1..=100 {
            summary.observe(&[], f64::from(value));
        }

        let collected = registry.collect_all();
        match &collected[0].samples[0].value {
            MetricValue::Summary {
                quantiles,
                count,
                sum,
            } => {
                assert_eq!(quantiles, &vec![(0.5, 50.0), (0.9, 90.0), (0.99, 99.0)]);
                assert_eq!(*count, 100);
                assert_eq!(*sum, 5050.0);
            }
            other => panic!("unexpected value: {other:?}"),
        }
    }

    #[test]
    fn summary_window_is_bounded() {
        let registry = MetricsRegistry::new();
        let summary = registry
            .register_summary("query_duration", "Query duration", &[])
            .unwrap();

        for _ in 0..SUMMARY_WINDOW_CAPACITY {
            summary.observe(&[], 100.0);
        }
        for _ in 0..SUMMARY_WINDOW_CAPACITY {
            summary.observe(&[], 1.0);
        }

        let collected = registry.collect_all();
        match &collected[0].samples[0].value {
            MetricValue::Summary {
                quantiles, count, ..
            } => {
                assert!(quantiles.iter().all(|(_, value)| *value == 1.0));
                assert_eq!(*count, 2 * SUMMARY_WINDOW_CAPACITY as u64);
            }
            other => panic!("unexpected value: {other:?}"),
        }
    }

    #[test]
    fn nearest_rank_handles_small_windows() {
        assert!(nearest_rank(&[], 0.5).is_nan());
        assert_eq!(nearest_rank(&[3.0], 0.99), 3.0);
        assert_eq!(nearest_rank(&[1.0, 2.0], 0.5), 1.0);
        assert_eq!(nearest_rank(&[1.0, 2.0], 0.9), 2.0);
    }

    #[test]
    fn renders_cumulative_histogram_buckets() {
        let registry = MetricsRegistry::new();
        let histogram = registry
            .register_histogram("scrape_seconds", "Scrape duration", &[], &[0.1, 1.0])
            .unwrap();

        histogram.observe(&[], 0.05);
        histogram.observe(&[], 0.5);
        histogram.observe(&[], 5.0);

        let rendered = registry.render_prometheus();
        assert!(rendered.contains("scrape_seconds_bucket{le=\"0.1\"} 1\n"));
        assert!(rendered.contains("scrape_seconds_bucket{le=\"1\"} 2\n"));
        assert!(rendered.contains("scrape_seconds_bucket{le=\"+Inf\"} 3\n"));
        assert!(rendered.contains("scrape_seconds_count 3\n"));
    }

    #[test]
    fn escapes_label_values() {
        let registry = MetricsRegistry::new();
        let gauge = registry.register_gauge("info", "Info", &["path"]).unwrap();
        gauge.set(&["C:\\\"x\"\n"], 1.0);

        let rendered = registry.render_prometheus();
        assert!(rendered.contains("info{path=\"C:\\\\\\\"x\\\"\\n\"} 1\n"));
    }
}

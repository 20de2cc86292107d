pub mod collectors;
pub mod registry;
pub mod types;

pub use collectors::{
    process::ProcessMetrics,
    scrape::{ScrapeMetrics, ScrapeOutcome},
};
pub use registry::{
    CounterMetric, GaugeMetric, HistogramMetric, MetricsRegistry, SummaryMetric, render_prometheus,
};
pub use types::{CollectedMetric, MetricDescriptor, MetricSample, MetricType, MetricValue};

pub const NAMESPACE: &str = "osquery_exporter";

pub fn fq_name(name: &str) -> String {
    format!("{NAMESPACE}_{name}")
}

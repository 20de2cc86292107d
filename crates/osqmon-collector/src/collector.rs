use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use osqmon_common::error::Result;
use osqmon_metrics::{
    CollectedMetric, GaugeMetric, MetricsRegistry, ScrapeOutcome, SummaryMetric, fq_name,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    definition::MetricDefinition,
    error::CollectError,
    mapping::{Sample, map_rows, to_collected},
    runner::Runner,
};

#[derive(Debug)]
pub struct ThrottleState {
    last_run: Option<Instant>,
    interval: Duration,
}

impl ThrottleState {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_run: None,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_run {
            Some(last_run) => now.saturating_duration_since(last_run) >= self.interval,
            None => true,
        }
    }

    fn mark_run(&mut self, at: Instant) {
        self.last_run = Some(at);
    }
}

#[derive(Debug)]
pub enum CollectionOutcome {
    Success { samples: usize, duration: Duration },
    Failed(CollectError),
}

impl CollectionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

#[derive(Debug)]
pub struct Scrape {
    pub outcome: ScrapeOutcome,
    pub metrics: Vec<CollectedMetric>,
    // Empty for throttled scrapes.
    pub results: Vec<(String, CollectionOutcome)>,
}

impl Scrape {
    pub fn metric(&self, name: &str) -> Option<&CollectedMetric> {
        self.metrics
            .iter()
            .find(|metric| metric.descriptor.name == name)
    }

    pub fn result(&self, definition: &str) -> Option<&CollectionOutcome> {
        self.results
            .iter()
            .find(|(name, _)| name == definition)
            .map(|(_, outcome)| outcome)
    }
}

struct QueryMetrics {
    registry: MetricsRegistry,
    query_duration: Arc<SummaryMetric>,
    query_success: Arc<GaugeMetric>,
    resultsets: Arc<GaugeMetric>,
}

impl QueryMetrics {
    fn new() -> Result<Self> {
        let registry = MetricsRegistry::new();
        let query_duration =
            registry.register_summary(&fq_name("query_duration"), "Query duration", &["name"])?;
        let query_success = registry.register_gauge(
            &fq_name("query_success"),
            "Query execution status",
            &["name"],
        )?;
        let resultsets = registry.register_gauge(
            &fq_name("resultsets"),
            "Number of query result sets",
            &["name"],
        )?;

        Ok(Self {
            registry,
            query_duration,
            query_success,
            resultsets,
        })
    }

    fn record_success(&self, name: &str, rows: usize, duration: Duration) {
        self.query_success.set(&[name], 1.0);
        self.resultsets.set(&[name], rows as f64);
        self.query_duration.observe(&[name], duration.as_secs_f64());
    }

    fn record_failure(&self, name: &str) {
        self.query_success.set(&[name], 0.0);
    }
}

struct QueryReport {
    samples: Vec<Sample>,
    rows: usize,
    duration: Duration,
}

pub struct QueryCollector {
    inner: Arc<CollectorInner>,
}

struct CollectorInner {
    runner: Arc<Runner>,
    definitions: Vec<Arc<MetricDefinition>>,
    throttle: Mutex<ThrottleState>,
    metrics: QueryMetrics,
}

impl QueryCollector {
    pub fn new(
        runner: Runner,
        definitions: Vec<MetricDefinition>,
        throttle_interval: Duration,
    ) -> Result<Self> {
        let mut by_id: HashMap<String, usize> = HashMap::new();
        let mut unique: Vec<Arc<MetricDefinition>> = Vec::with_capacity(definitions.len());
        for definition in definitions {
            if let Some(&index) = by_id.get(definition.id()) {
                warn!(
                    metric = %definition.name(),
                    replaced = %unique[index].name(),
                    query = %definition.query(),
                    "duplicate query definition replaces an earlier one"
                );
                unique[index] = Arc::new(definition);
                continue;
            }
            info!(
                metric = %definition.name(),
                kind = definition.kind().as_str(),
                "adding metric definition"
            );
            by_id.insert(definition.id().to_string(), unique.len());
            unique.push(Arc::new(definition));
        }

        info!(
            runner = %runner.describe(),
            definitions = unique.len(),
            throttle_interval = ?throttle_interval,
            "created query collector"
        );
        Ok(Self {
            inner: Arc::new(CollectorInner {
                runner: Arc::new(runner),
                definitions: unique,
                throttle: Mutex::new(ThrottleState::new(throttle_interval)),
                metrics: QueryMetrics::new()?,
            }),
        })
    }

    pub fn definitions(&self) -> &[Arc<MetricDefinition>] {
        &self.inner.definitions
    }

    // The round runs on its own task: a caller that gives up waiting does not
    // abandon it, and the throttle lock stays held until the round is recorded.
    pub async fn scrape(&self) -> Scrape {
        let inner = Arc::clone(&self.inner);
        match tokio::spawn(async move { inner.scrape().await }).await {
            Ok(scrape) => scrape,
            Err(err) => {
                error!(error = %err, "collection round aborted");
                Scrape {
                    outcome: ScrapeOutcome::Collected,
                    metrics: self.inner.metrics.registry.collect_all(),
                    results: Vec::new(),
                }
            }
        }
    }
}

impl CollectorInner {
    // The throttle lock is held for the whole decision and collection round, so
    // concurrent scrapes queue behind an in-flight round and then re-check the window.
    async fn scrape(&self) -> Scrape {
        let mut throttle = self.throttle.lock().await;

        if !throttle.is_due(Instant::now()) {
            debug!(
                interval = ?throttle.interval(),
                "throttle window not elapsed, skipping queries"
            );
            return Scrape {
                outcome: ScrapeOutcome::Throttled,
                metrics: self.metrics.registry.collect_all(),
                results: Vec::new(),
            };
        }

        let (mut metrics, results) = self.collect_round().await;
        metrics.extend(self.metrics.registry.collect_all());
        throttle.mark_run(Instant::now());

        Scrape {
            outcome: ScrapeOutcome::Collected,
            metrics,
            results,
        }
    }

    async fn collect_round(&self) -> (Vec<CollectedMetric>, Vec<(String, CollectionOutcome)>) {
        let tasks = self
            .definitions
            .iter()
            .map(|definition| {
                let runner = Arc::clone(&self.runner);
                let task_definition = Arc::clone(definition);
                let handle =
                    tokio::spawn(async move { run_definition(&runner, &task_definition).await });
                (Arc::clone(definition), handle)
            })
            .collect::<Vec<_>>();

        let mut families = Vec::new();
        let mut results = Vec::with_capacity(tasks.len());
        for (definition, handle) in tasks {
            let report = match handle.await {
                Ok(report) => report,
                Err(err) => Err(CollectError::Aborted(err.to_string())),
            };

            let outcome = match report {
                Ok(report) => {
                    debug!(
                        metric = %definition.name(),
                        duration = ?report.duration,
                        rows = report.rows,
                        "query finished"
                    );
                    self.metrics
                        .record_success(definition.name(), report.rows, report.duration);
                    let samples = report.samples.len();
                    if samples > 0 {
                        families.push(to_collected(&definition, report.samples));
                    }
                    CollectionOutcome::Success {
                        samples,
                        duration: report.duration,
                    }
                }
                Err(err) => {
                    match &err {
                        CollectError::Map(_) => warn!(
                            metric = %definition.name(),
                            query = %definition.query(),
                            error = %err,
                            "failed to map query result"
                        ),
                        CollectError::Run(_) | CollectError::Aborted(_) => error!(
                            metric = %definition.name(),
                            query = %definition.query(),
                            error = %err,
                            "failed to run query"
                        ),
                    }
                    self.metrics.record_failure(definition.name());
                    CollectionOutcome::Failed(err)
                }
            };
            results.push((definition.name().to_string(), outcome));
        }

        (families, results)
    }
}

async fn run_definition(
    runner: &Runner,
    definition: &MetricDefinition,
) -> std::result::Result<QueryReport, CollectError> {
    let result = runner.run(definition.query()).await?;
    let samples = map_rows(definition, &result)?;
    Ok(QueryReport {
        samples,
        rows: result.len(),
        duration: result.runtime(),
    })
}

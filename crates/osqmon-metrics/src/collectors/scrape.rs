use std::{sync::Arc, time::Duration};

use osqmon_common::error::Result;

use crate::{
    fq_name,
    registry::{CounterMetric, HistogramMetric, MetricsRegistry},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapeOutcome {
    Collected,
    Throttled,
}

impl ScrapeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Collected => "collected",
            Self::Throttled => "throttled",
        }
    }
}

pub struct ScrapeMetrics {
    scrapes_total: Arc<CounterMetric>,
    scrape_duration_seconds: Arc<HistogramMetric>,
}

impl ScrapeMetrics {
    pub fn register(registry: &MetricsRegistry) -> Result<Self> {
        let scrapes_total = registry.register_counter(
            &fq_name("scrapes_total"),
            "Total number of metric scrapes by outcome",
            &["outcome"],
        )?;

        let scrape_duration_seconds = registry.register_histogram(
            &fq_name("scrape_duration_seconds"),
            "Duration of metric scrapes in seconds",
            &[],
            &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0],
        )?;

        Ok(Self {
            scrapes_total,
            scrape_duration_seconds,
        })
    }

    pub fn record_scrape(&self, outcome: ScrapeOutcome, duration: Duration) {
        self.scrapes_total.inc_one(&[outcome.as_str()]);
        self.scrape_duration_seconds
            .observe(&[], duration.as_secs_f64());
    }

    pub fn scrapes(&self, outcome: ScrapeOutcome) -> u64 {
        self.scrapes_total.get(&[outcome.as_str()]).unwrap_or(0)
    }
}

use std::sync::Arc;

use axum::{Router, routing::get};
use osqmon_collector::QueryCollector;
use osqmon_common::error::Result;
use osqmon_metrics::{MetricsRegistry, ProcessMetrics, ScrapeMetrics};
use tower_http::trace::TraceLayer;

use crate::handlers;

pub struct AppState {
    pub collector: Arc<QueryCollector>,
    pub registry: Arc<MetricsRegistry>,
    pub scrape_metrics: Arc<ScrapeMetrics>,
    pub process_metrics: Arc<ProcessMetrics>,
    pub telemetry_path: String,
}

impl AppState {
    pub fn new(collector: Arc<QueryCollector>, telemetry_path: impl Into<String>) -> Result<Self> {
        let registry = Arc::new(MetricsRegistry::new());
        let scrape_metrics = Arc::new(ScrapeMetrics::register(registry.as_ref())?);
        let process_metrics = Arc::new(ProcessMetrics::register(registry.as_ref())?);

        Ok(Self {
            collector,
            registry,
            scrape_metrics,
            process_metrics,
            telemetry_path: telemetry_path.into(),
        })
    }
}

pub fn app_router(state: Arc<AppState>) -> Router {
    let telemetry_path = state.telemetry_path.clone();
    Router::new()
        .route("/", get(handlers::health::landing_page))
        .route("/-/healthy", get(handlers::health::healthy))
        .route(&telemetry_path, get(handlers::metrics::prometheus_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

use std::{sync::Arc, time::Instant};

use axum::{
    body::Body,
    extract::State,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use osqmon_metrics::render_prometheus;
use tracing::debug;

use crate::router::AppState;

pub async fn prometheus_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let started_at = Instant::now();
    let scrape = state.collector.scrape().await;
    let failed = scrape
        .results
        .iter()
        .filter(|(_, outcome)| !outcome.is_success())
        .count();
    debug!(
        outcome = scrape.outcome.as_str(),
        queries = scrape.results.len(),
        failed,
        "scrape finished"
    );

    state.process_metrics.refresh();
    state
        .scrape_metrics
        .record_scrape(scrape.outcome, started_at.elapsed());

    let mut families = scrape.metrics;
    families.extend(state.registry.collect_all());
    families.sort_by(|left, right| left.descriptor.name.cmp(&right.descriptor.name));
    let payload = render_prometheus(&families);

    let mut response = Response::new(Body::from(payload));
    *response.status_mut() = StatusCode::OK;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
    );

    response
}

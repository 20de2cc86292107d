use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::{Html, IntoResponse}};

use crate::router::AppState;

pub async fn healthy() -> impl IntoResponse {
    (StatusCode::OK, "Healthy")
}

pub async fn landing_page(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Html(format!(
        "<html>\n<head><title>osquery exporter</title></head>\n<body>\n\
         <h1>osquery exporter</h1>\n\
         <p><a href=\"{path}\">Metrics</a></p>\n\
         </body>\n</html>\n",
        path = state.telemetry_path
    ))
}

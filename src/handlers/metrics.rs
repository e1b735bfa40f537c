//! Metrics endpoint handler for Prometheus scraping.
//!
//! Every request runs one collection cycle. Collector and service query
//! failures are logged and leave their samples out; the response is still
//! 200 with whatever succeeded.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};
use std::time::Instant;
use tracing::{debug, error, info, instrument};

use crate::error::ScrapeError;
use crate::state::SharedState;

/// Error type for metrics endpoint failures.
#[derive(Debug)]
pub enum MetricsError {
    EncodingFailed,
}

impl IntoResponse for MetricsError {
    fn into_response(self) -> axum::response::Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        )
            .into_response()
    }
}

/// Handler for the telemetry endpoint.
#[instrument(skip(state))]
pub async fn metrics_handler(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, MetricsError> {
    let start = Instant::now();
    debug!("Processing metrics request");

    let scrape = state.exporter.collect_all().await;
    for err in &scrape.errors {
        match err {
            ScrapeError::Gate(e) => error!("Retrieving systemd services: {}", e),
            ScrapeError::Collector(e) => error!("Collector failed: {}", e),
        }
    }

    let body = state.exporter.render(&scrape).map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        MetricsError::EncodingFailed
    })?;

    info!(
        "collect duration total: {:?} (ran: {}, skipped: {}, errors: {})",
        start.elapsed(),
        scrape.ran.len(),
        scrape.skipped.len(),
        scrape.errors.len()
    );

    Ok(([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body))
}

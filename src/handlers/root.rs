//! Root endpoint handler for the landing page.

use axum::{
    extract::State,
    response::{Html, IntoResponse},
};
use tracing::{debug, instrument};

use crate::state::SharedState;

/// Handler for the root `/` endpoint.
#[instrument(skip(state))]
pub async fn root_handler(State(state): State<SharedState>) -> impl IntoResponse {
    debug!("Processing / request");

    let version = env!("CARGO_PKG_VERSION");
    let uptime_secs = state.start_time.elapsed().as_secs();
    let uptime_str = format!(
        "{}h {}m {}s",
        uptime_secs / 3600,
        (uptime_secs % 3600) / 60,
        uptime_secs % 60
    );
    let path = state.config.telemetry_path();
    let collectors = state
        .exporter
        .collectors()
        .iter()
        .map(|name| format!("<li>{}</li>", name))
        .collect::<String>();

    Html(format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>svcgate-exporter</title>
</head>
<body>
    <h1>svcgate-exporter</h1>
    <p>Version {version}, up {uptime_str}</p>
    <p><a href="{path}">Metrics</a></p>
    <h2>Collectors</h2>
    <ul>{collectors}</ul>
</body>
</html>
"#
    ))
}

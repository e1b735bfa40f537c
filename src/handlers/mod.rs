//! HTTP endpoint handlers for the exporter.
//!
//! - `/`: landing page
//! - telemetry path (default `/metrics`): Prometheus metrics, behind basic
//!   auth when users are configured

pub mod auth;
pub mod metrics;
pub mod root;

use axum::{middleware, routing::get, Router};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::state::SharedState;

pub use auth::{require_basic_auth, BasicAuth};
pub use metrics::metrics_handler;
pub use root::root_handler;

/// Builds the HTTP router.
pub fn router(state: SharedState, users: &BTreeMap<String, String>) -> Router {
    let telemetry_path = state.config.telemetry_path().to_string();

    let mut metrics = Router::new().route(&telemetry_path, get(metrics_handler));
    if !users.is_empty() {
        let auth = Arc::new(BasicAuth::new(users));
        metrics = metrics.route_layer(middleware::from_fn_with_state(auth, require_basic_auth));
    }

    let mut app = metrics;
    if telemetry_path != "/" {
        app = app.route("/", get(root_handler));
    }
    app.with_state(state)
}

//! Router tests driven through `tower::ServiceExt::oneshot`.

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use base64::{engine::general_purpose::STANDARD, Engine};
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::IntGauge;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tower::ServiceExt;

use svcgate_exporter::collectors::SourceCollector;
use svcgate_exporter::config::Config;
use svcgate_exporter::handlers::router;
use svcgate_exporter::state::AppState;
use svcgate_exporter::{CollectorError, Exporter, GateError, ServiceStatus};

struct NoServices;

#[async_trait]
impl ServiceStatus for NoServices {
    async fn get_states(&self, _names: &[String]) -> Result<HashMap<String, String>, GateError> {
        Ok(HashMap::new())
    }
}

struct Up {
    gauge: IntGauge,
    fail: bool,
}

#[async_trait]
impl SourceCollector for Up {
    fn name(&self) -> &str {
        if self.fail {
            "broken"
        } else {
            "up"
        }
    }

    fn describe(&self) -> Vec<&Desc> {
        self.gauge.desc()
    }

    async fn collect(&self) -> Result<Vec<MetricFamily>, CollectorError> {
        if self.fail {
            return Err(CollectorError::fetch("broken", "connection refused"));
        }
        self.gauge.set(1);
        Ok(self.gauge.collect())
    }

    fn required_services(&self) -> &[String] {
        &[]
    }
}

fn app(users: &BTreeMap<String, String>) -> axum::Router {
    let mut exporter = Exporter::new(Arc::new(NoServices)).unwrap();
    exporter
        .register(Arc::new(Up {
            gauge: IntGauge::new("test_up", "Always one.").unwrap(),
            fail: false,
        }))
        .unwrap();
    exporter
        .register(Arc::new(Up {
            gauge: IntGauge::new("broken_up", "Never collected.").unwrap(),
            fail: true,
        }))
        .unwrap();

    let state = Arc::new(AppState {
        exporter: Arc::new(exporter),
        config: Arc::new(Config::default()),
        start_time: Instant::now(),
    });
    router(state, users)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_metrics_served_despite_collector_error() {
    let response = app(&BTreeMap::new()).oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        prometheus::TEXT_FORMAT
    );

    let body = body_text(response).await;
    assert!(body.contains("test_up 1"), "{}", body);
    assert!(!body.contains("broken_up"));
}

#[tokio::test]
async fn test_landing_page_lists_collectors() {
    let response = app(&BTreeMap::new()).oneshot(get("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_text(response).await;
    assert!(body.contains("href=\"/metrics\""));
    assert!(body.contains("<li>up</li>"));
    assert!(body.contains("<li>broken</li>"));
}

#[tokio::test]
async fn test_basic_auth_protects_metrics() {
    let mut users = BTreeMap::new();
    users.insert("prometheus".to_string(), "scrape-me".to_string());

    let response = app(&users).oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));

    let wrong = Request::builder()
        .uri("/metrics")
        .header(
            header::AUTHORIZATION,
            format!("Basic {}", STANDARD.encode("prometheus:nope")),
        )
        .body(Body::empty())
        .unwrap();
    let response = app(&users).oneshot(wrong).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let right = Request::builder()
        .uri("/metrics")
        .header(
            header::AUTHORIZATION,
            format!("Basic {}", STANDARD.encode("prometheus:scrape-me")),
        )
        .body(Body::empty())
        .unwrap();
    let response = app(&users).oneshot(right).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // The landing page stays public.
    let response = app(&users).oneshot(get("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_unknown_path_is_not_found() {
    let response = app(&BTreeMap::new()).oneshot(get("/nope")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

//! nginx collector reading the `stub_status` page.

use async_trait::async_trait;
use prometheus::core::Desc;
use prometheus::proto::MetricFamily;
use prometheus::{Counter, GaugeVec, Opts};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument};

use super::{collect_all, describe_all, parse_u64, SourceCollector};
use crate::delta::{Counters, DeltaKind, DeltaTracker};
use crate::error::{CollectorError, Error};
use crate::transport::http::{self, HttpTarget};
use crate::transport::DEFAULT_CONNECT_TIMEOUT;

const NAME: &str = "nginx";

#[derive(Debug, Clone)]
pub struct NginxOptions {
    /// `http://host[:port]/path` or `unix:///socket[:/path]`.
    pub uri: String,
    pub services: Vec<String>,
    pub timeout: Duration,
}

impl Default for NginxOptions {
    fn default() -> Self {
        Self {
            uri: "http://localhost/nginx_status".to_string(),
            services: vec!["nginx".to_string()],
            timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Parsed `stub_status` page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StubStatus {
    pub active: u64,
    pub accepts: u64,
    pub handled: u64,
    pub requests: u64,
    pub reading: u64,
    pub writing: u64,
    pub waiting: u64,
}

impl Counters for StubStatus {
    fn wrapping_delta(&self, previous: &Self) -> Self {
        Self {
            accepts: self.accepts.wrapping_sub(previous.accepts),
            handled: self.handled.wrapping_sub(previous.handled),
            requests: self.requests.wrapping_sub(previous.requests),
            ..*self
        }
    }

    // A lone decrease is more likely a wrap than a restart.
    fn restarted_since(&self, previous: &Self) -> bool {
        self.accepts < previous.accepts && self.requests < previous.requests
    }
}

/// Parses the fixed `stub_status` layout:
///
/// ```text
/// Active connections: 291
/// server accepts handled requests
///  16630948 16630948 31070465
/// Reading: 6 Writing: 179 Waiting: 106
/// ```
pub fn parse_stub_status(body: &str) -> Result<StubStatus, CollectorError> {
    let mut lines = body.lines().map(str::trim).filter(|l| !l.is_empty());
    let mut next = |what: &str| {
        lines
            .next()
            .ok_or_else(|| CollectorError::parse(NAME, format!("missing {} line", what)))
    };

    let active = next("active connections")?;
    let active = active
        .strip_prefix("Active connections:")
        .ok_or_else(|| CollectorError::parse(NAME, format!("unexpected line '{}'", active)))?;

    let header = next("server header")?;
    if header != "server accepts handled requests" {
        return Err(CollectorError::parse(
            NAME,
            format!("unexpected line '{}'", header),
        ));
    }

    let counters: Vec<&str> = next("counters")?.split_whitespace().collect();
    if counters.len() != 3 {
        return Err(CollectorError::parse(
            NAME,
            format!("expected 3 counters, got {}", counters.len()),
        ));
    }

    let states: Vec<&str> = next("connection states")?.split_whitespace().collect();
    let state = |label: &str| -> Result<u64, CollectorError> {
        let pos = states
            .iter()
            .position(|s| *s == label)
            .ok_or_else(|| CollectorError::parse(NAME, format!("missing '{}'", label)))?;
        let value = states
            .get(pos + 1)
            .ok_or_else(|| CollectorError::parse(NAME, format!("no value after '{}'", label)))?;
        parse_u64(NAME, label, value)
    };

    Ok(StubStatus {
        active: parse_u64(NAME, "Active connections", active)?,
        accepts: parse_u64(NAME, "accepts", counters[0])?,
        handled: parse_u64(NAME, "handled", counters[1])?,
        requests: parse_u64(NAME, "requests", counters[2])?,
        reading: state("Reading:")?,
        writing: state("Writing:")?,
        waiting: state("Waiting:")?,
    })
}

/// Collector for one nginx `stub_status` endpoint.
pub struct Nginx {
    target: HttpTarget,
    opts: NginxOptions,
    stats: Mutex<DeltaTracker<(), StubStatus>>,

    req: Counter,
    connections: GaugeVec,
}

impl Nginx {
    pub async fn new(opts: NginxOptions) -> Result<Self, Error> {
        let target = HttpTarget::parse(&opts.uri)?;
        let nginx = Self {
            target,
            stats: Mutex::new(DeltaTracker::new()),
            req: Counter::new("nginx_requests_total", "Total number of requests.")?,
            connections: GaugeVec::new(
                Opts::new("nginx_connections", "Connections by state."),
                &["state"],
            )?,
            opts,
        };

        nginx.fetch().await?;
        debug!(
            "Connected to nginx at {}{}",
            nginx.target.endpoint, nginx.target.path
        );
        Ok(nginx)
    }

    async fn fetch(&self) -> Result<StubStatus, CollectorError> {
        let body = http::get(&self.target, self.opts.timeout)
            .await
            .map_err(|e| CollectorError::backend(NAME, e))?;
        let body = std::str::from_utf8(&body)
            .map_err(|e| CollectorError::parse(NAME, format!("body is not UTF-8: {}", e)))?;
        parse_stub_status(body)
    }
}

#[async_trait]
impl SourceCollector for Nginx {
    fn name(&self) -> &str {
        NAME
    }

    fn describe(&self) -> Vec<&Desc> {
        describe_all(&[&self.req, &self.connections])
    }

    #[instrument(skip(self), fields(collector = NAME))]
    async fn collect(&self) -> Result<Vec<MetricFamily>, CollectorError> {
        let start = Instant::now();
        let current = self.fetch().await?;

        let (diff, kind) = self
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .update_with_kind((), current);
        if kind == DeltaKind::Reset {
            debug!("nginx counters went backwards, assuming restart");
        }

        self.req.inc_by(diff.requests as f64);
        self.connections
            .with_label_values(&["active"])
            .set(diff.active as f64);
        self.connections
            .with_label_values(&["reading"])
            .set(diff.reading as f64);
        self.connections
            .with_label_values(&["writing"])
            .set(diff.writing as f64);
        self.connections
            .with_label_values(&["waiting"])
            .set(diff.waiting as f64);

        info!("collect duration for nginx: {:?}", start.elapsed());
        Ok(collect_all(&[&self.req, &self.connections]))
    }

    fn required_services(&self) -> &[String] {
        &self.opts.services
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const STATUS: &str = "Active connections: 291 \nserver accepts handled requests\n 16630948 16630948 31070465 \nReading: 6 Writing: 179 Waiting: 106 \n";

    #[test]
    fn test_parse_stub_status() {
        let status = parse_stub_status(STATUS).unwrap();
        assert_eq!(
            status,
            StubStatus {
                active: 291,
                accepts: 16630948,
                handled: 16630948,
                requests: 31070465,
                reading: 6,
                writing: 179,
                waiting: 106,
            }
        );
    }

    #[test]
    fn test_parse_stub_status_malformed() {
        assert!(parse_stub_status("").is_err());
        assert!(parse_stub_status("<html>404</html>").is_err());
        let truncated = "Active connections: 1\nserver accepts handled requests\n 1 2\n";
        assert!(parse_stub_status(truncated).is_err());
        let bad = STATUS.replace("Waiting: 106", "Waiting: many");
        assert!(parse_stub_status(&bad).is_err());
    }

    #[test]
    fn test_restart_needs_both_counters_to_drop() {
        let before = parse_stub_status(STATUS).unwrap();
        let mut after = before;
        after.requests = 10;
        assert!(!after.restarted_since(&before));
        after.accepts = 5;
        assert!(after.restarted_since(&before));
    }

    async fn serve(bodies: Vec<(&'static str, String)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for (status, body) in bodies {
                let (mut sock, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 4096];
                let _ = sock.read(&mut buf).await.unwrap();
                let reply = format!(
                    "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                sock.write_all(reply.as_bytes()).await.unwrap();
            }
        });
        format!("http://{}/nginx_status", addr)
    }

    #[tokio::test]
    async fn test_collect_requests_delta() {
        let later = STATUS.replace("31070465", "31070565");
        let uri = serve(vec![
            ("200 OK", STATUS.to_string()),
            ("200 OK", STATUS.to_string()),
            ("200 OK", later),
        ])
        .await;

        let nginx = Nginx::new(NginxOptions {
            uri,
            ..Default::default()
        })
        .await
        .unwrap();

        nginx.collect().await.unwrap();
        assert_eq!(nginx.req.get(), 31070465.0);
        nginx.collect().await.unwrap();
        assert_eq!(nginx.req.get(), 31070565.0);
        assert_eq!(
            nginx.connections.with_label_values(&["active"]).get(),
            291.0
        );
    }

    #[tokio::test]
    async fn test_collect_fails_on_http_error() {
        let uri = serve(vec![
            ("200 OK", STATUS.to_string()),
            ("404 Not Found", "nope".to_string()),
        ])
        .await;

        let nginx = Nginx::new(NginxOptions {
            uri,
            ..Default::default()
        })
        .await
        .unwrap();
        let err = nginx.collect().await.unwrap_err();
        assert!(matches!(err, CollectorError::Fetch { .. }));
        assert_eq!(nginx.req.get(), 0.0);
    }
}

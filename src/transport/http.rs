//! Minimal HTTP GET client over TCP or Unix sockets.
//!
//! Used for status pages such as nginx `stub_status`. Redirects are not
//! followed and a fresh connection is opened per request.

use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use std::io;
use std::time::Duration;
use tracing::debug;

use super::{connect, EXCHANGE_TIMEOUT_FACTOR};
use crate::error::ConfigError;
use crate::uri::Endpoint;

/// A parsed status page location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpTarget {
    pub endpoint: Endpoint,
    pub host: String,
    pub path: String,
}

impl HttpTarget {
    /// Parses `http://host[:port]/path` or `unix:///socket[:/path]`.
    pub fn parse(uri: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidUri {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };

        if let Some(rest) = uri.strip_prefix("unix:") {
            let rest = rest.strip_prefix("//").unwrap_or(rest);
            let (socket, path) = match rest.split_once(":/") {
                Some((socket, path)) => (socket, format!("/{}", path)),
                None => (rest, "/".to_string()),
            };
            if !socket.starts_with('/') {
                return Err(invalid("Unix socket path is not an absolute path"));
            }
            return Ok(Self {
                endpoint: Endpoint::Unix(socket.into()),
                host: "localhost".to_string(),
                path,
            });
        }

        let rest = if let Some(rest) = uri.strip_prefix("http://") {
            rest
        } else if uri.starts_with("https://") {
            return Err(invalid("unsupported protocol: https"));
        } else if uri.contains("://") {
            return Err(invalid("unsupported protocol"));
        } else {
            uri
        };

        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], rest[i..].to_string()),
            None => (rest, "/".to_string()),
        };
        if authority.is_empty() {
            return Err(invalid("missing host"));
        }
        let addr = if has_port(authority) {
            authority.to_string()
        } else {
            format!("{}:80", authority)
        };

        Ok(Self {
            endpoint: Endpoint::Tcp(addr),
            host: authority.to_string(),
            path,
        })
    }
}

fn has_port(authority: &str) -> bool {
    match authority.rsplit_once(':') {
        // "[::1]" has colons but no port
        Some((host, port)) => !port.is_empty() && !host.ends_with(':') && !port.ends_with(']'),
        None => false,
    }
}

/// Performs a GET against `target` and returns the body of a 2xx response.
pub async fn get(target: &HttpTarget, timeout: Duration) -> io::Result<Bytes> {
    let stream = connect(&target.endpoint, timeout).await?;

    let request = async {
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| io::Error::other(format!("HTTP handshake with {}: {}", target.endpoint, e)))?;
        let connection = tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("HTTP connection closed with error: {}", e);
            }
        });

        let req = Request::get(target.path.as_str())
            .header(hyper::header::HOST, target.host.as_str())
            .header(hyper::header::CONNECTION, "close")
            .body(Empty::<Bytes>::new())
            .map_err(io::Error::other)?;

        let response = sender
            .send_request(req)
            .await
            .map_err(|e| io::Error::other(format!("GET {}: {}", target.path, e)))?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| io::Error::other(format!("reading body from {}: {}", target.endpoint, e)))?
            .to_bytes();
        connection.abort();

        if !status.is_success() {
            return Err(status_error(status, &target.path));
        }
        Ok(body)
    };

    tokio::time::timeout(timeout * EXCHANGE_TIMEOUT_FACTOR, request)
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("GET {} on {} timed out", target.path, target.endpoint),
            )
        })?
}

fn status_error(status: StatusCode, path: &str) -> io::Error {
    io::Error::other(format!("GET {} returned {}", path, status))
}

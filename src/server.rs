//! HTTP listener setup.
//!
//! The exporter listens on TCP (optionally with TLS) or on a Unix socket.

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use std::fmt;
use std::future::Future;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::net::{TcpListener, UnixListener};
use tokio::signal;
use tracing::{error, info};

use crate::error::{ConfigError, Error};

/// Where the HTTP server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddress {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl ListenAddress {
    /// Parses `:port`, `host:port` or `unix:///path`.
    pub fn parse(addr: &str) -> Result<Self, ConfigError> {
        if let Some(rest) = addr.strip_prefix("unix:") {
            let path = rest.strip_prefix("//").unwrap_or(rest);
            if !Path::new(path).is_absolute() {
                return Err(ConfigError::InvalidUri {
                    uri: addr.to_string(),
                    reason: "Unix socket path is not an absolute path".into(),
                });
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }

        let host_port = addr.strip_prefix("tcp://").unwrap_or(addr);
        let host_port = if host_port.starts_with(':') {
            format!("0.0.0.0{}", host_port)
        } else {
            host_port.to_string()
        };

        host_port
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .map(Self::Tcp)
            .ok_or_else(|| ConfigError::InvalidAddress(addr.to_string()))
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{}", addr),
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Splits `username:password`; neither part may be empty.
pub fn parse_basic_auth(raw: &str) -> Result<(String, String), ConfigError> {
    match raw.split_once(':') {
        Some((user, password)) if !user.is_empty() && !password.is_empty() => {
            Ok((user.to_string(), password.to_string()))
        }
        _ => Err(ConfigError::InvalidBasicAuth),
    }
}

/// Binds a Unix socket, replacing a stale socket file and restricting access
/// to owner and group.
pub fn bind_unix(path: &Path) -> Result<UnixListener, Error> {
    if path.exists() {
        info!("Removing existing file {}", path.display());
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    info!("Setting file permissions to 0770 on {}", path.display());
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o770))?;
    Ok(listener)
}

/// Serves `app` until `shutdown` resolves.
pub async fn serve<F>(
    app: Router,
    listen: &ListenAddress,
    tls: Option<&(PathBuf, PathBuf)>,
    shutdown: F,
) -> Result<(), Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    match (listen, tls) {
        (ListenAddress::Unix(path), _) => {
            let listener = bind_unix(path)?;
            info!("svcgate-exporter listening on Unix socket {}", path.display());
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await?;
        }
        (ListenAddress::Tcp(addr), Some((cert_path, key_path))) => {
            info!("Loading TLS certificate from: {}", cert_path.display());
            info!("Loading TLS private key from: {}", key_path.display());

            let tls_config = RustlsConfig::from_pem_file(cert_path, key_path)
                .await
                .map_err(|e| {
                    error!("Failed to load TLS configuration: {}", e);
                    e
                })?;

            info!("svcgate-exporter listening on https://{}", addr);
            let server = axum_server::bind_rustls(*addr, tls_config).serve(app.into_make_service());

            tokio::select! {
                result = server => result?,
                _ = shutdown => {
                    info!("Shutdown signal received, exiting...");
                }
            }
        }
        (ListenAddress::Tcp(addr), None) => {
            let listener = TcpListener::bind(addr).await?;
            info!("svcgate-exporter listening on http://{}", addr);
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await?;
        }
    }
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), shutting down gracefully...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listen_address() {
        assert_eq!(
            ListenAddress::parse(":9900").unwrap(),
            ListenAddress::Tcp("0.0.0.0:9900".parse().unwrap())
        );
        assert_eq!(
            ListenAddress::parse("127.0.0.1:9100").unwrap(),
            ListenAddress::Tcp("127.0.0.1:9100".parse().unwrap())
        );
        assert_eq!(
            ListenAddress::parse("unix:///run/svcgate.sock").unwrap(),
            ListenAddress::Unix("/run/svcgate.sock".into())
        );
        assert!(ListenAddress::parse("unix:svcgate.sock").is_err());
        assert!(ListenAddress::parse("not an address").is_err());
        assert!(ListenAddress::parse("127.0.0.1").is_err());
    }

    #[test]
    fn test_parse_basic_auth() {
        assert_eq!(
            parse_basic_auth("admin:s3:cret").unwrap(),
            ("admin".to_string(), "s3:cret".to_string())
        );
        assert!(parse_basic_auth("admin").is_err());
        assert!(parse_basic_auth(":pw").is_err());
        assert!(parse_basic_auth("admin:").is_err());
    }

    #[tokio::test]
    async fn test_bind_unix_replaces_file_and_sets_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exporter.sock");
        std::fs::write(&path, b"stale").unwrap();

        let _listener = bind_unix(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o770);
    }
}

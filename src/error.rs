//! Error taxonomy for the exporter.
//!
//! Startup errors (`ConfigError`, `GateError::CapacityExceeded`) are fatal.
//! Per-scrape errors (`GateError::ServiceQuery`, `CollectorError`) are logged
//! and never fail the whole HTTP response.

use thiserror::Error;

/// Invalid configuration detected at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    #[error("invalid glob pattern '{pattern}': {reason}")]
    InvalidGlob { pattern: String, reason: String },

    #[error("invalid format for basic auth, expected username:password")]
    InvalidBasicAuth,

    #[error("{0}")]
    Invalid(String),

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by the service activity gate.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("too many services registered: maximum is {max} services")]
    CapacityExceeded { max: usize },

    #[error("querying service states: {0}")]
    ServiceQuery(String),
}

/// Failure of a single collector during one scrape.
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("{collector}: fetch failed: {reason}")]
    Fetch { collector: String, reason: String },

    #[error("{collector}: parse failed: {reason}")]
    Parse { collector: String, reason: String },

    #[error("{collector}: {reason}")]
    Timeout { collector: String, reason: String },

    #[error("{collector}: collector task panicked")]
    Panicked { collector: String },
}

impl CollectorError {
    pub fn fetch(collector: &str, reason: impl ToString) -> Self {
        Self::Fetch {
            collector: collector.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn parse(collector: &str, reason: impl ToString) -> Self {
        Self::Parse {
            collector: collector.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Classifies a transport error; timeouts keep their own variant.
    pub fn backend(collector: &str, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::TimedOut {
            Self::Timeout {
                collector: collector.to_string(),
                reason: err.to_string(),
            }
        } else {
            Self::fetch(collector, err)
        }
    }

    /// Name of the collector that failed.
    pub fn collector(&self) -> &str {
        match self {
            Self::Fetch { collector, .. }
            | Self::Parse { collector, .. }
            | Self::Timeout { collector, .. }
            | Self::Panicked { collector } => collector,
        }
    }
}

/// Errors surfaced from a scrape, collected for logging.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Collector(#[from] CollectorError),
}

/// Top-level error used while building the exporter at startup.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Collector(#[from] CollectorError),

    #[error(transparent)]
    Prometheus(#[from] prometheus::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

//! svcgate-exporter library.
//!
//! A Prometheus exporter that samples kernel statistics and a handful of
//! backend daemons (Redis, nginx, PHP-FPM, memcached). Backend collectors
//! are gated on the systemd services they depend on: a collector whose
//! services are not all active is skipped for that scrape.
//!
//! Counters are exported as the increase since the previous successful
//! reading of the same source, accumulated into Prometheus counters, so a
//! daemon restart never shows up as a negative rate.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use svcgate_exporter::collectors::{Node, NodeOptions};
//! use svcgate_exporter::exporter::Exporter;
//! use svcgate_exporter::systemd::SystemdStatus;
//!
//! # async fn run() -> svcgate_exporter::error::Result<()> {
//! let status = SystemdStatus::connect(Duration::from_secs(1)).await?;
//! let mut exporter = Exporter::new(Arc::new(status))?;
//! exporter.register(Arc::new(Node::new(NodeOptions::default())?))?;
//!
//! let scrape = exporter.collect_all().await;
//! println!("{}", exporter.render(&scrape)?);
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod collectors;
pub mod config;
pub mod delta;
pub mod error;
pub mod exporter;
pub mod gate;
pub mod handlers;
pub mod server;
pub mod state;
pub mod system;
pub mod systemd;
pub mod transport;
pub mod uri;

pub use delta::DeltaTracker;
pub use error::{CollectorError, ConfigError, Error, GateError, ScrapeError};
pub use exporter::{Exporter, Scrape};
pub use gate::{ServiceGate, ServiceStatus};

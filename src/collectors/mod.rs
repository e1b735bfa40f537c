//! Source collectors.
//!
//! One collector per backend kind. A collector fetches a fresh reading from
//! its backend on every scrape, turns counters into deltas with its own
//! [`DeltaTracker`](crate::delta::DeltaTracker), and returns its metric
//! families. Procfs parsers used by the node collector live next to it.

pub mod diskstats;
pub mod filesystem;
pub mod memcache;
pub mod netdev;
pub mod nginx;
pub mod node;
pub mod phpfpm;
pub mod redis;

use async_trait::async_trait;
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;

use crate::error::CollectorError;

pub use memcache::{Memcache, MemcacheOptions};
pub use nginx::{Nginx, NginxOptions};
pub use node::{Node, NodeOptions};
pub use phpfpm::{PhpFpm, PhpFpmOptions};
pub use redis::{Redis, RedisOptions};

/// Uniform contract every backend collector implements.
///
/// `collect` performs exactly one backend fetch. On failure it returns an
/// error and leaves its metrics untouched, so no partial data is published.
/// The orchestrator never runs `collect` of the same collector twice at once.
#[async_trait]
pub trait SourceCollector: Send + Sync {
    /// Short identifier used in logs and errors.
    fn name(&self) -> &str;

    /// Descriptors of every metric this collector may emit.
    fn describe(&self) -> Vec<&Desc>;

    /// Fetches, parses and updates deltas for this scrape.
    async fn collect(&self) -> Result<Vec<MetricFamily>, CollectorError>;

    /// Releases backend resources.
    fn close(&self) {}

    /// systemd services that must be active for this collector to run.
    fn required_services(&self) -> &[String];
}

/// Describes a set of prometheus collectors.
pub(crate) fn describe_all<'a>(metrics: &[&'a dyn Collector]) -> Vec<&'a Desc> {
    metrics.iter().copied().flat_map(|m| m.desc()).collect()
}

/// Gathers a set of prometheus collectors into metric families.
pub(crate) fn collect_all(metrics: &[&dyn Collector]) -> Vec<MetricFamily> {
    metrics.iter().flat_map(|m| m.collect()).collect()
}

/// Parses an unsigned counter, naming the backend key on failure.
pub(crate) fn parse_u64(collector: &str, key: &str, value: &str) -> Result<u64, CollectorError> {
    value.trim().parse::<u64>().map_err(|_| {
        CollectorError::parse(
            collector,
            format!("key {}: {} is not an integer", key, value.trim()),
        )
    })
}

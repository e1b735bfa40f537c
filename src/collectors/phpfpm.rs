//! PHP-FPM opcache collector.
//!
//! Runs a status script through FastCGI. The script prints one
//! `opcache_status_<key> <value>` pair per line.

use async_trait::async_trait;
use prometheus::core::Desc;
use prometheus::proto::MetricFamily;
use prometheus::{CounterVec, GaugeVec, Opts};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

use super::{collect_all, describe_all, parse_u64, SourceCollector};
use crate::delta::{Counters, DeltaKind, DeltaTracker};
use crate::error::{CollectorError, ConfigError, Error};
use crate::transport::{fastcgi, DEFAULT_CONNECT_TIMEOUT};
use crate::uri::{parse_uri, Endpoint};

const NAME: &str = "phpfpm";

#[derive(Debug, Clone)]
pub struct PhpFpmOptions {
    /// FastCGI listener, `host:port` or `unix:///path`.
    pub uri: String,
    /// Status script executed by PHP-FPM; must exist locally.
    pub script: String,
    pub services: Vec<String>,
    pub timeout: Duration,
}

impl Default for PhpFpmOptions {
    fn default() -> Self {
        Self {
            uri: "unix:///run/php/php-fpm.sock".to_string(),
            script: "/usr/local/share/svcgate-exporter/opcache_status.php".to_string(),
            services: vec!["php-fpm".to_string()],
            timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// One opcache reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpcacheStats {
    pub memory_used: u64,
    pub memory_total: u64,
    pub strings_memory_used: u64,
    pub strings_memory_total: u64,
    pub key_hits: u64,
    pub key_misses: u64,
    pub start_time: u64,
}

impl Counters for OpcacheStats {
    fn wrapping_delta(&self, previous: &Self) -> Self {
        Self {
            key_hits: self.key_hits.wrapping_sub(previous.key_hits),
            key_misses: self.key_misses.wrapping_sub(previous.key_misses),
            ..*self
        }
    }

    fn restarted_since(&self, previous: &Self) -> bool {
        self.start_time != previous.start_time
    }
}

/// Parses the status script output.
///
/// Lines that are not exactly two fields are ignored. Totals are reported by
/// opcache as free memory, so used memory is added back.
pub fn parse_opcache_status(body: &str) -> Result<OpcacheStats, CollectorError> {
    let mut stats = OpcacheStats::default();
    let mut found = false;

    for line in body.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [key, value] = fields[..] else {
            continue;
        };
        let slot = match key {
            "opcache_status_memory_usage_used_memory" => &mut stats.memory_used,
            "opcache_status_memory_usage_free_memory" => &mut stats.memory_total,
            "opcache_status_interned_strings_usage_used_memory" => &mut stats.strings_memory_used,
            "opcache_status_interned_strings_usage_free_memory" => {
                &mut stats.strings_memory_total
            }
            "opcache_status_opcache_statistics_hits" => &mut stats.key_hits,
            "opcache_status_opcache_statistics_misses" => &mut stats.key_misses,
            "opcache_status_opcache_statistics_start_time" => &mut stats.start_time,
            _ => continue,
        };
        *slot = parse_u64(NAME, key, value)?;
        found = true;
    }

    if !found {
        return Err(CollectorError::parse(
            NAME,
            "no opcache_status values in script output",
        ));
    }

    stats.memory_total = stats.memory_total.saturating_add(stats.memory_used);
    stats.strings_memory_total = stats
        .strings_memory_total
        .saturating_add(stats.strings_memory_used);
    Ok(stats)
}

/// Collector for a PHP-FPM pool's opcache.
pub struct PhpFpm {
    endpoint: Endpoint,
    opts: PhpFpmOptions,
    stats: Mutex<DeltaTracker<(), OpcacheStats>>,

    mem: GaugeVec,
    strings_mem: GaugeVec,
    key: CounterVec,
}

impl PhpFpm {
    pub async fn new(opts: PhpFpmOptions) -> Result<Self, Error> {
        let endpoint = parse_uri(&opts.uri)?;
        if !Path::new(&opts.script).is_file() {
            return Err(ConfigError::Io {
                path: opts.script.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "status script not found",
                ),
            }
            .into());
        }

        let phpfpm = Self {
            endpoint,
            stats: Mutex::new(DeltaTracker::new()),
            mem: GaugeVec::new(
                Opts::new("phpfpm_mem_bytes", "Memory size in bytes."),
                &["type"],
            )?,
            strings_mem: GaugeVec::new(
                Opts::new(
                    "phpfpm_strings_mem_bytes",
                    "Interned strings memory size in bytes.",
                ),
                &["type"],
            )?,
            key: CounterVec::new(
                Opts::new("phpfpm_key_total", "Key hits or misses."),
                &["type"],
            )?,
            opts,
        };

        phpfpm.fetch().await?;
        debug!("Connected to php-fpm at {}", phpfpm.endpoint);
        Ok(phpfpm)
    }

    async fn fetch(&self) -> Result<OpcacheStats, CollectorError> {
        let response = fastcgi::get(&self.endpoint, &self.opts.script, self.opts.timeout)
            .await
            .map_err(|e| CollectorError::backend(NAME, e))?;
        if !response.stderr.is_empty() {
            warn!(
                "php-fpm stderr: {}",
                String::from_utf8_lossy(&response.stderr).trim()
            );
        }
        let body = std::str::from_utf8(response.body())
            .map_err(|e| CollectorError::parse(NAME, format!("output is not UTF-8: {}", e)))?;
        parse_opcache_status(body)
    }
}

#[async_trait]
impl SourceCollector for PhpFpm {
    fn name(&self) -> &str {
        NAME
    }

    fn describe(&self) -> Vec<&Desc> {
        describe_all(&[&self.mem, &self.strings_mem, &self.key])
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
            debug!("opcache start_time changed, reporting raw counters");
        }

        self.mem.with_label_values(&["used"]).set(diff.memory_used as f64);
        self.mem.with_label_values(&["total"]).set(diff.memory_total as f64);
        self.strings_mem
            .with_label_values(&["used"])
            .set(diff.strings_memory_used as f64);
        self.strings_mem
            .with_label_values(&["total"])
            .set(diff.strings_memory_total as f64);
        self.key.with_label_values(&["hits"]).inc_by(diff.key_hits as f64);
        self.key.with_label_values(&["misses"]).inc_by(diff.key_misses as f64);

        debug!("collect duration for phpfpm: {:?}", start.elapsed());
        Ok(collect_all(&[&self.mem, &self.strings_mem, &self.key]))
    }

    fn required_services(&self) -> &[String] {
        &self.opts.services
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUTPUT: &str = "\
opcache_status_opcache_enabled 1
opcache_status_memory_usage_used_memory 1000
opcache_status_memory_usage_free_memory 3000
opcache_status_interned_strings_usage_used_memory 200
opcache_status_interned_strings_usage_free_memory 800
opcache_status_opcache_statistics_hits 50
opcache_status_opcache_statistics_misses 5
opcache_status_opcache_statistics_start_time 1700000000
some text that is not a pair
";

    #[test]
    fn test_parse_opcache_status() {
        let stats = parse_opcache_status(OUTPUT).unwrap();
        assert_eq!(
            stats,
            OpcacheStats {
                memory_used: 1000,
                memory_total: 4000,
                strings_memory_used: 200,
                strings_memory_total: 1000,
                key_hits: 50,
                key_misses: 5,
                start_time: 1700000000,
            }
        );
    }

    #[test]
    fn test_parse_opcache_status_errors() {
        assert!(parse_opcache_status("").is_err());
        assert!(parse_opcache_status("opcache_status_opcache_statistics_hits x\n").is_err());
    }

    #[test]
    fn test_restart_on_start_time_change() {
        let mut tracker = DeltaTracker::new();
        let before = parse_opcache_status(OUTPUT).unwrap();
        tracker.update((), before);

        let mut after = before;
        after.key_hits = 7;
        after.start_time += 60;
        let (delta, kind) = tracker.update_with_kind((), after);
        assert_eq!(kind, DeltaKind::Reset);
        assert_eq!(delta.key_hits, 7);
    }

    #[tokio::test]
    async fn test_new_requires_script() {
        let result = PhpFpm::new(PhpFpmOptions {
            uri: "127.0.0.1:9000".into(),
            script: "/nonexistent/status.php".into(),
            ..Default::default()
        })
        .await;
        assert!(matches!(result, Err(Error::Config(ConfigError::Io { .. }))));
    }
}

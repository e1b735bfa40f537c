//! memcached collector.
//!
//! Polls every configured server with the text protocol `stats` command. Unix
//! socket globs are expanded on each scrape, so servers may come and go; a
//! server that disappears loses its baseline and its exported series.

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use prometheus::core::Desc;
use prometheus::proto::MetricFamily;
use prometheus::{CounterVec, GaugeVec, Opts};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

use super::{collect_all, describe_all, parse_u64, SourceCollector};
use crate::delta::{Counters, DeltaKind, DeltaTracker};
use crate::error::{CollectorError, ConfigError, Error};
use crate::transport::{exchange, DEFAULT_CONNECT_TIMEOUT};
use crate::uri::{Endpoint, UriGlobs};

const NAME: &str = "memcache";

const HIT_KEYS: [&str; 6] = [
    "get_hits",
    "delete_hits",
    "incr_hits",
    "decr_hits",
    "cas_hits",
    "touch_hits",
];

const MISS_KEYS: [&str; 6] = [
    "get_misses",
    "delete_misses",
    "incr_misses",
    "decr_misses",
    "cas_misses",
    "touch_misses",
];

#[derive(Debug, Clone)]
pub struct MemcacheOptions {
    /// Server URIs; Unix paths may be globs or directories.
    pub uris: Vec<String>,
    pub services: Vec<String>,
    pub timeout: Duration,
}

impl Default for MemcacheOptions {
    fn default() -> Self {
        Self {
            uris: vec!["localhost:11211".to_string()],
            services: vec!["memcached".to_string()],
            timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// One `stats` reading of a server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemcacheStats {
    pub memory_used: u64,
    pub memory_total: u64,
    pub key_hits: u64,
    pub key_misses: u64,
    pub uptime: u64,
    pub pid: u64,
}

impl Counters for MemcacheStats {
    fn wrapping_delta(&self, previous: &Self) -> Self {
        Self {
            key_hits: self.key_hits.wrapping_sub(previous.key_hits),
            key_misses: self.key_misses.wrapping_sub(previous.key_misses),
            ..*self
        }
    }

    fn restarted_since(&self, previous: &Self) -> bool {
        self.uptime < previous.uptime || self.pid != previous.pid
    }
}

/// Parses a `stats` reply made of `STAT <key> <value>` lines ending in `END`.
pub fn parse_stats(reply: &str) -> Result<MemcacheStats, CollectorError> {
    let mut values: HashMap<&str, &str> = HashMap::new();
    for line in reply.lines() {
        let line = line.trim_end();
        if line == "END" {
            break;
        }
        if line == "ERROR" || line.starts_with("SERVER_ERROR") || line.starts_with("CLIENT_ERROR")
        {
            return Err(CollectorError::fetch(NAME, line));
        }
        let mut parts = line.splitn(3, ' ');
        if let (Some("STAT"), Some(key), Some(value)) = (parts.next(), parts.next(), parts.next()) {
            values.insert(key, value);
        }
    }

    let get = |key: &str| -> Result<u64, CollectorError> {
        let value = values
            .get(key)
            .ok_or_else(|| CollectorError::parse(NAME, format!("missing stat {}", key)))?;
        parse_u64(NAME, key, value)
    };
    // Older servers lack some hit/miss kinds.
    let sum = |keys: &[&str]| -> Result<u64, CollectorError> {
        keys.iter()
            .filter(|k| values.contains_key(*k))
            .try_fold(0u64, |acc, k| Ok(acc.wrapping_add(get(*k)?)))
    };

    Ok(MemcacheStats {
        memory_used: get("bytes")?,
        memory_total: get("limit_maxbytes")?,
        key_hits: sum(&HIT_KEYS)?,
        key_misses: sum(&MISS_KEYS)?,
        uptime: get("uptime")?,
        pid: values.get("pid").map_or(Ok(0), |v| parse_u64(NAME, "pid", v))?,
    })
}

fn is_complete(buf: &[u8]) -> bool {
    buf.ends_with(b"END\r\n") || buf.ends_with(b"ERROR\r\n") || {
        buf.ends_with(b"\r\n")
            && (buf.starts_with(b"SERVER_ERROR") || buf.starts_with(b"CLIENT_ERROR"))
    }
}

/// Collector for one or more memcached servers.
pub struct Memcache {
    uris: UriGlobs,
    opts: MemcacheOptions,
    stats: Mutex<DeltaTracker<String, MemcacheStats>>,

    mem: GaugeVec,
    key: CounterVec,
}

impl Memcache {
    pub async fn new(opts: MemcacheOptions) -> Result<Self, Error> {
        let uris = UriGlobs::parse(&opts.uris)?;
        if uris.is_empty() {
            return Err(ConfigError::Invalid("memcache: no server URIs configured".into()).into());
        }

        let memcache = Self {
            uris,
            stats: Mutex::new(DeltaTracker::new()),
            mem: GaugeVec::new(
                Opts::new("memcache_mem_bytes", "Memory size in bytes."),
                &["type", "server"],
            )?,
            key: CounterVec::new(
                Opts::new("memcache_key_total", "Key hits or misses."),
                &["type", "server"],
            )?,
            opts,
        };

        let servers = memcache.fetch_all().await?;
        debug!("Connected to {} memcached server(s)", servers.len());
        Ok(memcache)
    }

    async fn fetch(&self, endpoint: &Endpoint) -> Result<MemcacheStats, CollectorError> {
        let reply = exchange(endpoint, b"stats\r\n", self.opts.timeout, is_complete)
            .await
            .map_err(|e| {
                CollectorError::backend(
                    NAME,
                    std::io::Error::new(e.kind(), format!("{}: {}", endpoint, e)),
                )
            })?;
        let reply = String::from_utf8_lossy(&reply);
        parse_stats(&reply)
    }

    /// Reads every current server; fails if any one of them fails.
    async fn fetch_all(&self) -> Result<Vec<(String, MemcacheStats)>, CollectorError> {
        let endpoints = self.uris.get();
        let mut readings = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let stats = self.fetch(&endpoint).await?;
            readings.push((endpoint.to_string(), stats));
        }
        Ok(readings)
    }

    fn remove_server(&self, server: &str) {
        for kind in ["used", "total"] {
            let _ = self.mem.remove_label_values(&[kind, server]);
        }
        for kind in ["hits", "misses"] {
            let _ = self.key.remove_label_values(&[kind, server]);
        }
    }
}

#[async_trait]
impl SourceCollector for Memcache {
    fn name(&self) -> &str {
        NAME
    }

    fn describe(&self) -> Vec<&Desc> {
        describe_all(&[&self.mem, &self.key])
    }

    #[instrument(skip(self), fields(collector = NAME))]
    async fn collect(&self) -> Result<Vec<MetricFamily>, CollectorError> {
        let start = Instant::now();
        let readings = self.fetch_all().await?;

        let mut tracker = self.stats.lock().unwrap_or_else(PoisonError::into_inner);

        let mut vanished = Vec::new();
        tracker.retain(|server| {
            let keep = readings.iter().any(|(name, _)| name == server);
            if !keep {
                vanished.push(server.clone());
            }
            keep
        });
        for server in &vanished {
            debug!("memcached server {} vanished", server);
            self.remove_server(server);
        }

        for (server, current) in readings {
            let (diff, kind) = tracker.update_with_kind(server.clone(), current);
            if kind == DeltaKind::Reset {
                debug!("memcached {} restarted, reporting raw counters", server);
            }
            let server = server.as_str();
            self.mem
                .with_label_values(&["used", server])
                .set(diff.memory_used as f64);
            self.mem
                .with_label_values(&["total", server])
                .set(diff.memory_total as f64);
            self.key
                .with_label_values(&["hits", server])
                .inc_by(diff.key_hits as f64);
            self.key
                .with_label_values(&["misses", server])
                .inc_by(diff.key_misses as f64);
        }
        drop(tracker);

        debug!("collect duration for memcache: {:?}", start.elapsed());
        Ok(collect_all(&[&self.mem, &self.key]))
    }

    fn required_services(&self) -> &[String] {
        &self.opts.services
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    fn stats_reply(hits: u64, uptime: u64) -> String {
        format!(
            "STAT pid 42\r\nSTAT uptime {}\r\nSTAT version 1.6.21\r\nSTAT bytes 2048\r\nSTAT limit_maxbytes 67108864\r\nSTAT get_hits {}\r\nSTAT get_misses 4\r\nSTAT delete_hits 1\r\nSTAT delete_misses 0\r\nEND\r\n",
            uptime, hits
        )
    }

    #[test]
    fn test_parse_stats() {
        let stats = parse_stats(&stats_reply(10, 100)).unwrap();
        assert_eq!(
            stats,
            MemcacheStats {
                memory_used: 2048,
                memory_total: 67108864,
                key_hits: 11,
                key_misses: 4,
                uptime: 100,
                pid: 42,
            }
        );
    }

    #[test]
    fn test_parse_stats_errors() {
        assert!(parse_stats("ERROR\r\n").is_err());
        assert!(parse_stats("STAT bytes 1\r\nEND\r\n").is_err());
        assert!(parse_stats(&stats_reply(10, 100).replace("2048", "x")).is_err());
    }

    #[test]
    fn test_reply_completion() {
        assert!(is_complete(b"STAT a 1\r\nEND\r\n"));
        assert!(is_complete(b"ERROR\r\n"));
        assert!(is_complete(b"SERVER_ERROR out of memory\r\n"));
        assert!(!is_complete(b"STAT a 1\r\n"));
    }

    /// Serves `stats` on a Unix socket, answering with `hits` on every request.
    fn spawn_server(path: &Path, hits: u64) {
        let listener = UnixListener::bind(path).unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = [0u8; 7];
                if sock.read_exact(&mut buf).await.is_err() {
                    continue;
                }
                let _ = sock.write_all(stats_reply(hits, 100).as_bytes()).await;
            }
        });
    }

    fn hits_for(families: &[MetricFamily], server: &str) -> Option<f64> {
        families
            .iter()
            .filter(|f| f.get_name() == "memcache_key_total")
            .flat_map(|f| f.get_metric())
            .find(|m| {
                let labels = m.get_label();
                labels.iter().any(|l| l.get_name() == "server" && l.get_value() == server)
                    && labels.iter().any(|l| l.get_name() == "type" && l.get_value() == "hits")
            })
            .map(|m| m.get_counter().value())
    }

    #[tokio::test]
    async fn test_glob_servers_come_and_go() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.sock");
        let b = dir.path().join("b.sock");
        spawn_server(&a, 10);
        spawn_server(&b, 20);

        let memcache = Memcache::new(MemcacheOptions {
            uris: vec![format!("unix://{}/*.sock", dir.path().display())],
            ..Default::default()
        })
        .await
        .unwrap();

        let server_a = format!("unix://{}", a.display());
        let server_b = format!("unix://{}", b.display());

        let first = memcache.collect().await.unwrap();
        assert_eq!(hits_for(&first, &server_a), Some(11.0));
        assert_eq!(hits_for(&first, &server_b), Some(21.0));

        std::fs::remove_file(&b).unwrap();
        let second = memcache.collect().await.unwrap();
        assert_eq!(hits_for(&second, &server_a), Some(11.0));
        assert_eq!(hits_for(&second, &server_b), None);
        assert!(memcache.stats.lock().unwrap().last(&server_b).is_none());
    }

    #[tokio::test]
    async fn test_new_rejects_missing_socket() {
        let result = Memcache::new(MemcacheOptions {
            uris: vec!["unix:///nonexistent/memcached.sock".into()],
            ..Default::default()
        })
        .await;
        assert!(matches!(result, Err(Error::Config(ConfigError::Io { .. }))));
    }
}

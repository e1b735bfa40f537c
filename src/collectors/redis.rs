//! Redis collector.
//!
//! Sends `INFO ALL` over RESP and reads memory usage plus keyspace hit and
//! miss counters from the reply.

use async_trait::async_trait;
use prometheus::core::Desc;
use prometheus::proto::MetricFamily;
use prometheus::{CounterVec, GaugeVec, Opts};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

use super::{collect_all, describe_all, parse_u64, SourceCollector};
use crate::delta::{Counters, DeltaKind, DeltaTracker};
use crate::error::{CollectorError, Error};
use crate::transport::{exchange, DEFAULT_CONNECT_TIMEOUT};
use crate::uri::{parse_uri, Endpoint};

const NAME: &str = "redis";

const INFO_ALL: &[u8] = b"*2\r\n$4\r\nINFO\r\n$3\r\nALL\r\n";

#[derive(Debug, Clone)]
pub struct RedisOptions {
    /// `host:port`, `tcp://host:port` or `unix:///path`.
    pub uri: String,
    pub services: Vec<String>,
    pub timeout: Duration,
}

impl Default for RedisOptions {
    fn default() -> Self {
        Self {
            uri: "localhost:6379".to_string(),
            services: vec!["redis".to_string()],
            timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// One `INFO ALL` reading.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RedisStats {
    pub memory_used: u64,
    pub memory_total: u64,
    pub key_hits: u64,
    pub key_misses: u64,
    pub uptime_seconds: u64,
    pub run_id: String,
}

impl Counters for RedisStats {
    fn wrapping_delta(&self, previous: &Self) -> Self {
        Self {
            key_hits: self.key_hits.wrapping_sub(previous.key_hits),
            key_misses: self.key_misses.wrapping_sub(previous.key_misses),
            ..self.clone()
        }
    }

    fn restarted_since(&self, previous: &Self) -> bool {
        self.uptime_seconds < previous.uptime_seconds
            || (!previous.run_id.is_empty() && self.run_id != previous.run_id)
    }
}

/// Parses the `key:value` lines of an INFO reply.
pub fn parse_info(info: &str) -> Result<RedisStats, CollectorError> {
    let mut stats = RedisStats::default();
    let mut seen = 0;

    for line in info.lines() {
        let Some((key, value)) = line.trim().split_once(':') else {
            continue;
        };
        match key {
            "used_memory" => {
                stats.memory_used = parse_u64(NAME, key, value)?;
                seen += 1;
            }
            "maxmemory" => stats.memory_total = parse_u64(NAME, key, value)?,
            "keyspace_hits" => {
                stats.key_hits = parse_u64(NAME, key, value)?;
                seen += 1;
            }
            "keyspace_misses" => {
                stats.key_misses = parse_u64(NAME, key, value)?;
                seen += 1;
            }
            "uptime_in_seconds" => stats.uptime_seconds = parse_u64(NAME, key, value)?,
            "run_id" => stats.run_id = value.trim().to_string(),
            _ => {}
        }
    }

    if seen < 3 {
        return Err(CollectorError::parse(
            NAME,
            "INFO reply lacks used_memory, keyspace_hits or keyspace_misses",
        ));
    }
    Ok(stats)
}

/// Decodes a RESP reply to `INFO`.
///
/// Returns `Ok(None)` while the bulk string is still incomplete.
pub fn decode_bulk_reply(buf: &[u8]) -> Result<Option<&str>, String> {
    let Some(header_end) = buf.windows(2).position(|w| w == b"\r\n") else {
        return Ok(None);
    };
    let header = std::str::from_utf8(&buf[..header_end]).map_err(|e| e.to_string())?;

    match header.as_bytes().first() {
        Some(b'$') => {
            let len: i64 = header[1..]
                .parse()
                .map_err(|_| format!("invalid bulk length '{}'", &header[1..]))?;
            if len < 0 {
                return Err("reply to INFO ALL is nil".to_string());
            }
            let start = header_end + 2;
            let end = start + len as usize;
            if buf.len() < end {
                return Ok(None);
            }
            std::str::from_utf8(&buf[start..end])
                .map(Some)
                .map_err(|e| format!("reply is not UTF-8: {}", e))
        }
        Some(b'-') => Err(format!("server error: {}", &header[1..])),
        _ => Err("reply to INFO ALL is not a bulk string".to_string()),
    }
}

/// Collector for a single Redis server.
pub struct Redis {
    endpoint: Endpoint,
    opts: RedisOptions,
    stats: Mutex<DeltaTracker<(), RedisStats>>,

    mem: GaugeVec,
    key: CounterVec,
}

impl Redis {
    /// Creates the collector after one successful `INFO ALL` round trip.
    pub async fn new(opts: RedisOptions) -> Result<Self, Error> {
        let endpoint = parse_uri(&opts.uri)?;
        let redis = Self {
            endpoint,
            stats: Mutex::new(DeltaTracker::new()),
            mem: GaugeVec::new(
                Opts::new("redis_mem_bytes", "Memory size in bytes."),
                &["type"],
            )?,
            key: CounterVec::new(
                Opts::new("redis_key_total", "Key hits or misses."),
                &["type"],
            )?,
            opts,
        };

        redis.fetch().await?;
        debug!("Connected to redis at {}", redis.endpoint);
        Ok(redis)
    }

    async fn fetch(&self) -> Result<RedisStats, CollectorError> {
        let reply = exchange(&self.endpoint, INFO_ALL, self.opts.timeout, |buf| {
            !matches!(decode_bulk_reply(buf), Ok(None))
        })
        .await
        .map_err(|e| CollectorError::backend(NAME, e))?;

        let info = decode_bulk_reply(&reply)
            .map_err(|e| CollectorError::fetch(NAME, e))?
            .ok_or_else(|| CollectorError::fetch(NAME, "connection closed mid-reply"))?;
        parse_info(info)
    }
}

#[async_trait]
impl SourceCollector for Redis {
    fn name(&self) -> &str {
        NAME
    }

    fn describe(&self) -> Vec<&Desc> {
        describe_all(&[&self.mem, &self.key])
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
            debug!("redis at {} restarted, reporting raw counters", self.endpoint);
        }

        self.mem.with_label_values(&["used"]).set(diff.memory_used as f64);
        self.mem.with_label_values(&["total"]).set(diff.memory_total as f64);
        self.key.with_label_values(&["hits"]).inc_by(diff.key_hits as f64);
        self.key.with_label_values(&["misses"]).inc_by(diff.key_misses as f64);

        debug!("collect duration for redis: {:?}", start.elapsed());
        Ok(collect_all(&[&self.mem, &self.key]))
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

    const INFO: &str = "# Server\r\nrun_id:abc\r\nuptime_in_seconds:100\r\n\r\n# Memory\r\nused_memory:1024\r\nmaxmemory:4096\r\n\r\n# Stats\r\nkeyspace_hits:10\r\nkeyspace_misses:3\r\n";

    fn bulk(body: &str) -> Vec<u8> {
        format!("${}\r\n{}\r\n", body.len(), body).into_bytes()
    }

    #[test]
    fn test_parse_info() {
        let stats = parse_info(INFO).unwrap();
        assert_eq!(
            stats,
            RedisStats {
                memory_used: 1024,
                memory_total: 4096,
                key_hits: 10,
                key_misses: 3,
                uptime_seconds: 100,
                run_id: "abc".into(),
            }
        );
    }

    #[test]
    fn test_parse_info_rejects_garbage() {
        assert!(parse_info("used_memory:lots\r\nkeyspace_hits:1\r\nkeyspace_misses:1\r\n").is_err());
        assert!(parse_info("# Server\r\nrun_id:abc\r\n").is_err());
    }

    #[test]
    fn test_decode_bulk_reply() {
        let reply = bulk("used_memory:1\r\n");
        assert_eq!(decode_bulk_reply(&reply).unwrap(), Some("used_memory:1\r\n"));
        assert_eq!(decode_bulk_reply(&reply[..6]).unwrap(), None);
        assert_eq!(decode_bulk_reply(b"$5").unwrap(), None);
        assert!(decode_bulk_reply(b"-ERR unknown command\r\n").is_err());
        assert!(decode_bulk_reply(b"+OK\r\n").is_err());
    }

    #[test]
    fn test_restart_detection() {
        let before = parse_info(INFO).unwrap();
        let mut after = before.clone();
        after.key_hits = 2;
        after.uptime_seconds = 5;
        assert!(after.restarted_since(&before));

        let mut other = before.clone();
        other.run_id = "def".into();
        other.uptime_seconds = 500;
        assert!(other.restarted_since(&before));

        let mut later = before.clone();
        later.uptime_seconds = 160;
        assert!(!later.restarted_since(&before));
    }

    async fn serve(replies: Vec<String>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            for reply in replies {
                let (mut sock, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; INFO_ALL.len()];
                sock.read_exact(&mut buf).await.unwrap();
                sock.write_all(&bulk(&reply)).await.unwrap();
            }
        });
        addr
    }

    fn hits(families: &[MetricFamily]) -> f64 {
        families
            .iter()
            .find(|f| f.get_name() == "redis_key_total")
            .and_then(|f| {
                f.get_metric()
                    .iter()
                    .find(|m| m.get_label()[0].get_value() == "hits")
            })
            .map(|m| m.get_counter().value())
            .unwrap()
    }

    #[tokio::test]
    async fn test_collect_counts_deltas() {
        let second = INFO.replace("keyspace_hits:10", "keyspace_hits:25");
        let addr = serve(vec![INFO.to_string(), INFO.to_string(), second]).await;

        let redis = Redis::new(RedisOptions {
            uri: addr,
            ..Default::default()
        })
        .await
        .unwrap();

        // The constructor probe does not seed the tracker.
        let first = redis.collect().await.unwrap();
        assert_eq!(hits(&first), 10.0);

        let second = redis.collect().await.unwrap();
        assert_eq!(hits(&second), 25.0);
    }

    #[tokio::test]
    async fn test_silent_backend_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; INFO_ALL.len()];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&bulk(INFO)).await.unwrap();
            drop(sock);

            // Accept but never answer.
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let redis = Redis::new(RedisOptions {
            uri: addr,
            timeout: Duration::from_millis(50),
            ..Default::default()
        })
        .await
        .unwrap();
        let err = redis.collect().await.unwrap_err();
        assert!(
            matches!(&err, CollectorError::Timeout { collector, .. } if collector == "redis"),
            "{:?}",
            err
        );
        assert!(redis.stats.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_new_fails_when_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = Redis::new(RedisOptions {
            uri: addr,
            ..Default::default()
        })
        .await;
        assert!(result.is_err());
    }
}

//! CLI arguments for svcgate-exporter.
//!
//! Every flag is optional so that values from the config file survive unless
//! overridden on the command line.

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Log level options for CLI parsing
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Configuration format options for output
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ConfigFormat {
    Yaml,
    Json,
    Toml,
}

/// Main CLI arguments structure
#[derive(Parser, Debug, Default)]
#[command(
    name = "svcgate-exporter",
    about = "Prometheus exporter for kernel, Redis, nginx, PHP-FPM and memcached metrics",
    long_about = "Prometheus exporter for kernel, Redis, nginx, PHP-FPM and memcached metrics.\n\n\
                  Backend collectors only run while the systemd services they depend on are \
                  active. Counters are exported as per-scrape deltas accumulated into \
                  Prometheus counters.",
    version,
    propagate_version = true
)]
pub struct Args {
    /// Config file (YAML/JSON/TOML)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Disable all config file loading
    #[arg(long)]
    pub no_config: bool,

    /// Address to listen on (e.g. :9900, 127.0.0.1:9900 or unix:///run/svcgate/exporter.sock)
    #[arg(long)]
    pub listen_address: Option<String>,

    /// Path under which to expose metrics
    #[arg(long)]
    pub telemetry_path: Option<String>,

    /// Path to TLS certificate file (PEM format)
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    /// Path to TLS private key file (PEM format)
    #[arg(long)]
    pub tls_key: Option<PathBuf>,

    /// Basic authentication as username:password
    #[arg(long)]
    pub basic_auth: Option<String>,

    /// Web configuration file enabling TLS or basic auth (exporter-toolkit format)
    #[arg(long)]
    pub web_config_file: Option<PathBuf>,

    /// Log level
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Connect timeout for backend calls, in milliseconds
    #[arg(long)]
    pub backend_timeout_ms: Option<u64>,

    /// procfs mount point read by the node collector
    #[arg(long)]
    pub proc_root: Option<PathBuf>,

    /// Redis URI (host:port, tcp://host:port or unix:///path); enables the redis collector
    #[arg(long)]
    pub redis_uri: Option<String>,

    /// nginx stub_status URI (http://host/path or unix:///sock:/path); enables the nginx collector
    #[arg(long)]
    pub nginx_uri: Option<String>,

    /// PHP-FPM FastCGI URI; enables the phpfpm collector
    #[arg(long)]
    pub phpfpm_uri: Option<String>,

    /// Script run by PHP-FPM that prints opcache status
    #[arg(long)]
    pub phpfpm_script: Option<String>,

    /// memcached URIs, comma-separated or repeated; Unix paths may be globs
    #[arg(long, value_delimiter = ',')]
    pub memcache_uri: Vec<String>,

    /// Print effective merged config and exit
    #[arg(long)]
    pub show_config: bool,

    /// Output format for --show-config
    #[arg(long, value_enum, default_value = "yaml")]
    pub config_format: ConfigFormat,

    /// Validate config and exit (return code 1 on error)
    #[arg(long)]
    pub check_config: bool,
}

impl Default for ConfigFormat {
    fn default() -> Self {
        Self::Yaml
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        let args = Args::parse_from([
            "svcgate-exporter",
            "--listen-address",
            ":9901",
            "--redis-uri",
            "unix:///run/redis.sock",
            "--memcache-uri",
            "127.0.0.1:11211,unix:///run/memcached/*.sock",
            "--log-level",
            "debug",
        ]);
        assert_eq!(args.listen_address.as_deref(), Some(":9901"));
        assert_eq!(args.redis_uri.as_deref(), Some("unix:///run/redis.sock"));
        assert_eq!(args.memcache_uri.len(), 2);
        assert_eq!(args.log_level, Some(LogLevel::Debug));
        assert!(!args.check_config);
    }
}

//! Configuration management for svcgate-exporter.
//!
//! This module handles loading, merging, and validating configuration from files
//! and CLI arguments. It supports YAML, JSON, and TOML formats. The optional
//! web configuration file follows the Prometheus exporter-toolkit layout.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::cli::{Args, ConfigFormat, LogLevel};
use crate::collectors::{MemcacheOptions, NginxOptions, NodeOptions, PhpFpmOptions, RedisOptions};
use crate::error::ConfigError;
use crate::server::{parse_basic_auth, ListenAddress};
use crate::transport::http::HttpTarget;
use crate::uri::{parse_uri, UriGlobs};

// Default configuration constants
pub const DEFAULT_LISTEN_ADDRESS: &str = ":9900";
pub const DEFAULT_TELEMETRY_PATH: &str = "/metrics";
pub const DEFAULT_BACKEND_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_PROC_ROOT: &str = "/proc";

/// Kernel collector settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Services required before the collector runs (default: none)
    pub services: Option<Vec<String>>,
}

/// Redis collector settings; presence of the section enables the collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub uri: String,
    pub services: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NginxConfig {
    pub uri: String,
    pub services: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhpFpmConfig {
    pub uri: String,
    pub script: String,
    pub services: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemcacheConfig {
    pub uris: Vec<String>,
    pub services: Option<Vec<String>>,
}

/// Enhanced configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Server configuration
    #[serde(alias = "listen-address")]
    pub listen_address: Option<String>,
    #[serde(alias = "telemetry-path")]
    pub telemetry_path: Option<String>,

    // TLS / authentication
    #[serde(alias = "tls-cert-path")]
    pub tls_cert_path: Option<String>,
    #[serde(alias = "tls-key-path")]
    pub tls_key_path: Option<String>,
    /// username:password
    #[serde(alias = "basic-auth")]
    pub basic_auth: Option<String>,
    /// exporter-toolkit web config; overrides the TLS and basic auth settings above
    #[serde(alias = "web-config-file")]
    pub web_config_file: Option<PathBuf>,

    // Logging
    pub log_level: Option<LogLevel>,

    // Backends
    #[serde(alias = "backend-timeout-ms")]
    pub backend_timeout_ms: Option<u64>,
    #[serde(alias = "proc-root")]
    pub proc_root: Option<PathBuf>,

    #[serde(default)]
    pub node: NodeConfig,
    pub redis: Option<RedisConfig>,
    pub nginx: Option<NginxConfig>,
    pub phpfpm: Option<PhpFpmConfig>,
    pub memcache: Option<MemcacheConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: Some(DEFAULT_LISTEN_ADDRESS.to_string()),
            telemetry_path: Some(DEFAULT_TELEMETRY_PATH.to_string()),
            tls_cert_path: None,
            tls_key_path: None,
            basic_auth: None,
            web_config_file: None,
            log_level: Some(LogLevel::Info),
            backend_timeout_ms: Some(DEFAULT_BACKEND_TIMEOUT_MS),
            proc_root: Some(PathBuf::from(DEFAULT_PROC_ROOT)),
            node: NodeConfig::default(),
            redis: None,
            nginx: None,
            phpfpm: None,
            memcache: None,
        }
    }
}

impl Config {
    pub fn listen_address(&self) -> &str {
        self.listen_address
            .as_deref()
            .unwrap_or(DEFAULT_LISTEN_ADDRESS)
    }

    pub fn telemetry_path(&self) -> &str {
        self.telemetry_path
            .as_deref()
            .unwrap_or(DEFAULT_TELEMETRY_PATH)
    }

    pub fn log_level(&self) -> LogLevel {
        self.log_level.unwrap_or(LogLevel::Info)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(
            self.backend_timeout_ms
                .unwrap_or(DEFAULT_BACKEND_TIMEOUT_MS),
        )
    }

    pub fn node_options(&self) -> NodeOptions {
        NodeOptions {
            proc_root: self
                .proc_root
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PROC_ROOT)),
            services: self.node.services.clone().unwrap_or_default(),
        }
    }

    pub fn redis_options(&self) -> Option<RedisOptions> {
        self.redis.as_ref().map(|c| {
            let defaults = RedisOptions::default();
            RedisOptions {
                uri: c.uri.clone(),
                services: c.services.clone().unwrap_or(defaults.services),
                timeout: self.backend_timeout(),
            }
        })
    }

    pub fn nginx_options(&self) -> Option<NginxOptions> {
        self.nginx.as_ref().map(|c| {
            let defaults = NginxOptions::default();
            NginxOptions {
                uri: c.uri.clone(),
                services: c.services.clone().unwrap_or(defaults.services),
                timeout: self.backend_timeout(),
            }
        })
    }

    pub fn phpfpm_options(&self) -> Option<PhpFpmOptions> {
        self.phpfpm.as_ref().map(|c| {
            let defaults = PhpFpmOptions::default();
            PhpFpmOptions {
                uri: c.uri.clone(),
                script: c.script.clone(),
                services: c.services.clone().unwrap_or(defaults.services),
                timeout: self.backend_timeout(),
            }
        })
    }

    pub fn memcache_options(&self) -> Option<MemcacheOptions> {
        self.memcache.as_ref().map(|c| {
            let defaults = MemcacheOptions::default();
            MemcacheOptions {
                uris: c.uris.clone(),
                services: c.services.clone().unwrap_or(defaults.services),
                timeout: self.backend_timeout(),
            }
        })
    }
}

/// TLS section of the web configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsServerConfig {
    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,
}

/// exporter-toolkit style web configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default)]
    pub tls_server_config: TlsServerConfig,
    #[serde(default)]
    pub basic_auth_users: BTreeMap<String, String>,
}

/// Effective TLS and basic auth settings of the listener.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebSettings {
    /// Certificate and key paths.
    pub tls: Option<(PathBuf, PathBuf)>,
    /// username → password
    pub users: BTreeMap<String, String>,
}

/// Reads a web configuration file.
pub fn load_web_config(path: &Path) -> Result<WebConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_yaml::from_str(&content)
        .map_err(|e| ConfigError::Invalid(format!("{}: {}", path.display(), e)))
}

/// Resolves TLS and basic auth either from the web config file or from the
/// individual settings.
pub fn resolve_web_settings(cfg: &Config) -> Result<WebSettings, ConfigError> {
    let non_empty = |s: &str| (!s.is_empty()).then(|| PathBuf::from(s));

    if let Some(path) = &cfg.web_config_file {
        let web = load_web_config(path)?;
        let cert = non_empty(web.tls_server_config.cert_file.as_str());
        let key = non_empty(web.tls_server_config.key_file.as_str());
        return Ok(WebSettings {
            tls: cert.zip(key),
            users: web.basic_auth_users,
        });
    }

    let cert = cfg.tls_cert_path.as_deref().and_then(non_empty);
    let key = cfg.tls_key_path.as_deref().and_then(non_empty);
    let mut users = BTreeMap::new();
    if let Some(raw) = &cfg.basic_auth {
        let (user, password) = parse_basic_auth(raw)?;
        users.insert(user, password);
    }
    Ok(WebSettings {
        tls: cert.zip(key),
        users,
    })
}

fn check_pem_file(kind: &str, path: &Path) -> Result<(), ConfigError> {
    match fs::metadata(path) {
        Ok(meta) if meta.len() == 0 => Err(ConfigError::Invalid(format!(
            "TLS {} file is empty: {}",
            kind,
            path.display()
        ))),
        Ok(_) => Ok(()),
        Err(source) => Err(ConfigError::Io {
            path: path.display().to_string(),
            source,
        }),
    }
}

/// Validate effective config (used by --check-config and at startup)
pub fn validate_effective_config(cfg: &Config) -> Result<(), ConfigError> {
    let listen = ListenAddress::parse(cfg.listen_address())?;

    if !cfg.telemetry_path().starts_with('/') {
        return Err(ConfigError::Invalid(format!(
            "telemetry_path must start with '/', got '{}'",
            cfg.telemetry_path()
        )));
    }

    if cfg.backend_timeout_ms == Some(0) {
        return Err(ConfigError::Invalid(
            "backend_timeout_ms must be greater than 0".into(),
        ));
    }

    // TLS validation
    if cfg.web_config_file.is_none() {
        match (cfg.tls_cert_path.as_deref(), cfg.tls_key_path.as_deref()) {
            (Some(_), None) => {
                return Err(ConfigError::Invalid(
                    "tls_cert_path is set but tls_key_path is not".into(),
                ));
            }
            (None, Some(_)) => {
                return Err(ConfigError::Invalid(
                    "tls_key_path is set but tls_cert_path is not".into(),
                ));
            }
            _ => {}
        }
    }

    let web = resolve_web_settings(cfg)?;
    if let Some((cert, key)) = &web.tls {
        if matches!(listen, ListenAddress::Unix(_)) {
            return Err(ConfigError::Invalid(
                "TLS is not supported on a Unix socket listener".into(),
            ));
        }
        check_pem_file("certificate", cert)?;
        check_pem_file("private key", key)?;
    }

    // Backend URIs
    if let Some(redis) = &cfg.redis {
        parse_uri(&redis.uri)?;
    }
    if let Some(nginx) = &cfg.nginx {
        HttpTarget::parse(&nginx.uri)?;
    }
    if let Some(phpfpm) = &cfg.phpfpm {
        parse_uri(&phpfpm.uri)?;
        if phpfpm.script.is_empty() {
            return Err(ConfigError::Invalid("phpfpm.script must be set".into()));
        }
    }
    if let Some(memcache) = &cfg.memcache {
        if memcache.uris.is_empty() {
            return Err(ConfigError::Invalid("memcache.uris must not be empty".into()));
        }
        UriGlobs::parse(&memcache.uris)?;
    }

    Ok(())
}

/// Resolves configuration from CLI args, config file, and defaults.
/// This enforces precedence: CLI (if provided) > config file > default.
pub fn resolve_config(args: &Args) -> Result<Config, ConfigError> {
    let mut config = if args.no_config {
        Config::default()
    } else {
        load_config(args.config.as_deref())?
    };

    if let Some(addr) = &args.listen_address {
        config.listen_address = Some(addr.clone());
    }
    if let Some(path) = &args.telemetry_path {
        config.telemetry_path = Some(path.clone());
    }

    // TLS configuration: CLI wins if provided
    if let Some(cert_path) = &args.tls_cert {
        config.tls_cert_path = Some(cert_path.to_string_lossy().to_string());
    }
    if let Some(key_path) = &args.tls_key {
        config.tls_key_path = Some(key_path.to_string_lossy().to_string());
    }
    if let Some(auth) = &args.basic_auth {
        config.basic_auth = Some(auth.clone());
    }
    if let Some(web) = &args.web_config_file {
        config.web_config_file = Some(web.clone());
    }

    if args.log_level.is_some() {
        config.log_level = args.log_level;
    }
    if args.backend_timeout_ms.is_some() {
        config.backend_timeout_ms = args.backend_timeout_ms;
    }
    if let Some(root) = &args.proc_root {
        config.proc_root = Some(root.clone());
    }

    // Backends: a URI flag enables the collector, keeping file-level services
    if let Some(uri) = &args.redis_uri {
        let services = config.redis.take().and_then(|c| c.services);
        config.redis = Some(RedisConfig {
            uri: uri.clone(),
            services,
        });
    }
    if let Some(uri) = &args.nginx_uri {
        let services = config.nginx.take().and_then(|c| c.services);
        config.nginx = Some(NginxConfig {
            uri: uri.clone(),
            services,
        });
    }
    if args.phpfpm_uri.is_some() || args.phpfpm_script.is_some() {
        let file = config.phpfpm.take();
        let defaults = PhpFpmOptions::default();
        config.phpfpm = Some(PhpFpmConfig {
            uri: args
                .phpfpm_uri
                .clone()
                .or_else(|| file.as_ref().map(|c| c.uri.clone()))
                .unwrap_or(defaults.uri),
            script: args
                .phpfpm_script
                .clone()
                .or_else(|| file.as_ref().map(|c| c.script.clone()))
                .unwrap_or(defaults.script),
            services: file.and_then(|c| c.services),
        });
    }
    if !args.memcache_uri.is_empty() {
        let services = config.memcache.take().and_then(|c| c.services);
        config.memcache = Some(MemcacheConfig {
            uris: args.memcache_uri.clone(),
            services,
        });
    }

    Ok(config)
}

/// Enhanced configuration loading with multiple format support
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = match path {
        Some(p) => {
            if !p.exists() {
                return Err(ConfigError::Io {
                    path: p.display().to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "config file not found",
                    ),
                });
            }
            p.to_path_buf()
        }
        None => {
            // Try default locations
            let defaults = [
                "/etc/svcgate-exporter/config.yaml",
                "/etc/svcgate-exporter/config.yml",
                "/etc/svcgate-exporter/config.json",
                "/etc/svcgate-exporter/config.toml",
            ];
            match defaults.iter().map(Path::new).find(|p| p.exists()) {
                Some(p) => p.to_path_buf(),
                None => return Ok(Config::default()),
            }
        }
    };

    let content = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let invalid = |e: String| ConfigError::Invalid(format!("{}: {}", path.display(), e));

    let file: Config = match path.extension().and_then(|s| s.to_str()) {
        Some("json") => serde_json::from_str(&content).map_err(|e| invalid(e.to_string()))?,
        Some("toml") => toml::from_str(&content).map_err(|e| invalid(e.to_string()))?,
        // Default to YAML
        _ => serde_yaml::from_str(&content).map_err(|e| invalid(e.to_string()))?,
    };
    info!("Loaded configuration from: {}", path.display());

    Ok(merge_defaults(file))
}

/// Fills settings a config file left out with their defaults.
fn merge_defaults(file: Config) -> Config {
    let defaults = Config::default();
    Config {
        listen_address: file.listen_address.or(defaults.listen_address),
        telemetry_path: file.telemetry_path.or(defaults.telemetry_path),
        log_level: file.log_level.or(defaults.log_level),
        backend_timeout_ms: file.backend_timeout_ms.or(defaults.backend_timeout_ms),
        proc_root: file.proc_root.or(defaults.proc_root),
        ..file
    }
}

/// Shows configuration in requested format
pub fn show_config(config: &Config, format: ConfigFormat) -> Result<String, ConfigError> {
    let output = match format {
        ConfigFormat::Json => {
            serde_json::to_string_pretty(config).map_err(|e| ConfigError::Invalid(e.to_string()))?
        }
        ConfigFormat::Toml => {
            toml::to_string_pretty(config).map_err(|e| ConfigError::Invalid(e.to_string()))?
        }
        ConfigFormat::Yaml => {
            serde_yaml::to_string(config).map_err(|e| ConfigError::Invalid(e.to_string()))?
        }
    };
    Ok(output)
}

//! svcgate-exporter
//!
//! Entry point: resolves configuration, builds the collectors, and serves
//! the metrics endpoint until SIGINT/SIGTERM.

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use std::time::Instant;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};

use svcgate_exporter::cli::{Args, LogLevel};
use svcgate_exporter::collectors::{Memcache, Nginx, Node, PhpFpm, Redis};
use svcgate_exporter::config::{
    resolve_config, resolve_web_settings, show_config, validate_effective_config, Config,
};
use svcgate_exporter::exporter::Exporter;
use svcgate_exporter::handlers::router;
use svcgate_exporter::server::{self, ListenAddress};
use svcgate_exporter::state::AppState;
use svcgate_exporter::systemd::SystemdStatus;

/// Initializes tracing logging subsystem with configured log level.
fn setup_logging(level: LogLevel) {
    let filter = match level {
        LogLevel::Off => LevelFilter::OFF,
        LogLevel::Error => LevelFilter::ERROR,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Trace => LevelFilter::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    info!("Logging initialized with level: {:?}", level);
}

/// Builds every configured collector. Any backend that cannot be reached or
/// is misconfigured aborts startup.
async fn build_exporter(config: &Config) -> anyhow::Result<Exporter> {
    let status = SystemdStatus::connect(config.backend_timeout())
        .await
        .context("connecting to systemd")?;
    let mut exporter = Exporter::new(Arc::new(status))?;

    exporter.register(Arc::new(
        Node::new(config.node_options()).context("node collector")?,
    ))?;

    if let Some(opts) = config.redis_options() {
        let redis = Redis::new(opts).await.context("redis collector")?;
        exporter.register(Arc::new(redis))?;
    }
    if let Some(opts) = config.nginx_options() {
        let nginx = Nginx::new(opts).await.context("nginx collector")?;
        exporter.register(Arc::new(nginx))?;
    }
    if let Some(opts) = config.phpfpm_options() {
        let phpfpm = PhpFpm::new(opts).await.context("phpfpm collector")?;
        exporter.register(Arc::new(phpfpm))?;
    }
    if let Some(opts) = config.memcache_options() {
        let memcache = Memcache::new(opts).await.context("memcache collector")?;
        exporter.register(Arc::new(memcache))?;
    }

    Ok(exporter)
}

/// Main application entry point.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = resolve_config(&args)?;

    if args.check_config {
        if let Err(e) = validate_effective_config(&config) {
            eprintln!("❌ Configuration invalid: {}", e);
            std::process::exit(1);
        }
        println!("✅ Configuration is valid");
        return Ok(());
    }

    if args.show_config {
        print!("{}", show_config(&config, args.config_format)?);
        return Ok(());
    }

    if let Err(e) = validate_effective_config(&config) {
        eprintln!("❌ Configuration invalid: {}", e);
        std::process::exit(1);
    }

    setup_logging(config.log_level());
    info!("Starting svcgate-exporter {}", env!("CARGO_PKG_VERSION"));

    let listen = ListenAddress::parse(config.listen_address())?;
    let web = resolve_web_settings(&config)?;
    if !web.users.is_empty() && web.tls.is_none() {
        warn!("Basic auth is enabled without TLS, credentials are sent in clear text");
    }

    let exporter = match build_exporter(&config).await {
        Ok(exporter) => Arc::new(exporter),
        Err(e) => {
            error!("Failed to initialize collectors: {:#}", e);
            std::process::exit(1);
        }
    };
    info!("Enabled collectors: {:?}", exporter.collectors());

    let state = Arc::new(AppState {
        exporter: Arc::clone(&exporter),
        config: Arc::new(config),
        start_time: Instant::now(),
    });
    let app = router(Arc::clone(&state), &web.users);

    let result = server::serve(app, &listen, web.tls.as_ref(), server::shutdown_signal()).await;
    exporter.close();
    result?;

    info!("Server shutdown complete");
    Ok(())
}

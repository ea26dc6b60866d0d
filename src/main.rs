//! `vshell-guard` - Protocol-aware TCP reverse proxy with VShell RAT defense
//!
//! A reverse proxy that:
//! - Listens on one or more TCP ports and classifies each connection as HTTP or raw TCP
//! - Applies per-listener processor rules (allow, drop, rewrite, file, proxy)
//! - Blocks VShell remote-access-trojan traffic by its wire signatures
//! - Gates admission by GeoIP region and local-time window

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vshell_guard::config::Config;
use vshell_guard::defense::DefenseEngine;
use vshell_guard::geoip::GeoIpFilter;
use vshell_guard::listener::{ProxyListener, ProxyState};
use vshell_guard::time_window::TimeWindowFilter;

/// vshell-guard - VShell-aware TCP reverse proxy
#[derive(Parser, Debug)]
#[command(name = "vshell-guard")]
#[command(version, long_version = long_version(), about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "config.toml",
        env = "VSHELL_GUARD_CONFIG"
    )]
    config: PathBuf,

    /// Log level override (debug, info, warn, error)
    #[arg(long, env = "VSHELL_GUARD_LOG_LEVEL")]
    log_level: Option<String>,

    /// Run configuration validation only (don't start the proxy)
    #[arg(long)]
    validate: bool,
}

fn long_version() -> &'static str {
    Box::leak(
        format!(
            "{}\nbuild time: {}\ngit commit: {}",
            env!("CARGO_PKG_VERSION"),
            option_env!("BUILD_TIME").unwrap_or("unknown"),
            option_env!("GIT_COMMIT").unwrap_or("unknown"),
        )
        .into_boxed_str(),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)?;

    let level = args
        .log_level
        .as_deref()
        .unwrap_or(config.global.log_level.as_str());
    init_logging(level);

    info!("starting vshell-guard v{}", env!("CARGO_PKG_VERSION"));
    info!("configuration file: {:?}", args.config);

    if args.validate {
        info!("configuration validation successful, exiting");
        return Ok(());
    }

    let config = Arc::new(config);

    // Process-wide admission filters and defense engine
    let geoip = Arc::new(GeoIpFilter::new(&config.global.geoip)?);
    let time_window = Arc::new(TimeWindowFilter::new(&config.global.time_window)?);
    let defense = Arc::new(DefenseEngine::new(config.global.defense.clone()));
    defense.log_signatures();
    if defense.enabled() {
        defense.spawn_janitor();
    }

    let state = Arc::new(ProxyState {
        config: config.clone(),
        defense: defense.clone(),
        geoip,
        time_window,
    });

    // Bind every listener up front; any bind failure aborts startup
    let mut bound = Vec::with_capacity(config.listeners.len());
    for index in 0..config.listeners.len() {
        bound.push(ProxyListener::bind(state.clone(), index).await?);
    }

    info!("all {} listeners bound", bound.len());
    for listener_cfg in &config.listeners {
        info!(
            "  [{}] :{} -> {} ({} http / {} tcp processors)",
            listener_cfg.name,
            listener_cfg.listen_port,
            listener_cfg.backend_addr,
            listener_cfg.http.processors.len(),
            listener_cfg.tcp.processors.len(),
        );
    }

    let mut handles = Vec::with_capacity(bound.len());
    for listener in bound {
        handles.push(tokio::spawn(listener.run()));
    }

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("received Ctrl+C, shutting down");
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal, shutting down");
        }
    }

    for handle in &handles {
        handle.abort();
    }

    let stats = defense.stats();
    info!(
        "defense stats: checked={} ws_blocked={} handshake_blocked={} payload_blocked={} rate_limited={}",
        stats.total_checked,
        stats.ws_blocked,
        stats.handshake_blocked,
        stats.payload_blocked,
        stats.rate_limited,
    );

    info!("vshell-guard shutdown complete");
    Ok(())
}

/// Initialize logging; RUST_LOG wins over the configured level
fn init_logging(level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false))
        .init();
}

/// Wait for an OS shutdown signal
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
            warn!("received SIGTERM");
        }
        Err(e) => {
            error!("failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    std::future::pending::<()>().await;
}

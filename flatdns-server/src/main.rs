// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  flatdns — recursive-forwarding DNS proxy with CNAME flattening
//
//  Front end:  tokio UDP + TCP listeners, one resolver shared across both
//  Admin API:  axum on the same runtime, read-only
//  Config:     standalone YAML + FLATDNS_-prefixed env overrides
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use flatdns_admin::server::{AdminServer, AdminState};
use flatdns_core::config::FlatDnsConfig;
use flatdns_proxy::worker::{self, SharedState};
use tokio::sync::broadcast;
use tracing::info;

/// Global shutdown flag, checked by the signal handler and the main loop.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser, Debug)]
#[command(name = "flatdns", version, about = "flatdns — CNAME-flattening DNS proxy")]
struct Cli {
    /// Path to a YAML configuration file. Falls back to `flatdns.yaml` or
    /// `/etc/flatdns/flatdns.yaml` when omitted.
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Log level (overridden by RUST_LOG if set).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "flatdns starting");

    let config_path = cli.config.as_ref().map(|p| p.to_string_lossy().into_owned());
    let config = FlatDnsConfig::load(config_path.as_deref())?;
    info!(
        node_id = %config.node_id,
        upstreams = config.upstreams.len(),
        strategy = ?config.selection_strategy,
        "configuration loaded"
    );

    let shared = SharedState::new(config)?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let worker_handles = worker::spawn(Arc::clone(&shared), &shutdown_tx);

    let admin_config = shared.config.admin.clone();
    let admin_handle = if admin_config.enabled {
        let admin_state = Arc::new(AdminState {
            health: Arc::clone(&shared.health),
            cache: Arc::clone(&shared.cache),
            metrics: Arc::clone(&shared.metrics),
        });
        let server = AdminServer::new(admin_config, admin_state);
        Some(tokio::spawn(async move {
            if let Err(e) = server.start().await {
                tracing::error!(error = %e, "admin API failed");
            }
        }))
    } else {
        info!("admin API disabled");
        None
    };

    info!(
        udp_addr = %shared.config.listen.udp_addr,
        tcp_addr = %shared.config.listen.tcp_addr,
        "flatdns is ready — serving queries"
    );

    setup_signal_handler();
    while !SHUTDOWN.load(Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    info!("shutdown signal received, stopping listeners");
    let _ = shutdown_tx.send(());
    for handle in worker_handles {
        let _ = handle.await;
    }
    if let Some(handle) = admin_handle {
        handle.abort();
    }

    info!("flatdns stopped");
    Ok(())
}

fn setup_signal_handler() {
    for sig in [libc::SIGTERM, libc::SIGINT] {
        unsafe {
            libc::signal(sig, signal_handler as libc::sighandler_t);
        }
    }
}

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

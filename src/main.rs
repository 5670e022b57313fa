use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use slms_gate::config::GateConfig;
use slms_gate::http::{AppState, HttpServer, IdentitySource};
use slms_gate::ratelimit::AdmissionController;

/// Per-client admission control for the short link management system.
#[derive(Debug, Parser)]
#[command(name = "slms-gate", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "SLMS_GATE_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overriding the configuration
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!("Starting slms-gate admission service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = GateConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.server.addr = addr;
    }
    info!(
        addr = %config.server.addr,
        entry_lifetime_secs = config.rate_limiting.entry_lifetime_secs,
        cleanup_interval_secs = config.rate_limiting.cleanup_interval_secs,
        "Configuration loaded"
    );

    let policies = config.rate_limiting.policy_set()?;
    for policy in policies.iter() {
        info!(
            policy = policy.name(),
            burst = policy.burst(),
            refill_interval_ms = policy.refill_interval().as_millis() as u64,
            "Policy registered"
        );
    }
    let identity = IdentitySource::from_config(config.server.identity_header.as_deref())?;

    let controller = Arc::new(AdmissionController::from_config(&config.rate_limiting));
    controller.start()?;
    info!("Admission controller initialized");

    let state = AppState::new(Arc::clone(&controller), policies, identity);
    let server = HttpServer::new(config.server.addr, state);

    // Serve until SIGINT/SIGTERM, then let in-flight requests finish
    let served = server.serve_with_shutdown(shutdown_signal()).await;

    controller.stop().await;
    served?;

    info!("slms-gate admission service stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Resolve on SIGINT or SIGTERM. A handler that cannot be installed is
/// logged and never fires.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let received = tokio::select! {
        _ = interrupt => "SIGINT",
        _ = terminate => "SIGTERM",
    };
    info!(signal = received, "Shutting down, draining in-flight requests");
}

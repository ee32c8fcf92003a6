//! Busmirror daemon
//!
//! Mirrors the objects of a bus population into the entity cache and keeps
//! them current until shut down.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use busmirror::{BrokerManager, DaemonConfig, EntityManager, TransportFactory, build_entities};
use busmirror_bus::{BusFixture, BusResult, Transport};

/// Object bus mirror daemon
#[derive(Parser, Debug)]
#[command(name = "busmirror")]
#[command(about = "Object bus mirror daemon", long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bus population to serve from the in-process bus (TOML); without it the
    /// system bus is mirrored
    #[arg(short, long)]
    fixture: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Print the cache as JSON after this many seconds and exit
    #[arg(long)]
    dump_after: Option<u64>,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("busmirror=info,busmirror_bus=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!("Starting busmirror v{}", env!("CARGO_PKG_VERSION"));

    let config = DaemonConfig::load(args.config.as_deref())?;

    let factory = transport_factory(args.fixture.as_deref())?;
    let manager = BrokerManager::new(config.manager_config(), factory);
    let default_connection = manager.connect()?;
    default_connection.start()?;

    let entities = build_entities(&config, default_connection.clone(), &manager)?;
    manager.start()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        match args.dump_after {
            Some(secs) => {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                dump(&entities);
            }
            None => shutdown_signal().await,
        }
    });

    info!("Shutting down...");
    manager.terminate();
    default_connection.stop();
    info!("Shutdown complete");
    Ok(())
}

/// In-process bus loaded from `fixture`, else the host's system bus
fn transport_factory(fixture: Option<&Path>) -> Result<TransportFactory> {
    if let Some(path) = fixture {
        info!("Loading bus fixture from: {}", path.display());
        let bus = BusFixture::load(path)?.into_bus();
        return Ok(Arc::new(move || -> BusResult<Arc<dyn Transport>> { Ok(bus.connect()) }));
    }
    system_bus_factory()
}

#[cfg(feature = "system-bus")]
fn system_bus_factory() -> Result<TransportFactory> {
    info!("Mirroring the system bus");
    Ok(Arc::new(|| -> BusResult<Arc<dyn Transport>> {
        Ok(Arc::new(busmirror_bus::SystemBusTransport::connect()?))
    }))
}

#[cfg(not(feature = "system-bus"))]
fn system_bus_factory() -> Result<TransportFactory> {
    anyhow::bail!("built without the system-bus feature; pass --fixture to serve a bus population")
}

fn dump(entities: &EntityManager) {
    if let Err(e) = entities.update() {
        warn!("Some entities failed to refresh: {}", e);
    }
    match serde_json::to_string_pretty(&entities.snapshot_json()) {
        Ok(snapshot) => println!("{}", snapshot),
        Err(e) => error!("Failed to render cache snapshot: {}", e),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }
}

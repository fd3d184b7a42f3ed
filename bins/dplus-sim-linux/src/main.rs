mod http;
mod platform;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dplus_core::{
    BusClient, BusConfigStorage, BusKind, ConfigStorage, GpioDriver, PlatformConfig, SimulatedGpio,
};
use dplus_service::{
    spawn_waveform, DebugGate, ServiceConfig, ServiceEvent, SimulatorService, SysfsGpio, Waveform,
};

#[derive(Parser, Debug)]
#[command(name = "dplus-sim")]
#[command(about = "D+ alternator signal simulator")]
#[command(version)]
struct Args {
    /// Bus the simulator's own service is published on
    #[arg(long, value_parser = ["system", "session"], default_value = "system")]
    bus: String,

    /// Keep GPIO writes in memory instead of driving hardware
    #[arg(long)]
    dry_run: bool,

    /// Allow debug features (also requires DPLUS_SIM_DEVELOPMENT)
    #[arg(long)]
    enable_debug: bool,

    /// Inject a sine waveform with the given amplitude (debug only)
    #[arg(long, value_name = "AMP", default_value_t = 0.0)]
    simulate_waveform: f64,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, env = "DPLUS_SIM_LOG", default_value = "info")]
    log_level: String,

    /// JSON file overriding platform service names and timings
    #[arg(long, value_name = "PATH")]
    platform_config: Option<PathBuf>,

    #[arg(long, default_value = "127.0.0.1:8080")]
    http_addr: SocketAddr,
}

fn load_platform(path: Option<&PathBuf>) -> anyhow::Result<PlatformConfig> {
    match path {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading platform config {}", path.display()))?;
            Ok(PlatformConfig::from_json(&json)?)
        }
        None => Ok(PlatformConfig::default()),
    }
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(e) => {
            tracing::warn!("SIGTERM handler unavailable: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.to_lowercase()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("D+ simulator starting...");

    let debug = DebugGate::from_env(args.enable_debug);
    if args.simulate_waveform != 0.0 {
        debug.check().context("--simulate-waveform")?;
    }

    let platform = load_platform(args.platform_config.as_ref())?;
    let own_bus = BusKind::parse(&args.bus).unwrap_or(BusKind::System);

    let bus: Arc<dyn BusClient> = Arc::new(platform::simulated_platform(&platform, own_bus));
    bus.list_names(BusKind::System)
        .context("system bus unreachable")?;

    let gpio: Arc<dyn GpioDriver> = if args.dry_run {
        tracing::info!("Dry run: GPIO writes stay in memory");
        Arc::new(SimulatedGpio::new())
    } else {
        Arc::new(SysfsGpio::new())
    };
    let storage: Arc<dyn ConfigStorage> = Arc::new(BusConfigStorage::new(
        bus.clone(),
        platform.settings_bus,
        &platform.settings_service,
    ));

    let config = ServiceConfig {
        own_bus,
        debug,
        ..ServiceConfig::from_platform(&platform)
    };
    let service = SimulatorService::new(config, platform, bus, gpio, storage)?;
    let handle = service.handle();

    let mut service_handle = tokio::spawn(async move {
        if let Err(e) = service.run().await {
            tracing::error!("Service error: {}", e);
        }
    });

    let http_api = handle.clone();
    let http_addr = args.http_addr;
    let http_handle = tokio::spawn(async move {
        if let Err(e) = http::start_http_server(http_addr, http_api).await {
            tracing::error!("HTTP server error: {}", e);
        }
    });

    let waveform_handle = (args.simulate_waveform != 0.0).then(|| {
        tracing::info!("Simulating waveform with amplitude {}", args.simulate_waveform);
        spawn_waveform(Waveform::new(args.simulate_waveform), handle.event_sender())
    });

    tracing::info!("D+ simulator ready, HTTP API on http://{}", http_addr);

    // Wait for shutdown signal
    let service_exited = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down...");
            false
        }
        _ = terminate_signal() => {
            tracing::info!("Received SIGTERM, shutting down...");
            false
        }
        _ = &mut service_handle => {
            tracing::info!("Service stopped");
            true
        }
    };

    if let Some(waveform) = waveform_handle {
        waveform.abort();
    }
    if !service_exited {
        let _ = handle.send(ServiceEvent::Shutdown).await;
        if tokio::time::timeout(Duration::from_secs(5), &mut service_handle)
            .await
            .is_err()
        {
            tracing::error!("Service did not stop in time");
        }
    }
    http_handle.abort();

    tracing::info!("Shutdown complete");
    Ok(())
}

//! # vega-server
//!
//! Daemon keeping BLE radiation detectors connected.
//!
//! This binary provides:
//! - One connection state machine per configured detector
//! - Telemetry logging (dose rate and count rate once per second)
//! - REST API for device management and connection control
//! - OpenAPI documentation via Swagger UI
//! - Structured logging to file and stdout
//!
//! ## Running
//!
//! ```bash
//! # Development (simulated detectors)
//! cargo run --package vega-server
//!
//! # Production (BlueZ)
//! cargo build --release --package vega-server --features bluetooth
//! VEGA_CONFIG=/etc/vega/config.toml ./vega-server
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};
use vega_core::{Connector, DeviceRegistry, JsonDeviceStore, VegaConfig};
use vega_server::api::create_router;
use vega_server::logging;
use vega_server::state::AppState;

type PowerEvents = mpsc::UnboundedReceiver<bool>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_file = std::env::var_os("VEGA_CONFIG").map(PathBuf::from);
    let config = VegaConfig::load(config_file.as_deref()).context("failed to load configuration")?;

    logging::init(config.server.production)?;
    info!(version = env!("CARGO_PKG_VERSION"), "Starting vega-server");

    let data_dir = config.data_dir()?;
    let store = Arc::new(JsonDeviceStore::in_dir(&data_dir));
    info!(path = %store.path().display(), "Using device store");

    let (connector, power_events) = connector().await?;
    let registry = Arc::new(DeviceRegistry::new(
        connector,
        store,
        config.pipeline.clone(),
    ));
    log_events(&registry);
    registry.load_from_store().await?;
    registry.start().await;
    if let Some(events) = power_events {
        tokio::spawn(watch_power(Arc::clone(&registry), events));
    }

    let addr: SocketAddr = config
        .server
        .bind_address
        .parse()
        .context("invalid bind address")?;
    let app = create_router(AppState::new(Arc::clone(&registry)));
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    registry.stop().await;
    registry.shutdown().await;
    Ok(())
}

#[cfg(feature = "bluetooth")]
async fn connector() -> anyhow::Result<(Arc<dyn Connector>, Option<PowerEvents>)> {
    let bluez = vega_core::BluezConnector::new().await?;
    let power = match bluez.power_changes().await {
        Ok(events) => Some(events),
        Err(e) => {
            warn!(error = %e, "adapter power changes unavailable");
            None
        }
    };
    Ok((Arc::new(bluez), power))
}

#[cfg(not(feature = "bluetooth"))]
#[allow(clippy::unused_async)]
async fn connector() -> anyhow::Result<(Arc<dyn Connector>, Option<PowerEvents>)> {
    warn!("built without the bluetooth feature, using simulated detectors");
    Ok((Arc::new(vega_core::MockConnector::new()), None))
}

fn log_events(registry: &DeviceRegistry) {
    registry.events().on_state(|device_id, state, status| {
        info!(%device_id, %state, status, "device state");
    });
    registry
        .events()
        .on_reading(|device_id, dose_rate, count_rate, timestamp_ms| {
            info!(%device_id, dose_rate, count_rate, timestamp_ms, "reading");
        });
}

async fn watch_power(registry: Arc<DeviceRegistry>, mut events: PowerEvents) {
    while let Some(powered) = events.recv().await {
        if powered {
            registry.force_reconnect_all().await;
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
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
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

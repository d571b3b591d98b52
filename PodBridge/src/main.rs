use std::sync::Arc;

use anyhow::Context;
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;
use tracing_subscriber::EnvFilter;

use podaccessory::AccessoryClient;
use podcontrol::{Bridge, SyncTiming};
use podroute::PulseAudioRoute;
use podsource::{BluezAudioSource, bring_up_receiver};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = podconfig::get_config();

    // ========== PHASE 1 : Bluetooth receiver ==========

    info!("📶 Preparing Bluetooth receiver...");
    bring_up_receiver(&config.bluetooth).await?;

    let source = Arc::new(
        BluezAudioSource::connect()
            .await
            .context("cannot reach BlueZ on the system bus")?,
    );
    let route = Arc::new(PulseAudioRoute::new(config.route.clone()));

    // ========== PHASE 2 : Accessory client ==========

    info!("🎛️ Starting accessory client...");
    let accessory = Arc::new(AccessoryClient::new(config.accessory.clone()));
    accessory
        .start()
        .await
        .context("accessory client failed to start")?;

    // ========== PHASE 3 : Bridge loops ==========

    let bridge = Bridge::spawn(
        source,
        route,
        accessory.clone(),
        SyncTiming::from_config(&config.sync),
    );

    info!("✅ PodBridge is ready!");

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
    }

    bridge.shutdown().await?;
    accessory.stop().await;
    info!("👋 PodBridge stopped");

    Ok(())
}

//! Bluetooth receiver bring-up.
//!
//! Makes the local adapter ready to accept a phone: starts the `bluetooth`
//! unit, turns on discoverability, sets the advertised alias, and registers
//! the default pairing agent. The agent registration is best-effort; the
//! rest is fatal to startup.

use podconfig::BluetoothConfig;
use tokio::process::Command;
use tracing::{info, warn};

use crate::errors::SourceError;

pub async fn bring_up_receiver(config: &BluetoothConfig) -> Result<(), SourceError> {
    if !config.setup_receiver {
        info!("Receiver bring-up disabled by configuration");
        return Ok(());
    }

    run(&["systemctl", "start", "bluetooth"]).await?;
    run(&["bluetoothctl", "discoverable", "on"]).await?;
    run(&["bluetoothctl", "system-alias", &config.alias]).await?;

    // Pairing agent registration fails on headless setups where another
    // agent already owns the requests; that is not fatal.
    for args in [
        ["bluetoothctl", "agent", "on"].as_slice(),
        ["bluetoothctl", "default-agent"].as_slice(),
    ] {
        if let Err(err) = run(args).await {
            warn!(error = %err, "Pairing agent registration failed");
        }
    }

    info!(alias = %config.alias, "Bluetooth receiver is discoverable");
    Ok(())
}

async fn run(args: &[&str]) -> Result<(), SourceError> {
    let status = Command::new(args[0])
        .args(&args[1..])
        .status()
        .await
        .map_err(|err| SourceError::Setup(format!("{}: {err}", args.join(" "))))?;

    if !status.success() {
        return Err(SourceError::Setup(format!(
            "{} exited with {status}",
            args.join(" ")
        )));
    }
    Ok(())
}

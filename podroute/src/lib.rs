//! # PodRoute
//!
//! Routes the active device's decoded A2DP stream to the physical output
//! sink by managing a PulseAudio `module-loopback` through `pactl`. The
//! coordinator drives this once per device transition through the
//! [`AudioRoute`] trait; at most one loopback is ever active.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use podconfig::RouteConfig;
use podsource::DeviceHandle;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Upper bound on any single pactl invocation.
const PACTL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("bluez source for {0} never appeared")]
    RouteUnavailable(String),
    #[error("pactl {0} failed: {1}")]
    CommandFailed(String, String),
    #[error("pactl {0} timed out")]
    CommandTimeout(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Audio signal-path binding, keyed by the active device.
#[async_trait]
pub trait AudioRoute: Send + Sync {
    /// Bind the device's stream to the configured sink. Idempotent for the
    /// device that is already bound; otherwise any prior loopback is torn
    /// down first.
    async fn bind(&self, device: &DeviceHandle) -> Result<(), RouteError>;

    /// Release any active binding. Trivially succeeds when none exists.
    async fn unbind(&self) -> Result<(), RouteError>;
}

/// [`AudioRoute`] backed by the PulseAudio CLI.
pub struct PulseAudioRoute {
    config: RouteConfig,
    bound: tokio::sync::Mutex<Option<String>>,
}

impl PulseAudioRoute {
    pub fn new(config: RouteConfig) -> Self {
        Self {
            config,
            bound: tokio::sync::Mutex::new(None),
        }
    }

    /// Poll `pactl list sources short` until one of the candidate bluez
    /// source names for the device shows up.
    async fn wait_for_source(&self, device: &DeviceHandle) -> Result<String, RouteError> {
        let candidates = candidate_source_names(&device.address);

        for attempt in 1..=self.config.source_wait_retries {
            let listing = pactl(&["list", "sources", "short"]).await?;
            if let Some(name) = candidates.iter().find(|name| listing.contains(name.as_str())) {
                info!(source = %name, "Found PulseAudio source");
                return Ok(name.clone());
            }
            debug!(
                device = %device,
                attempt,
                retries = self.config.source_wait_retries,
                "Bluez source not enumerated yet"
            );
            if attempt < self.config.source_wait_retries {
                sleep(self.config.source_wait_delay()).await;
            }
        }

        Err(RouteError::RouteUnavailable(device.address.clone()))
    }

    /// Unload every loopback module currently loaded.
    async fn unload_loopbacks(&self) -> Result<(), RouteError> {
        let listing = pactl(&["list", "modules", "short"]).await?;
        for id in loopback_module_ids(&listing) {
            debug!(module = %id, "Unloading module-loopback");
            if let Err(err) = pactl(&["unload-module", &id]).await {
                warn!(module = %id, error = %err, "Failed to unload loopback module");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AudioRoute for PulseAudioRoute {
    async fn bind(&self, device: &DeviceHandle) -> Result<(), RouteError> {
        let mut bound = self.bound.lock().await;
        if bound.as_deref() == Some(device.address.as_str()) {
            debug!(device = %device, "Route already bound");
            return Ok(());
        }

        let source = self.wait_for_source(device).await?;

        // At most one active route: drop whatever loopback exists before
        // loading the new one. From here until load-module succeeds there
        // is no route, so the binding record must not claim otherwise.
        self.unload_loopbacks().await?;
        *bound = None;

        pactl(&[
            "load-module",
            "module-loopback",
            &format!("source={source}"),
            &format!("sink={}", self.config.sink),
            &format!("latency_msec={}", self.config.latency_msec),
        ])
        .await?;

        info!(device = %device, source = %source, sink = %self.config.sink, "Audio route bound");
        *bound = Some(device.address.clone());
        Ok(())
    }

    async fn unbind(&self) -> Result<(), RouteError> {
        let mut bound = self.bound.lock().await;
        if bound.is_none() {
            return Ok(());
        }
        self.unload_loopbacks().await?;
        info!(device = %bound.as_deref().unwrap_or_default(), "Audio route released");
        *bound = None;
        Ok(())
    }
}

/// Run one pactl subcommand, returning its stdout.
async fn pactl(args: &[&str]) -> Result<String, RouteError> {
    let label = args.first().copied().unwrap_or_default().to_string();
    let output = timeout(
        PACTL_TIMEOUT,
        Command::new("pactl")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output(),
    )
    .await
    .map_err(|_| RouteError::CommandTimeout(label.clone()))??;

    if !output.status.success() {
        return Err(RouteError::CommandFailed(
            label,
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Source names PulseAudio may assign to an A2DP device, in probe order.
fn candidate_source_names(address: &str) -> [String; 2] {
    let mac = address.replace(':', "_");
    [
        format!("bluez_source.{mac}.a2dp_source"),
        format!("bluez_card.{mac}.a2dp_source"),
    ]
}

/// Extract the ids of loaded `module-loopback` entries from
/// `pactl list modules short` output (tab-separated: id, name, args).
fn loopback_module_ids(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter(|line| line.contains("module-loopback"))
        .filter_map(|line| {
            let id = line.split('\t').next()?.trim();
            id.chars().all(|c| c.is_ascii_digit()).then(|| id.to_string())
        })
        .filter(|id| !id.is_empty())
        .collect()
}

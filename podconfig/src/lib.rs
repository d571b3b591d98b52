//! # PodBridge Configuration
//!
//! Typed configuration for the bridge daemon, loaded from YAML:
//! - Embedded default configuration (`podbridge.yaml`)
//! - Optional override file in `$PODBRIDGE_CONFIG` or `~/.podbridge`
//! - Per-field defaults so partial files stay valid
//! - Thread-safe singleton access via [`get_config`]
//!
//! ## Usage
//!
//! ```no_run
//! let config = podconfig::get_config();
//! let interval = config.sync.connection_poll();
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Default configuration embedded at build time.
const DEFAULT_CONFIG: &str = include_str!("podbridge.yaml");

const ENV_CONFIG_DIR: &str = "PODBRIDGE_CONFIG";
const CONFIG_FILE_NAME: &str = "podbridge.yaml";

lazy_static! {
    static ref CONFIG: BridgeConfig =
        BridgeConfig::load().expect("Failed to load PodBridge configuration");
}

/// Returns the global configuration singleton.
///
/// The configuration is loaded once on first access; a malformed override
/// file aborts the process rather than silently running with defaults.
pub fn get_config() -> &'static BridgeConfig {
    &CONFIG
}

/// Top-level configuration block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub bluetooth: BluetoothConfig,
    #[serde(default)]
    pub route: RouteConfig,
    #[serde(default)]
    pub accessory: AccessoryConfig,
}

impl BridgeConfig {
    /// Load configuration from the override file if present, falling back to
    /// the embedded defaults.
    pub fn load() -> Result<Self> {
        let path = Self::config_file_path();
        match path {
            Some(ref file) if file.exists() => {
                info!(path = %file.display(), "Loading configuration override");
                Self::load_from_file(file)
            }
            _ => serde_yaml::from_str(DEFAULT_CONFIG).context("embedded default config is invalid"),
        }
    }

    /// Parse a specific configuration file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        serde_yaml::from_str(&text)
            .with_context(|| format!("cannot parse config file {}", path.display()))
    }

    /// Directory searched for the override file: `$PODBRIDGE_CONFIG`, else
    /// `~/.podbridge`.
    fn config_file_path() -> Option<PathBuf> {
        if let Ok(dir) = env::var(ENV_CONFIG_DIR) {
            return Some(PathBuf::from(dir).join(CONFIG_FILE_NAME));
        }
        dirs::home_dir().map(|home| home.join(".podbridge").join(CONFIG_FILE_NAME))
    }
}

/// Cadences of the connection/metadata synchronization loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "SyncConfig::default_connection_poll")]
    pub connection_poll_seconds: u64,
    #[serde(default = "SyncConfig::default_metadata_poll")]
    pub metadata_poll_seconds: u64,
}

impl SyncConfig {
    const fn default_connection_poll() -> u64 {
        5
    }

    const fn default_metadata_poll() -> u64 {
        2
    }

    pub fn connection_poll(&self) -> Duration {
        Duration::from_secs(self.connection_poll_seconds)
    }

    pub fn metadata_poll(&self) -> Duration {
        Duration::from_secs(self.metadata_poll_seconds)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            connection_poll_seconds: Self::default_connection_poll(),
            metadata_poll_seconds: Self::default_metadata_poll(),
        }
    }
}

/// Bluetooth receiver bring-up settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BluetoothConfig {
    /// Friendly name advertised to pairing phones.
    #[serde(default = "BluetoothConfig::default_alias")]
    pub alias: String,
    /// Run the `systemctl`/`bluetoothctl` bring-up sequence at startup.
    /// Disable when another service already manages the adapter.
    #[serde(default = "BluetoothConfig::default_setup_receiver")]
    pub setup_receiver: bool,
}

impl BluetoothConfig {
    fn default_alias() -> String {
        "Volvo-iPod-Bridge".to_string()
    }

    const fn default_setup_receiver() -> bool {
        true
    }
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            alias: Self::default_alias(),
            setup_receiver: Self::default_setup_receiver(),
        }
    }
}

/// PulseAudio loopback routing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    #[serde(default = "RouteConfig::default_sink")]
    pub sink: String,
    #[serde(default = "RouteConfig::default_latency")]
    pub latency_msec: u32,
    /// How many times to poll for the bluez source after a connection.
    #[serde(default = "RouteConfig::default_source_wait_retries")]
    pub source_wait_retries: u32,
    #[serde(default = "RouteConfig::default_source_wait_delay")]
    pub source_wait_delay_seconds: u64,
}

impl RouteConfig {
    fn default_sink() -> String {
        "alsa_output.platform-g_ipod_audio.0.analog-stereo".to_string()
    }

    const fn default_latency() -> u32 {
        50
    }

    const fn default_source_wait_retries() -> u32 {
        5
    }

    const fn default_source_wait_delay() -> u64 {
        2
    }

    pub fn source_wait_delay(&self) -> Duration {
        Duration::from_secs(self.source_wait_delay_seconds)
    }
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            sink: Self::default_sink(),
            latency_msec: Self::default_latency(),
            source_wait_retries: Self::default_source_wait_retries(),
            source_wait_delay_seconds: Self::default_source_wait_delay(),
        }
    }
}

/// Accessory client process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessoryConfig {
    #[serde(default = "AccessoryConfig::default_executable")]
    pub executable: PathBuf,
    #[serde(default = "AccessoryConfig::default_device_node")]
    pub device_node: PathBuf,
    #[serde(default = "AccessoryConfig::default_trace_path")]
    pub trace_path: PathBuf,
    /// Kernel modules required before the device node can appear.
    /// An empty list skips the lsmod/modprobe step entirely.
    #[serde(default = "AccessoryConfig::default_kernel_modules")]
    pub kernel_modules: Vec<String>,
    #[serde(default = "AccessoryConfig::default_node_wait_retries")]
    pub node_wait_retries: u32,
    #[serde(default = "AccessoryConfig::default_node_wait_delay")]
    pub node_wait_delay_seconds: u64,
    /// Grace period between closing the client's stdin and force-killing it.
    #[serde(default = "AccessoryConfig::default_stop_grace")]
    pub stop_grace_seconds: u64,
}

impl AccessoryConfig {
    fn default_executable() -> PathBuf {
        PathBuf::from("/opt/ipod/ipod")
    }

    fn default_device_node() -> PathBuf {
        PathBuf::from("/dev/iap0")
    }

    fn default_trace_path() -> PathBuf {
        PathBuf::from("/tmp/ipod.trace")
    }

    fn default_kernel_modules() -> Vec<String> {
        ["libcomposite", "g_ipod_audio", "g_ipod_hid", "g_ipod_gadget"]
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    const fn default_node_wait_retries() -> u32 {
        10
    }

    const fn default_node_wait_delay() -> u64 {
        1
    }

    const fn default_stop_grace() -> u64 {
        5
    }

    pub fn node_wait_delay(&self) -> Duration {
        Duration::from_secs(self.node_wait_delay_seconds)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_seconds)
    }
}

impl Default for AccessoryConfig {
    fn default() -> Self {
        Self {
            executable: Self::default_executable(),
            device_node: Self::default_device_node(),
            trace_path: Self::default_trace_path(),
            kernel_modules: Self::default_kernel_modules(),
            node_wait_retries: Self::default_node_wait_retries(),
            node_wait_delay_seconds: Self::default_node_wait_delay(),
            stop_grace_seconds: Self::default_stop_grace(),
        }
    }
}

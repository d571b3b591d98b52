//! # PodSource
//!
//! Audio-source side of the bridge: enumerating the connected Bluetooth
//! A2DP device, reading AVRCP now-playing metadata, and dispatching
//! transport commands, all through BlueZ on the system bus.
//!
//! The coordinator only ever talks to the [`AudioSource`] trait so that the
//! BlueZ backend can be swapped for an in-memory mock in tests.

use async_trait::async_trait;

pub mod bluez;
pub mod errors;
pub mod model;
pub mod setup;

pub use bluez::BluezAudioSource;
pub use errors::SourceError;
pub use model::{DeviceHandle, TrackMetadata, TransportCommand};
pub use setup::bring_up_receiver;

/// Query/command surface of the Bluetooth audio source.
#[async_trait]
pub trait AudioSource: Send + Sync {
    /// First device that is connected, services-resolved and advertises an
    /// A2DP audio service class. `Ok(None)` when no device qualifies; bus
    /// failures are reported distinctly as an error.
    async fn active_candidate(&self) -> Result<Option<DeviceHandle>, SourceError>;

    /// Best-effort now-playing snapshot for the given device. Transient
    /// read failures yield the previously known snapshot instead of an
    /// error so that a polling caller never has to special-case them.
    async fn fetch_track(&self, device: &DeviceHandle) -> TrackMetadata;

    /// Dispatch a transport command to the current media player.
    async fn send_command(&self, command: TransportCommand) -> Result<(), SourceError>;
}

//! BlueZ-backed [`AudioSource`] implementation.
//!
//! Everything goes through one shared system-bus connection:
//! `ObjectManager.GetManagedObjects` for device enumeration, and a typed
//! `org.bluez.MediaPlayer1` proxy for metadata and transport commands. The
//! player proxy is cached per device and dropped as soon as a call reports
//! it gone, so the next poll re-discovers it.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use zbus::Connection;
use zbus::fdo::ObjectManagerProxy;
use zbus::names::OwnedInterfaceName;
use zbus::proxy;
use zbus::zvariant::{OwnedObjectPath, OwnedValue};

use crate::errors::SourceError;
use crate::model::{DeviceHandle, TrackMetadata, TransportCommand};
use crate::AudioSource;

const BLUEZ_SERVICE: &str = "org.bluez";
const DEVICE_IFACE: &str = "org.bluez.Device1";
const PLAYER_IFACE: &str = "org.bluez.MediaPlayer1";

/// A2DP Audio Sink service class.
const A2DP_SINK_UUID: &str = "0000110b-0000-1000-8000-00805f9b34fb";
/// Advanced Audio Distribution profile.
const A2DP_PROFILE_UUID: &str = "0000110d-0000-1000-8000-00805f9b34fb";

/// Upper bound on any single bus round-trip.
const BUS_TIMEOUT: Duration = Duration::from_secs(5);

type InterfaceProps = HashMap<String, OwnedValue>;
type ObjectInterfaces = HashMap<OwnedInterfaceName, InterfaceProps>;

#[proxy(interface = "org.bluez.MediaPlayer1", default_service = "org.bluez")]
trait MediaPlayer {
    fn play(&self) -> zbus::Result<()>;
    fn pause(&self) -> zbus::Result<()>;
    fn next(&self) -> zbus::Result<()>;
    fn previous(&self) -> zbus::Result<()>;
    fn stop(&self) -> zbus::Result<()>;

    #[zbus(property)]
    fn track(&self) -> zbus::Result<HashMap<String, OwnedValue>>;
}

/// Per-device player cache plus the last snapshot successfully read.
#[derive(Default)]
struct PlayerCache {
    device_path: Option<String>,
    player: Option<MediaPlayerProxy<'static>>,
    last_track: TrackMetadata,
}

/// [`AudioSource`] backed by BlueZ on the system bus.
pub struct BluezAudioSource {
    conn: Connection,
    cache: tokio::sync::Mutex<PlayerCache>,
}

impl BluezAudioSource {
    /// Connect to the system bus.
    pub async fn connect() -> Result<Self, SourceError> {
        let conn = Connection::system().await?;
        info!("Connected to the system bus for BlueZ");
        Ok(Self {
            conn,
            cache: tokio::sync::Mutex::new(PlayerCache::default()),
        })
    }

    async fn managed_objects(
        &self,
    ) -> Result<HashMap<OwnedObjectPath, ObjectInterfaces>, SourceError> {
        let manager = ObjectManagerProxy::builder(&self.conn)
            .destination(BLUEZ_SERVICE)?
            .path("/")?
            .build()
            .await?;
        let objects = timeout(BUS_TIMEOUT, manager.get_managed_objects())
            .await
            .map_err(|_| SourceError::Timeout(BUS_TIMEOUT))?
            .map_err(zbus::Error::from)?;
        Ok(objects)
    }

    /// Resolve (and cache) the MediaPlayer1 object living under the device.
    async fn player_for(
        &self,
        cache: &mut PlayerCache,
        device: &DeviceHandle,
    ) -> Result<MediaPlayerProxy<'static>, SourceError> {
        if cache.device_path.as_deref() == Some(device.path.as_str()) {
            if let Some(player) = &cache.player {
                return Ok(player.clone());
            }
        } else {
            // Different device: whatever we cached is stale.
            cache.player = None;
            cache.device_path = Some(device.path.clone());
        }

        let objects = self.managed_objects().await?;
        let prefix = format!("{}/player", device.path);
        let player_path = objects
            .iter()
            .find(|(path, interfaces)| {
                path.as_str().starts_with(&prefix) && iface_props(interfaces, PLAYER_IFACE).is_some()
            })
            .map(|(path, _)| path.as_str().to_owned())
            .ok_or(SourceError::NoActiveTarget)?;

        debug!(device = %device, player = %player_path, "Found media player");
        let player = MediaPlayerProxy::builder(&self.conn)
            .path(player_path)?
            .build()
            .await?;
        cache.player = Some(player.clone());
        Ok(player)
    }
}

#[async_trait]
impl AudioSource for BluezAudioSource {
    async fn active_candidate(&self) -> Result<Option<DeviceHandle>, SourceError> {
        let objects = self.managed_objects().await?;

        for (path, interfaces) in &objects {
            let Some(props) = iface_props(interfaces, DEVICE_IFACE) else {
                continue;
            };
            if !bool_prop(props, "Connected") || !bool_prop(props, "ServicesResolved") {
                continue;
            }
            if !is_audio_device(&strv_prop(props, "UUIDs")) {
                continue;
            }
            let address = text_prop(props, "Address");
            if address.is_empty() {
                continue;
            }
            debug!(
                address = %address,
                alias = %text_prop(props, "Alias"),
                "A2DP candidate device"
            );
            return Ok(Some(DeviceHandle {
                address,
                path: path.as_str().to_owned(),
            }));
        }

        Ok(None)
    }

    async fn fetch_track(&self, device: &DeviceHandle) -> TrackMetadata {
        let mut cache = self.cache.lock().await;

        let player = match self.player_for(&mut cache, device).await {
            Ok(player) => player,
            Err(SourceError::NoActiveTarget) => {
                debug!(device = %device, "No media player yet, keeping last snapshot");
                return cache.last_track.clone();
            }
            Err(err) => {
                warn!(device = %device, error = %err, "Player lookup failed, keeping last snapshot");
                return cache.last_track.clone();
            }
        };

        match timeout(BUS_TIMEOUT, player.track()).await {
            Ok(Ok(track)) => {
                let snapshot = snapshot_from_track(&track);
                if snapshot != cache.last_track {
                    info!(
                        title = %snapshot.title,
                        artist = %snapshot.artist,
                        duration_ms = snapshot.duration_ms,
                        "Track updated"
                    );
                    cache.last_track = snapshot.clone();
                }
                snapshot
            }
            Ok(Err(err)) => {
                // The player object tends to vanish with its device; drop the
                // cached proxy so the next poll re-discovers it.
                warn!(device = %device, error = %err, "Track read failed, keeping last snapshot");
                cache.player = None;
                cache.last_track.clone()
            }
            Err(_) => {
                warn!(device = %device, "Track read timed out, keeping last snapshot");
                cache.last_track.clone()
            }
        }
    }

    async fn send_command(&self, command: TransportCommand) -> Result<(), SourceError> {
        let player = {
            let cache = self.cache.lock().await;
            cache.player.clone().ok_or(SourceError::NoActiveTarget)?
        };

        info!(command = %command, "Sending transport command");
        let call = async {
            match command {
                TransportCommand::Play => player.play().await,
                TransportCommand::Pause => player.pause().await,
                TransportCommand::Next => player.next().await,
                TransportCommand::Previous => player.previous().await,
                TransportCommand::Stop => player.stop().await,
            }
        };

        match timeout(BUS_TIMEOUT, call).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                let mut cache = self.cache.lock().await;
                cache.player = None;
                Err(map_command_error(command, err))
            }
            Err(_) => Err(SourceError::Timeout(BUS_TIMEOUT)),
        }
    }
}

fn map_command_error(command: TransportCommand, err: zbus::Error) -> SourceError {
    if let zbus::Error::MethodError(ref name, _, _) = err {
        let name = name.as_str();
        if name.ends_with("NotSupported") {
            return SourceError::Unsupported(command.as_str());
        }
        if name.ends_with("UnknownObject") || name.ends_with("ServiceUnknown") {
            return SourceError::NoActiveTarget;
        }
    }
    SourceError::Bus(err)
}

fn iface_props<'a>(interfaces: &'a ObjectInterfaces, name: &str) -> Option<&'a InterfaceProps> {
    interfaces
        .iter()
        .find(|(iface, _)| iface.as_str() == name)
        .map(|(_, props)| props)
}

fn bool_prop(props: &InterfaceProps, key: &str) -> bool {
    props
        .get(key)
        .and_then(|value| bool::try_from(value.clone()).ok())
        .unwrap_or(false)
}

fn text_prop(props: &InterfaceProps, key: &str) -> String {
    props
        .get(key)
        .and_then(|value| String::try_from(value.clone()).ok())
        .unwrap_or_default()
}

fn strv_prop(props: &InterfaceProps, key: &str) -> Vec<String> {
    props
        .get(key)
        .and_then(|value| Vec::<String>::try_from(value.clone()).ok())
        .unwrap_or_default()
}

/// AVRCP reports `Duration` as uint32 milliseconds, but some stacks use
/// wider integer types.
fn duration_prop(props: &InterfaceProps, key: &str) -> u64 {
    let Some(value) = props.get(key) else {
        return 0;
    };
    if let Ok(ms) = u32::try_from(value.clone()) {
        return u64::from(ms);
    }
    if let Ok(ms) = u64::try_from(value.clone()) {
        return ms;
    }
    if let Ok(ms) = i64::try_from(value.clone()) {
        return ms.max(0) as u64;
    }
    0
}

/// Build a complete snapshot from the AVRCP `Track` property map.
fn snapshot_from_track(track: &HashMap<String, OwnedValue>) -> TrackMetadata {
    TrackMetadata {
        title: text_prop(track, "Title"),
        artist: text_prop(track, "Artist"),
        album: text_prop(track, "Album"),
        duration_ms: duration_prop(track, "Duration"),
    }
}

fn is_audio_device(uuids: &[String]) -> bool {
    uuids.iter().any(|uuid| {
        uuid.eq_ignore_ascii_case(A2DP_SINK_UUID) || uuid.eq_ignore_ascii_case(A2DP_PROFILE_UUID)
    })
}

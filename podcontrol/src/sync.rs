//! State synchronization loop.
//!
//! One task owns the whole bridge state. It polls the source on two
//! cadences, a slow one for device connections and a faster one for
//! now-playing metadata, and reacts to changes by rebinding the audio
//! route and pushing metadata bursts to the accessory. Nothing else
//! mutates the active device or the last-sent memo, so there is no
//! shared-state locking here at all.

use std::sync::Arc;

use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use podaccessory::AccessoryLink;
use podroute::AudioRoute;
use podsource::{AudioSource, DeviceHandle, TrackMetadata};

use crate::bridge::SyncTiming;
use crate::burst::metadata_lines;

pub(crate) struct SyncState {
    source: Arc<dyn AudioSource>,
    route: Arc<dyn AudioRoute>,
    link: Arc<dyn AccessoryLink>,
    /// Device currently adopted as the bridge target, if any.
    active: Option<DeviceHandle>,
    /// Last snapshot actually written to the accessory. `None` until the
    /// first successful burst after an adoption.
    last_sent: Option<TrackMetadata>,
}

impl SyncState {
    pub(crate) fn new(
        source: Arc<dyn AudioSource>,
        route: Arc<dyn AudioRoute>,
        link: Arc<dyn AccessoryLink>,
    ) -> Self {
        Self {
            source,
            route,
            link,
            active: None,
            last_sent: None,
        }
    }

    /// Slow-cadence tick: reconcile the active device with what the
    /// source currently reports.
    async fn handle_connection_tick(&mut self) {
        match self.source.active_candidate().await {
            Ok(Some(device)) => {
                if self.active.as_ref() == Some(&device) {
                    return;
                }
                // Route first, adopt second: if the loopback cannot be
                // established the device stays unadopted and the next
                // tick retries from scratch.
                match self.route.bind(&device).await {
                    Ok(()) => {
                        info!(device = %device, "Adopted active device");
                        self.active = Some(device);
                        self.last_sent = None;
                    }
                    Err(error) => {
                        warn!(device = %device, %error, "Audio route bind failed, not adopting device");
                    }
                }
            }
            Ok(None) => {
                if self.active.is_some() {
                    self.handle_device_loss().await;
                }
            }
            Err(error) => {
                // Transient bus trouble is not a disconnection. Keep the
                // current device and route until the source says otherwise.
                warn!(%error, "Connection poll failed, keeping current state");
            }
        }
    }

    async fn handle_device_loss(&mut self) {
        if let Some(device) = self.active.take() {
            info!(device = %device, "Active device lost");
        }
        // Clear the accessory display exactly once, and only if it is
        // showing something.
        if self.last_sent.as_ref().is_some_and(|sent| !sent.is_blank()) {
            self.push_snapshot(&TrackMetadata::default()).await;
        }
        self.last_sent = None;
        if let Err(error) = self.route.unbind().await {
            warn!(%error, "Audio route release failed");
        }
    }

    /// Fast-cadence tick: fetch the now-playing snapshot and forward it
    /// when it differs from what the accessory last saw.
    async fn handle_metadata_tick(&mut self) {
        let Some(device) = self.active.clone() else {
            return;
        };
        let snapshot = self.source.fetch_track(&device).await;
        let differs = self.last_sent.as_ref() != Some(&snapshot);
        if differs && !snapshot.is_blank() {
            debug!(title = %snapshot.title, artist = %snapshot.artist, "Track changed");
            self.push_snapshot(&snapshot).await;
        } else if snapshot.is_blank()
            && self.last_sent.as_ref().is_some_and(|sent| !sent.is_blank())
        {
            debug!("Playback stopped, clearing accessory display");
            self.push_snapshot(&snapshot).await;
        }
    }

    /// Writes one metadata burst. The last-sent memo is updated only on
    /// success so a failed write is retried on the next tick.
    async fn push_snapshot(&mut self, snapshot: &TrackMetadata) {
        match self.link.write_lines(&metadata_lines(snapshot)).await {
            Ok(()) => self.last_sent = Some(snapshot.clone()),
            Err(error) => warn!(%error, "Metadata push failed"),
        }
    }
}

pub(crate) async fn run_sync(
    mut state: SyncState,
    timing: SyncTiming,
    cancel: CancellationToken,
) {
    info!("Sync loop started");
    let mut next_connection = Instant::now();
    let mut next_metadata = Instant::now();
    loop {
        let wake = next_connection.min(next_metadata);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = time::sleep_until(wake) => {}
        }
        let now = Instant::now();
        if now >= next_connection {
            state.handle_connection_tick().await;
            next_connection = now + timing.connection_poll;
        }
        if now >= next_metadata {
            state.handle_metadata_tick().await;
            next_metadata = now + timing.metadata_poll;
        }
    }
    info!("Sync loop stopped");
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use podaccessory::AccessoryError;
    use podroute::RouteError;
    use podsource::{SourceError, TransportCommand};

    use super::*;

    fn device(address: &str) -> DeviceHandle {
        DeviceHandle {
            address: address.to_string(),
            path: format!("/org/bluez/hci0/dev_{}", address.replace(':', "_")),
        }
    }

    fn track(title: &str) -> TrackMetadata {
        TrackMetadata {
            title: title.to_string(),
            artist: "Band X".to_string(),
            album: String::new(),
            duration_ms: 180_000,
        }
    }

    #[derive(Default)]
    struct ScriptedSource {
        candidates: Mutex<VecDeque<Result<Option<DeviceHandle>, SourceError>>>,
        tracks: Mutex<VecDeque<TrackMetadata>>,
        commands: Mutex<Vec<TransportCommand>>,
    }

    #[async_trait]
    impl AudioSource for ScriptedSource {
        async fn active_candidate(&self) -> Result<Option<DeviceHandle>, SourceError> {
            self.candidates
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(None))
        }

        async fn fetch_track(&self, _device: &DeviceHandle) -> TrackMetadata {
            self.tracks.lock().unwrap().pop_front().unwrap_or_default()
        }

        async fn send_command(&self, command: TransportCommand) -> Result<(), SourceError> {
            self.commands.lock().unwrap().push(command);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingRoute {
        binds: Mutex<Vec<String>>,
        unbinds: AtomicUsize,
        bind_failures: Mutex<VecDeque<()>>,
    }

    #[async_trait]
    impl AudioRoute for RecordingRoute {
        async fn bind(&self, device: &DeviceHandle) -> Result<(), RouteError> {
            if self.bind_failures.lock().unwrap().pop_front().is_some() {
                return Err(RouteError::RouteUnavailable(device.address.clone()));
            }
            self.binds.lock().unwrap().push(device.address.clone());
            Ok(())
        }

        async fn unbind(&self) -> Result<(), RouteError> {
            self.unbinds.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingLink {
        bursts: Mutex<Vec<Vec<String>>>,
        write_failures: Mutex<VecDeque<()>>,
    }

    #[async_trait]
    impl AccessoryLink for RecordingLink {
        async fn write_lines(&self, lines: &[String]) -> Result<(), AccessoryError> {
            if self.write_failures.lock().unwrap().pop_front().is_some() {
                return Err(AccessoryError::NotRunning);
            }
            self.bursts.lock().unwrap().push(lines.to_vec());
            Ok(())
        }

        async fn read_line(&self) -> Option<String> {
            None
        }

        fn is_running(&self) -> bool {
            true
        }
    }

    struct Fixture {
        source: Arc<ScriptedSource>,
        route: Arc<RecordingRoute>,
        link: Arc<RecordingLink>,
        state: SyncState,
    }

    fn fixture() -> Fixture {
        let source = Arc::new(ScriptedSource::default());
        let route = Arc::new(RecordingRoute::default());
        let link = Arc::new(RecordingLink::default());
        let state = SyncState::new(source.clone(), route.clone(), link.clone());
        Fixture {
            source,
            route,
            link,
            state,
        }
    }

    #[tokio::test]
    async fn device_is_adopted_and_bound_once() {
        let mut fx = fixture();
        {
            let mut candidates = fx.source.candidates.lock().unwrap();
            candidates.push_back(Ok(Some(device("AA:BB:CC:DD:EE:FF"))));
            candidates.push_back(Ok(Some(device("AA:BB:CC:DD:EE:FF"))));
        }

        fx.state.handle_connection_tick().await;
        fx.state.handle_connection_tick().await;

        assert_eq!(
            fx.state.active.as_ref().map(|d| d.address.as_str()),
            Some("AA:BB:CC:DD:EE:FF")
        );
        assert_eq!(*fx.route.binds.lock().unwrap(), vec!["AA:BB:CC:DD:EE:FF"]);
    }

    #[tokio::test]
    async fn bind_failure_leaves_device_unadopted_until_retry() {
        let mut fx = fixture();
        {
            let mut candidates = fx.source.candidates.lock().unwrap();
            candidates.push_back(Ok(Some(device("AA:BB:CC:DD:EE:FF"))));
            candidates.push_back(Ok(Some(device("AA:BB:CC:DD:EE:FF"))));
        }
        fx.route.bind_failures.lock().unwrap().push_back(());

        fx.state.handle_connection_tick().await;
        assert!(fx.state.active.is_none());

        fx.state.handle_connection_tick().await;
        assert!(fx.state.active.is_some());
        assert_eq!(fx.route.binds.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn metadata_is_deduplicated_against_last_sent() {
        let mut fx = fixture();
        fx.state.active = Some(device("AA:BB:CC:DD:EE:FF"));
        {
            let mut tracks = fx.source.tracks.lock().unwrap();
            tracks.push_back(track("Song A"));
            tracks.push_back(track("Song A"));
            tracks.push_back(track("Song B"));
        }

        fx.state.handle_metadata_tick().await;
        fx.state.handle_metadata_tick().await;
        fx.state.handle_metadata_tick().await;

        let bursts = fx.link.bursts.lock().unwrap();
        assert_eq!(bursts.len(), 2);
        assert_eq!(bursts[0][0], "TITLE=Song A");
        assert_eq!(bursts[1][0], "TITLE=Song B");
    }

    #[tokio::test]
    async fn blank_snapshot_clears_display_exactly_once() {
        let mut fx = fixture();
        fx.state.active = Some(device("AA:BB:CC:DD:EE:FF"));
        {
            let mut tracks = fx.source.tracks.lock().unwrap();
            tracks.push_back(track("Song A"));
            tracks.push_back(TrackMetadata::default());
            tracks.push_back(TrackMetadata::default());
        }

        fx.state.handle_metadata_tick().await;
        fx.state.handle_metadata_tick().await;
        fx.state.handle_metadata_tick().await;

        let bursts = fx.link.bursts.lock().unwrap();
        assert_eq!(bursts.len(), 2);
        assert_eq!(bursts[1], vec!["DURATION=0".to_string()]);
    }

    #[tokio::test]
    async fn initial_blank_snapshot_is_not_sent() {
        let mut fx = fixture();
        fx.state.active = Some(device("AA:BB:CC:DD:EE:FF"));
        fx.source
            .tracks
            .lock()
            .unwrap()
            .push_back(TrackMetadata::default());

        fx.state.handle_metadata_tick().await;

        assert!(fx.link.bursts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_push_is_retried_on_the_next_tick() {
        let mut fx = fixture();
        fx.state.active = Some(device("AA:BB:CC:DD:EE:FF"));
        {
            let mut tracks = fx.source.tracks.lock().unwrap();
            tracks.push_back(track("Song A"));
            tracks.push_back(track("Song A"));
        }
        fx.link.write_failures.lock().unwrap().push_back(());

        fx.state.handle_metadata_tick().await;
        assert!(fx.state.last_sent.is_none());

        fx.state.handle_metadata_tick().await;
        assert_eq!(fx.link.bursts.lock().unwrap().len(), 1);
        assert_eq!(fx.state.last_sent, Some(track("Song A")));
    }

    #[tokio::test]
    async fn device_loss_clears_display_and_releases_route() {
        let mut fx = fixture();
        {
            let mut candidates = fx.source.candidates.lock().unwrap();
            candidates.push_back(Ok(Some(device("AA:BB:CC:DD:EE:FF"))));
            candidates.push_back(Ok(None));
        }
        fx.source.tracks.lock().unwrap().push_back(track("Song A"));

        fx.state.handle_connection_tick().await;
        fx.state.handle_metadata_tick().await;
        fx.state.handle_connection_tick().await;

        assert!(fx.state.active.is_none());
        assert!(fx.state.last_sent.is_none());
        assert_eq!(fx.route.unbinds.load(Ordering::SeqCst), 1);
        let bursts = fx.link.bursts.lock().unwrap();
        assert_eq!(bursts.len(), 2);
        assert_eq!(bursts[1], vec!["DURATION=0".to_string()]);
    }

    #[tokio::test]
    async fn device_loss_with_blank_display_skips_the_clear_burst() {
        let mut fx = fixture();
        {
            let mut candidates = fx.source.candidates.lock().unwrap();
            candidates.push_back(Ok(Some(device("AA:BB:CC:DD:EE:FF"))));
            candidates.push_back(Ok(None));
        }

        fx.state.handle_connection_tick().await;
        fx.state.handle_connection_tick().await;

        assert!(fx.link.bursts.lock().unwrap().is_empty());
        assert_eq!(fx.route.unbinds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn poll_error_keeps_the_current_device() {
        let mut fx = fixture();
        {
            let mut candidates = fx.source.candidates.lock().unwrap();
            candidates.push_back(Ok(Some(device("AA:BB:CC:DD:EE:FF"))));
            candidates.push_back(Err(SourceError::Timeout(Duration::from_secs(5))));
        }

        fx.state.handle_connection_tick().await;
        fx.state.handle_connection_tick().await;

        assert!(fx.state.active.is_some());
        assert_eq!(fx.route.unbinds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn device_swap_rebinds_and_resets_the_memo() {
        let mut fx = fixture();
        {
            let mut candidates = fx.source.candidates.lock().unwrap();
            candidates.push_back(Ok(Some(device("AA:BB:CC:DD:EE:FF"))));
            candidates.push_back(Ok(Some(device("11:22:33:44:55:66"))));
        }
        fx.source.tracks.lock().unwrap().push_back(track("Song A"));

        fx.state.handle_connection_tick().await;
        fx.state.handle_metadata_tick().await;
        fx.state.handle_connection_tick().await;

        assert_eq!(
            fx.state.active.as_ref().map(|d| d.address.as_str()),
            Some("11:22:33:44:55:66")
        );
        assert!(fx.state.last_sent.is_none());
        assert_eq!(
            *fx.route.binds.lock().unwrap(),
            vec!["AA:BB:CC:DD:EE:FF", "11:22:33:44:55:66"]
        );
    }
}

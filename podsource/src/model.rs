use std::fmt;

/// Identifies a connected Bluetooth audio-source device.
///
/// `path` is the BlueZ object path the device was discovered at; `address`
/// is its link-layer address, which is what the audio-route layer keys on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceHandle {
    pub address: String,
    pub path: String,
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// One complete now-playing snapshot.
///
/// A snapshot is always applied whole; equality over the four fields is
/// what the coordinator's dedup policy compares.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrackMetadata {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub duration_ms: u64,
}

impl TrackMetadata {
    /// True when every field carries no information.
    pub fn is_blank(&self) -> bool {
        self.title.is_empty()
            && self.artist.is_empty()
            && self.album.is_empty()
            && self.duration_ms == 0
    }
}

/// Transport command understood by the AVRCP player.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportCommand {
    Play,
    Pause,
    Next,
    Previous,
    Stop,
}

impl TransportCommand {
    /// Map an accessory command token to a transport command.
    ///
    /// Matching is case-insensitive and exact; anything outside the known
    /// token set yields `None`.
    pub fn parse(token: &str) -> Option<Self> {
        let token = token.trim();
        if token.eq_ignore_ascii_case("PLAY") {
            Some(Self::Play)
        } else if token.eq_ignore_ascii_case("PAUSE") {
            Some(Self::Pause)
        } else if token.eq_ignore_ascii_case("NEXT") {
            Some(Self::Next)
        } else if token.eq_ignore_ascii_case("PREVIOUS") || token.eq_ignore_ascii_case("PREV") {
            Some(Self::Previous)
        } else if token.eq_ignore_ascii_case("STOP") {
            Some(Self::Stop)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Play => "Play",
            Self::Pause => "Pause",
            Self::Next => "Next",
            Self::Previous => "Previous",
            Self::Stop => "Stop",
        }
    }
}

impl fmt::Display for TransportCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

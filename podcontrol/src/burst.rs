//! Framing of now-playing snapshots into accessory protocol lines.

use podsource::TrackMetadata;

/// Renders a snapshot as the `KEY=VALUE` lines of one metadata burst.
///
/// Empty text fields are omitted rather than sent as empty values.
/// `DURATION` is always present, so a fully blank snapshot still
/// produces a one-line burst (`DURATION=0`) that tells the accessory
/// to clear its display.
pub fn metadata_lines(snapshot: &TrackMetadata) -> Vec<String> {
    let mut lines = Vec::with_capacity(4);
    if !snapshot.title.is_empty() {
        lines.push(format!("TITLE={}", snapshot.title));
    }
    if !snapshot.artist.is_empty() {
        lines.push(format!("ARTIST={}", snapshot.artist));
    }
    if !snapshot.album.is_empty() {
        lines.push(format!("ALBUM={}", snapshot.album));
    }
    lines.push(format!("DURATION={}", snapshot.duration_ms));
    lines
}

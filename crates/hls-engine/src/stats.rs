//! Statistics bus messages (§6), tagged `hlsdemux-statistics` in spirit.

use std::time::Duration;

/// One `hlsdemux-statistics`-equivalent event, emitted on a channel the
/// Controller's caller drains (standing in for the GStreamer bus).
#[derive(Debug, Clone)]
pub enum StatsEvent {
    /// First playlist: EOS timestamp relative to sink-accumulation start.
    ManifestDownloadStop { elapsed: Duration },
    /// Playlist refresh: time spent fetching + reparsing.
    TimeToPlaylist { elapsed: Duration },
    /// One fragment fetch.
    Fragment { download_time: Duration, size: u64 },
    /// A fatal error surfaced to the caller.
    Error(String),
}

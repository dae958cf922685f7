//! PlaylistModel: thread-safe M3U8 state (§3, §4.1).

use std::sync::Arc;
use std::time::Duration;

use m3u8_rs::{MediaPlaylist, Playlist as M3u8Playlist};
use parking_lot::Mutex;
use url::Url;

use crate::error::HlsError;

/// Result of [`PlaylistModel::load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Ok,
    Incomplete,
}

/// One segment, with absolute (stream-origin-relative) time offsets.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaItem {
    pub uri: String,
    pub start: Duration,
    pub end: Duration,
    pub duration: Duration,
    /// `(start, end)`, inclusive-exclusive byte offsets; `None` when unset.
    pub byte_range: Option<(u64, u64)>,
    pub key_uri: Option<String>,
    pub iv: Option<[u8; 16]>,
}

/// A fetch in flight or completed for a [`MediaItem`].
#[derive(Debug, Clone)]
pub struct Fragment {
    pub uri: String,
    pub start: Duration,
    pub end: Duration,
    pub duration: Duration,
    pub byte_range: Option<(u64, u64)>,
    pub key_uri: Option<String>,
    pub iv: Option<[u8; 16]>,
    pub download_start: Option<std::time::Instant>,
    pub download_stop: Option<std::time::Instant>,
    pub payload: Vec<u8>,
    pub completed: bool,
}

impl From<&MediaItem> for Fragment {
    fn from(item: &MediaItem) -> Self {
        Self {
            uri: item.uri.clone(),
            start: item.start,
            end: item.end,
            duration: item.duration,
            byte_range: item.byte_range,
            key_uri: item.key_uri.clone(),
            iv: item.iv,
            download_start: None,
            download_stop: None,
            payload: Vec::new(),
            completed: false,
        }
    }
}

/// Parsed playlist state. `live` iff `#EXT-X-PLAYLIST-TYPE:EVENT`.
#[derive(Debug, Clone)]
pub struct Playlist {
    pub uri: String,
    pub live: bool,
    /// True once `#EXT-X-ENDLIST` has been seen; see Open Question resolution
    /// #2 in SPEC_FULL.md §11 — a VOD-typed playlist without ENDLIST is still
    /// refreshable, so this flag (not `live`) governs refresh eligibility.
    pub is_complete: bool,
    pub target_duration: Duration,
    pub total_duration: Duration,
    pub items: Vec<MediaItem>,
}

impl Playlist {
    fn empty(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            live: false,
            is_complete: false,
            target_duration: Duration::ZERO,
            total_duration: Duration::ZERO,
            items: Vec::new(),
        }
    }

    fn from_media_playlist(uri: &str, base_url: &str, pl: &MediaPlaylist) -> Result<Self, HlsError> {
        let live = matches!(pl.playlist_type, Some(m3u8_rs::MediaPlaylistType::Event));
        let target_duration = Duration::from_secs_f32(pl.target_duration);

        let mut items = Vec::with_capacity(pl.segments.len());
        let mut cursor = Duration::ZERO;
        let mut current_key_uri: Option<String> = None;
        let mut current_iv: Option<[u8; 16]> = None;

        for seg in &pl.segments {
            if let Some(key) = &seg.key {
                if key.method == m3u8_rs::KeyMethod::AES128 {
                    current_key_uri = key.uri.clone();
                    current_iv = key
                        .iv
                        .as_deref()
                        .map(parse_iv)
                        .transpose()
                        .map_err(|reason| HlsError::PlaylistParseError { reason })?;
                } else if key.method == m3u8_rs::KeyMethod::None {
                    current_key_uri = None;
                    current_iv = None;
                }
            }

            let duration = Duration::from_secs_f32(seg.duration);
            let start = cursor;
            let end = start + duration;
            cursor = end;

            let uri = resolve_uri(base_url, &seg.uri)?;
            let byte_range = seg.byte_range.as_ref().map(|br| {
                let length = br.length;
                let offset = br.offset.unwrap_or(0);
                (offset, offset + length)
            });

            items.push(MediaItem {
                uri,
                start,
                end,
                duration,
                byte_range,
                key_uri: current_key_uri.clone(),
                iv: current_iv,
            });
        }

        Ok(Self {
            uri: uri.to_string(),
            live,
            is_complete: pl.end_list,
            target_duration,
            total_duration: cursor,
            items,
        })
    }
}

fn parse_iv(iv_hex: &str) -> Result<[u8; 16], String> {
    let trimmed = iv_hex.trim_start_matches("0x").trim_start_matches("0X");
    let mut bytes = [0u8; 16];
    hex::decode_to_slice(trimmed, &mut bytes)
        .map_err(|e| format!("invalid IV `{iv_hex}`: {e}"))?;
    Ok(bytes)
}

fn resolve_uri(base_url: &str, uri: &str) -> Result<String, HlsError> {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return Ok(uri.to_string());
    }
    let base = Url::parse(base_url).map_err(|e| HlsError::PlaylistParseError {
        reason: format!("invalid base URL `{base_url}`: {e}"),
    })?;
    let resolved = base.join(uri).map_err(|e| HlsError::PlaylistParseError {
        reason: format!("cannot resolve `{uri}` against `{base_url}`: {e}"),
    })?;
    Ok(resolved.to_string())
}

#[derive(Debug)]
struct ModelState {
    playlist: Playlist,
    cursor: usize,
}

/// Thread-safe M3U8 state: items, durations, cursor, live/VOD flag (§4.1).
///
/// A single non-reentrant mutex protects all state. No accessor below calls
/// another accessor while holding the guard, so unlike the original's
/// recursive mutex, a plain lock is sufficient (see SPEC_FULL.md §4.1).
pub struct PlaylistModel {
    state: Mutex<ModelState>,
}

impl PlaylistModel {
    pub fn new(uri: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ModelState {
                playlist: Playlist::empty(uri),
                cursor: 0,
            }),
        })
    }

    /// Validate UTF-8, parse, and atomically replace the playlist if complete.
    pub fn load(&self, base_url: &str, raw_bytes: &[u8]) -> Result<LoadOutcome, HlsError> {
        let text = std::str::from_utf8(raw_bytes).map_err(|_| HlsError::InvalidUtf8)?;

        let parsed = m3u8_rs::parse_playlist_res(text.as_bytes()).map_err(|e| {
            HlsError::PlaylistParseError {
                reason: format!("{e:?}"),
            }
        })?;

        let media_playlist = match parsed {
            M3u8Playlist::MediaPlaylist(pl) => pl,
            M3u8Playlist::MasterPlaylist(_) => {
                return Err(HlsError::PlaylistParseError {
                    reason: "master playlists require variant selection before load() \
                             (variant switching is out of scope; see SPEC_FULL.md §11)"
                        .to_string(),
                })
            }
        };

        let mut guard = self.state.lock();
        let new_playlist = Playlist::from_media_playlist(&guard.playlist.uri, base_url, &media_playlist)?;

        if !new_playlist.is_complete && !new_playlist.live {
            // VOD-without-ENDLIST: incomplete, preserve prior state (§4.1).
            return Ok(LoadOutcome::Incomplete);
        }

        guard.playlist = new_playlist;
        Ok(LoadOutcome::Ok)
    }

    pub fn current_fragment(&self) -> Option<Fragment> {
        let guard = self.state.lock();
        guard.playlist.items.get(guard.cursor).map(Fragment::from)
    }

    pub fn fragment_at(&self, index: usize) -> Option<Fragment> {
        let guard = self.state.lock();
        guard.playlist.items.get(index).map(Fragment::from)
    }

    pub fn advance(&self) {
        let mut guard = self.state.lock();
        let len = guard.playlist.items.len();
        guard.cursor = (guard.cursor + 1).min(len);
    }

    /// Set cursor to the first item with `start <= target < end`.
    ///
    /// Returns `true` on hit. On miss (`target` beyond total duration) the
    /// cursor is left unchanged; callers treat a miss as "past end" (§4.1).
    pub fn seek_to(&self, target: Duration) -> bool {
        let mut guard = self.state.lock();
        if let Some(idx) = guard
            .playlist
            .items
            .iter()
            .position(|item| item.start <= target && target < item.end)
        {
            guard.cursor = idx;
            true
        } else {
            false
        }
    }

    /// Force the cursor past the end, driving end-of-playlist handling.
    ///
    /// `seek_to` leaves the cursor unchanged on a miss (§4.1); callers that
    /// want "seek past end means EOS" semantics (§8 boundary behaviors) call
    /// this explicitly after a miss.
    pub fn force_to_end(&self) {
        let mut guard = self.state.lock();
        guard.cursor = guard.playlist.items.len();
    }

    pub fn cursor(&self) -> usize {
        self.state.lock().cursor
    }

    pub fn len(&self) -> usize {
        self.state.lock().playlist.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_duration(&self) -> Duration {
        self.state.lock().playlist.total_duration
    }

    pub fn target_duration(&self) -> Duration {
        self.state.lock().playlist.target_duration
    }

    pub fn is_live(&self) -> bool {
        self.state.lock().playlist.live
    }

    /// Whether the playlist should still be periodically refreshed (live, or
    /// VOD-typed but missing ENDLIST — see Open Question resolution #2).
    pub fn needs_refresh(&self) -> bool {
        let guard = self.state.lock();
        guard.playlist.live || !guard.playlist.is_complete
    }

    pub fn uri(&self) -> String {
        self.state.lock().playlist.uri.clone()
    }

    /// Stubbed, matching the original's `is_caching_allowed` (always `true`);
    /// caching policy is out of scope (§1 Non-goals).
    pub fn is_caching_allowed(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VOD: &str = "#EXTM3U\n\
#EXT-X-TARGETDURATION:10\n\
#EXTINF:10.0,\n\
a.ts\n\
#EXTINF:10.0,\n\
b.ts\n\
#EXTINF:10.0,\n\
c.ts\n\
#EXT-X-ENDLIST\n";

    fn model() -> Arc<PlaylistModel> {
        let model = PlaylistModel::new("http://example.com/playlist.m3u8");
        model
            .load("http://example.com/", VOD.as_bytes())
            .unwrap();
        model
    }

    #[test]
    fn load_vod_with_endlist_is_complete_and_not_live() {
        let model = model();
        assert!(!model.is_live());
        assert_eq!(model.len(), 3);
        assert_eq!(model.total_duration(), Duration::from_secs(30));
        assert!(!model.needs_refresh());
    }

    #[test]
    fn vod_without_endlist_is_incomplete_and_preserves_prior_state() {
        let model = model();
        let truncated = "#EXTM3U\n#EXT-X-TARGETDURATION:10\n#EXTINF:10.0,\na.ts\n";
        let outcome = model.load("http://example.com/", truncated.as_bytes()).unwrap();
        assert_eq!(outcome, LoadOutcome::Incomplete);
        // Prior (complete) state of 3 items must be preserved.
        assert_eq!(model.len(), 3);
    }

    #[test]
    fn invalid_utf8_is_rejected_without_mutating_state() {
        let model = model();
        let bad = vec![0xFF, 0xFE, 0xFD];
        let err = model.load("http://example.com/", &bad).unwrap_err();
        assert!(matches!(err, HlsError::InvalidUtf8));
        assert_eq!(model.len(), 3);
    }

    #[test]
    fn cursor_advances_and_saturates_at_len() {
        let model = model();
        assert_eq!(model.cursor(), 0);
        model.advance();
        model.advance();
        model.advance();
        assert_eq!(model.cursor(), 3);
        model.advance();
        assert_eq!(model.cursor(), 3);
        assert!(model.current_fragment().is_none());
    }

    #[test]
    fn seek_hits_containing_item() {
        let model = model();
        assert!(model.seek_to(Duration::from_secs(15)));
        let frag = model.current_fragment().unwrap();
        assert_eq!(frag.start, Duration::from_secs(10));
        assert_eq!(frag.end, Duration::from_secs(20));
    }

    #[test]
    fn seek_past_total_duration_misses_and_leaves_cursor_unchanged() {
        let model = model();
        model.advance();
        let cursor_before = model.cursor();
        assert!(!model.seek_to(Duration::from_secs(999)));
        assert_eq!(model.cursor(), cursor_before);
    }

    #[test]
    fn fragment_at_out_of_range_is_none() {
        let model = model();
        assert!(model.fragment_at(10).is_none());
        assert!(model.fragment_at(0).is_some());
    }

    #[test]
    fn adjacent_items_are_contiguous() {
        let model = model();
        for idx in 0..model.len() - 1 {
            let a = model.fragment_at(idx).unwrap();
            let b = model.fragment_at(idx + 1).unwrap();
            assert_eq!(a.end, b.start);
        }
    }

    #[test]
    fn event_playlist_is_live() {
        let live_src = "#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXT-X-PLAYLIST-TYPE:EVENT\n\
#EXTINF:6.0,\na.ts\n#EXTINF:6.0,\nb.ts\n";
        let model = PlaylistModel::new("http://example.com/live.m3u8");
        model.load("http://example.com/", live_src.as_bytes()).unwrap();
        assert!(model.is_live());
        assert!(model.needs_refresh());
    }

    #[test]
    fn key_change_tracked_per_segment() {
        let enc = "#EXTM3U\n#EXT-X-TARGETDURATION:10\n\
#EXT-X-KEY:METHOD=AES-128,URI=\"k1.bin\",IV=0x00000000000000000000000000000001\n\
#EXTINF:10.0,\na.ts\n\
#EXT-X-KEY:METHOD=AES-128,URI=\"k2.bin\",IV=0x00000000000000000000000000000002\n\
#EXTINF:10.0,\nb.ts\n\
#EXT-X-ENDLIST\n";
        let model = PlaylistModel::new("http://example.com/enc.m3u8");
        model.load("http://example.com/", enc.as_bytes()).unwrap();
        let a = model.fragment_at(0).unwrap();
        let b = model.fragment_at(1).unwrap();
        assert_eq!(a.key_uri.as_deref(), Some("k1.bin"));
        assert_eq!(b.key_uri.as_deref(), Some("k2.bin"));
        assert_ne!(a.iv, b.iv);
    }
}

//! Adaptive HLS fetch engine: parses and refreshes an M3U8 playlist model,
//! drives a single streaming task that fetches, decrypts, and paces media
//! fragments against a downstream buffer, and exposes seek/duration/URI
//! queries. See `SPEC_FULL.md` for the full component design.

pub mod config;
pub mod controller;
pub mod decryptor;
pub mod downloader;
pub mod engine;
pub mod error;
pub mod model;
pub mod stats;

pub use config::HlsConfig;
pub use controller::{Controller, SeekableRange, StaticUriQuery, UpstreamUriQuery};
pub use downloader::{FetchOutcome, FetchTiming, HttpUriDownloader, UriDownloader};
pub use engine::{DownstreamSink, EngineState, FetchEngine, FixedParentHints, ParentHints, PlaylistRefresher};
pub use error::HlsError;
pub use model::{Fragment, LoadOutcome, MediaItem, Playlist, PlaylistModel};
pub use stats::StatsEvent;

//! Controller: lifecycle, seek handling, query handling, stats (§4.5).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::HlsConfig;
use crate::downloader::{FetchOutcome, UriDownloader};
use crate::engine::{DownstreamSink, FetchEngine, ParentHints, PlaylistRefresher};
use crate::error::HlsError;
use crate::model::{LoadOutcome, PlaylistModel};
use crate::stats::StatsEvent;

/// Resolves the upstream source's URI, honoring only **permanent** HTTP
/// redirects (§4.5(a), §8 scenario 6).
#[async_trait]
pub trait UpstreamUriQuery: Send + Sync {
    /// Returns `(uri, permanent)` if the upstream element answered the query.
    async fn query_uri(&self) -> Option<(String, bool)>;
}

/// A resolver that always reports the construction-time URI with no redirect,
/// for collaborators that don't implement redirect-following.
pub struct StaticUriQuery;

#[async_trait]
impl UpstreamUriQuery for StaticUriQuery {
    async fn query_uri(&self) -> Option<(String, bool)> {
        None
    }
}

/// Seekable range answered by `SEEKING(TIME)` queries (§4.5(d)).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekableRange {
    pub start: Duration,
    pub end: Duration,
}

/// Accumulates initial playlist bytes, loads and refreshes the model, drives
/// the FetchEngine's lifecycle, and answers seek/query operations.
pub struct Controller {
    initial_uri: String,
    model: Arc<PlaylistModel>,
    fragment_downloader: Arc<dyn UriDownloader>,
    playlist_downloader: Arc<dyn UriDownloader>,
    sink: Arc<dyn DownstreamSink>,
    upstream: Arc<dyn UpstreamUriQuery>,
    stats_tx: mpsc::UnboundedSender<StatsEvent>,
    engine: Arc<FetchEngine>,
    engine_handle: Mutex<Option<JoinHandle<()>>>,
    playlist_accumulator: Mutex<Vec<u8>>,
    sink_ingest_start: Mutex<Option<Instant>>,
    loaded: AtomicBool,
}

impl Controller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        initial_uri: impl Into<String>,
        fragment_downloader: Arc<dyn UriDownloader>,
        playlist_downloader: Arc<dyn UriDownloader>,
        sink: Arc<dyn DownstreamSink>,
        upstream: Arc<dyn UpstreamUriQuery>,
        parent_hints: Arc<dyn ParentHints>,
        config: HlsConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<StatsEvent>) {
        let initial_uri = initial_uri.into();
        let model = PlaylistModel::new(initial_uri.clone());
        let (stats_tx, stats_rx) = mpsc::unbounded_channel();

        let controller = Arc::new_cyclic(|weak: &std::sync::Weak<Controller>| {
            let refresher: Arc<dyn PlaylistRefresher> = Arc::new(WeakRefresher(weak.clone()));
            let engine = FetchEngine::new(
                Arc::clone(&model),
                Arc::clone(&fragment_downloader),
                config,
                parent_hints,
                Arc::clone(&sink),
                refresher,
                stats_tx.clone(),
            );
            Self {
                initial_uri,
                model,
                fragment_downloader,
                playlist_downloader,
                sink,
                upstream,
                stats_tx,
                engine,
                engine_handle: Mutex::new(None),
                playlist_accumulator: Mutex::new(Vec::new()),
                sink_ingest_start: Mutex::new(None),
                loaded: AtomicBool::new(false),
            }
        });

        (controller, stats_rx)
    }

    // --- Sink contract (§6): accumulate playlist bytes until EOS ---

    pub fn push_playlist_bytes(&self, bytes: &[u8]) {
        let mut acc = self.playlist_accumulator.lock();
        if acc.is_empty() {
            *self.sink_ingest_start.lock() = Some(Instant::now());
        }
        acc.extend_from_slice(bytes);
    }

    /// On sink EOS: resolve URI, load the model, warm both downloaders, and
    /// mark the source pad linked (§4.5(a)).
    pub async fn handle_sink_eos(&self) -> Result<(), HlsError> {
        let raw = std::mem::take(&mut *self.playlist_accumulator.lock());
        let started = self.sink_ingest_start.lock().take().unwrap_or_else(Instant::now);

        let base_uri = match self.upstream.query_uri().await {
            Some((uri, true)) => uri,
            _ => self.initial_uri.clone(),
        };

        match self.model.load(&base_uri, &raw)? {
            LoadOutcome::Incomplete => Err(HlsError::PlaylistIncomplete),
            LoadOutcome::Ok => {
                self.fragment_downloader.prepare(&self.model.uri()).await;
                self.playlist_downloader.prepare(&self.model.uri()).await;
                self.sink.mark_linked();
                self.loaded.store(true, Ordering::SeqCst);
                let _ = self.stats_tx.send(StatsEvent::ManifestDownloadStop {
                    elapsed: started.elapsed(),
                });
                Ok(())
            }
        }
    }

    // --- Lifecycle (§4.5(b)) ---

    /// Null -> Ready.
    pub fn reset(&self) {
        self.playlist_accumulator.lock().clear();
        self.loaded.store(false, Ordering::SeqCst);
    }

    /// Ready -> Paused: start the streaming task (idle until `play()`).
    pub fn prepare(&self) {
        let mut handle = self.engine_handle.lock();
        if handle.is_none() {
            *handle = Some(self.engine.spawn());
        }
    }

    /// Paused -> Playing: restart the streaming task, escaping any retry-wait.
    pub async fn play(&self) {
        self.engine.restart().await;
    }

    /// Paused -> Ready: cancel downloads, signal, and await the current
    /// iteration's completion.
    pub async fn pause(&self) {
        self.engine.pause().await;
    }

    /// Ready -> Null: stop and join the streaming task.
    pub async fn teardown(&self) {
        self.engine.stop();
        if let Some(handle) = self.engine_handle.lock().take() {
            let _ = handle.await;
        }
    }

    // --- Seek handling (§4.5(c)) ---

    /// Seek to `target`. Rejected on live streams (§7 `SeekRejected`); the
    /// "non-TIME format" rejection from the original does not apply here
    /// since this API only accepts a `Duration`.
    pub async fn seek(&self, target: Duration, flush: bool) -> Result<(), HlsError> {
        if self.model.is_live() {
            return Err(HlsError::SeekRejected {
                reason: "cannot seek a live stream".to_string(),
            });
        }

        self.engine.pause().await;
        let hit = self.model.seek_to(target);
        if !hit {
            // Past end-of-playlist: drive end-of-playlist rather than leave
            // the cursor unchanged (§4.1 implementer note, §8 boundary behavior).
            self.model.force_to_end();
        }
        if flush {
            self.sink.flush_start();
            self.sink.flush_stop();
        }
        self.engine.reset_failed_count();
        self.engine.restart().await;
        Ok(())
    }

    // --- Query handling (§4.5(d)) ---

    pub fn query_duration(&self) -> Option<Duration> {
        let total = self.model.total_duration();
        (total > Duration::ZERO).then_some(total)
    }

    pub fn query_uri(&self) -> String {
        self.model.uri()
    }

    pub fn query_seekable(&self) -> Option<SeekableRange> {
        if self.model.is_live() {
            return None;
        }
        Some(SeekableRange {
            start: Duration::ZERO,
            end: self.model.total_duration(),
        })
    }

    pub fn engine(&self) -> &Arc<FetchEngine> {
        &self.engine
    }

    pub fn model(&self) -> &Arc<PlaylistModel> {
        &self.model
    }
}

#[async_trait]
impl PlaylistRefresher for Controller {
    /// Fetch the current playlist URI via the playlist downloader
    /// (compress=true, refresh=true, allow_cache per playlist); reparse on
    /// success (§4.5 "Refresh playlist").
    async fn refresh_playlist(&self) -> Result<bool, HlsError> {
        let uri = self.model.uri();
        let started = Instant::now();
        let token = tokio_util::sync::CancellationToken::new();
        let outcome = self
            .playlist_downloader
            .fetch(&uri, true, self.model.is_caching_allowed(), &token)
            .await;

        match outcome {
            FetchOutcome::Completed { bytes, .. } => match self.model.load(&uri, &bytes)? {
                LoadOutcome::Ok => {
                    let _ = self.stats_tx.send(StatsEvent::TimeToPlaylist {
                        elapsed: started.elapsed(),
                    });
                    Ok(true)
                }
                LoadOutcome::Incomplete => Ok(false),
            },
            FetchOutcome::Failed(_) | FetchOutcome::Cancelled | FetchOutcome::Void => Ok(false),
        }
    }
}

/// Adapts a `Weak<Controller>` so `FetchEngine` can call back into the
/// Controller for refreshes without a reference cycle.
struct WeakRefresher(std::sync::Weak<Controller>);

#[async_trait]
impl PlaylistRefresher for WeakRefresher {
    async fn refresh_playlist(&self) -> Result<bool, HlsError> {
        match self.0.upgrade() {
            Some(controller) => controller.refresh_playlist().await,
            None => Ok(false),
        }
    }
}

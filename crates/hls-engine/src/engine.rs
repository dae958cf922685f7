//! FetchEngine: the streaming task (§4.4).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::HlsConfig;
use crate::decryptor::Decryptor;
use crate::downloader::{FetchOutcome, UriDownloader};
use crate::error::HlsError;
use crate::model::PlaylistModel;
use crate::stats::StatsEvent;

/// {Idle, Fetching, Waiting, Retrying, Paused, EndOfPlaylist, Error} (§3).
/// Only one of these holds at a time per engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Fetching,
    Waiting,
    Retrying,
    Paused,
    EndOfPlaylist,
    Error,
}

/// `RETRY_TIME_BASE`/`RETRY_THRESHOLD`/`RETRY_MAX` backoff formula (§4.4 step 4).
pub fn time_until_retry(failed_count: u32, config: &HlsConfig) -> Duration {
    if failed_count < config.retry_threshold {
        return config.retry_time_base;
    }
    let exponent = failed_count as f64 / config.retry_threshold as f64;
    let factor = exponent.exp() / std::f64::consts::E;
    let millis = config.retry_time_base.as_millis() as f64 * factor;
    Duration::from_millis(millis.round() as u64).min(config.retry_max)
}

/// Replaces reflective property introspection on the parent container (§9):
/// the Controller injects a hint source rather than the core reaching out to
/// query a generic property bag.
pub trait ParentHints: Send + Sync {
    fn max_buffer_duration(&self) -> Duration;
}

/// Fixed hint, used when no parent container is present (tests, defaults).
pub struct FixedParentHints(pub Duration);

impl ParentHints for FixedParentHints {
    fn max_buffer_duration(&self) -> Duration {
        self.0
    }
}

/// The downstream byte queue / src pad, abstracted (§4.4, §6 Source contract).
#[async_trait]
pub trait DownstreamSink: Send + Sync {
    /// Whether the source pad has been linked yet (§4.4 step 1).
    fn is_linked(&self) -> bool;
    /// Downstream playback position, if known.
    fn playback_position(&self) -> Option<Duration>;
    async fn push_bytes(&self, bytes: Vec<u8>) -> Result<(), HlsError>;
    fn push_eos(&self);
    /// Called once the Controller has resolved and loaded the initial
    /// playlist, activating the sometimes-pad (§4.5(a)).
    fn mark_linked(&self) {}
    /// Sent around a seek when the FLUSH flag is set (§4.5(c)).
    fn flush_start(&self) {}
    fn flush_stop(&self) {}
}

/// Invoked by the engine on `NotAuthorized`/`NotFound` fragment errors (§4.4
/// step 3). Implemented by the Controller, which owns the playlist downloader.
#[async_trait]
pub trait PlaylistRefresher: Send + Sync {
    async fn refresh_playlist(&self) -> Result<bool, HlsError>;
}

#[derive(Default)]
struct EngineShared {
    position: Duration,
    download_failed_count: u32,
    /// Edge-triggered: a signal sets it true; the engine checks-and-clears
    /// it under this same lock (§3).
    continuing: bool,
}

/// The streaming task described in §4.4: buffer-ahead gate, fragment fetch,
/// decrypt, retry/backoff, end-of-playlist handling.
pub struct FetchEngine {
    model: Arc<PlaylistModel>,
    downloader: Arc<dyn UriDownloader>,
    decryptor: Decryptor,
    config: HlsConfig,
    parent_hints: Arc<dyn ParentHints>,
    sink: Arc<dyn DownstreamSink>,
    refresher: Arc<dyn PlaylistRefresher>,
    stats_tx: mpsc::UnboundedSender<StatsEvent>,

    shared: Mutex<EngineShared>,
    state: Mutex<EngineState>,

    /// Engine-lifetime stop signal (Controller Ready->Null).
    stop_token: CancellationToken,
    /// Cancels the in-flight downloader call; replaced on every `restart`.
    fetch_cancel: Mutex<CancellationToken>,
    /// Controller-requested pause (Paused<->Playing lifecycle, §4.5(b)).
    paused: AtomicBool,
    resume: Notify,
    /// Wakes the buffer-ahead and retry-backoff waits early (§5 suspension points).
    wake: Notify,
    /// Fires whenever the loop reaches an idle, paused-observed state, so
    /// `pause()` can use it as a join-barrier replacement (§9).
    iteration_idle: Notify,
}

impl FetchEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model: Arc<PlaylistModel>,
        downloader: Arc<dyn UriDownloader>,
        config: HlsConfig,
        parent_hints: Arc<dyn ParentHints>,
        sink: Arc<dyn DownstreamSink>,
        refresher: Arc<dyn PlaylistRefresher>,
        stats_tx: mpsc::UnboundedSender<StatsEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            model,
            downloader,
            decryptor: Decryptor::new(),
            config,
            parent_hints,
            sink,
            refresher,
            stats_tx,
            shared: Mutex::new(EngineShared::default()),
            state: Mutex::new(EngineState::Idle),
            stop_token: CancellationToken::new(),
            fetch_cancel: Mutex::new(CancellationToken::new()),
            paused: AtomicBool::new(true),
            resume: Notify::new(),
            wake: Notify::new(),
            iteration_idle: Notify::new(),
        })
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    pub fn position(&self) -> Duration {
        self.shared.lock().position
    }

    pub fn failed_count(&self) -> u32 {
        self.shared.lock().download_failed_count
    }

    pub fn reset_failed_count(&self) {
        self.shared.lock().download_failed_count = 0;
    }

    /// Null -> Ready / Ready -> Paused: spawn the streaming task.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.run().await })
    }

    /// Ready -> Null: request the loop to stop and let the `JoinHandle` be awaited.
    pub fn stop(&self) {
        self.stop_token.cancel();
        self.fetch_cancel.lock().cancel();
        self.resume.notify_waiters();
        self.wake.notify_waiters();
    }

    /// Paused -> Ready: cancel in-flight downloads, signal the condition,
    /// and block (async) until the current loop iteration has returned to
    /// an idle, paused state (§5 cancellation semantics, §9 re-architecture
    /// of the recursive-mutex join barrier as an explicit signal).
    ///
    /// The wait registers interest in `iteration_idle` via `enable()` before
    /// re-checking the state, so a `notify_waiters()` fired by `run()` between
    /// the check and the await can never be missed (a plain "check, then
    /// await" has a lost-wakeup window under a multi-thread runtime).
    pub async fn pause(&self) {
        self.fetch_cancel.lock().cancel();
        self.paused.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
        loop {
            let notified = self.iteration_idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if matches!(
                self.state(),
                EngineState::Paused | EngineState::EndOfPlaylist | EngineState::Error
            ) {
                break;
            }
            notified.await;
        }
    }

    /// Paused -> Playing: restart the streaming task, escaping any retry-wait.
    ///
    /// A restart found with `failed_count >= retry_threshold` forces a pause,
    /// zeroes the counter, and restarts immediately (§4.4 step 4).
    pub async fn restart(&self) {
        if !self.paused.load(Ordering::SeqCst) && self.failed_count() >= self.config.retry_threshold {
            self.pause().await;
            self.reset_failed_count();
        }
        *self.fetch_cancel.lock() = CancellationToken::new();
        self.paused.store(false, Ordering::SeqCst);
        self.resume.notify_waiters();
        self.wake.notify_waiters();
    }

    async fn run(self: Arc<Self>) {
        loop {
            if self.stop_token.is_cancelled() {
                break;
            }

            if self.paused.load(Ordering::SeqCst) {
                // Don't clobber a terminal state a prior iteration already
                // settled on (§3: only one state holds at a time); Paused
                // only reflects a controller-requested pause/idle wait.
                {
                    let mut state = self.state.lock();
                    if !matches!(*state, EngineState::EndOfPlaylist | EngineState::Error) {
                        *state = EngineState::Paused;
                    }
                }
                self.iteration_idle.notify_waiters();
                tokio::select! {
                    _ = self.stop_token.cancelled() => break,
                    _ = self.resume.notified() => {}
                }
                continue;
            }

            if !self.buffer_ahead_check().await {
                continue;
            }

            *self.state.lock() = EngineState::Fetching;
            let Some(fragment) = self.model.current_fragment() else {
                self.handle_void();
                continue;
            };

            let cancel = self.fetch_cancel.lock().clone();
            let outcome = self
                .downloader
                .fetch_fragment(&fragment, false, self.model.is_caching_allowed(), &cancel)
                .await;

            match outcome {
                FetchOutcome::Completed { bytes, timing } => {
                    let decrypted = self
                        .decryptor
                        .decrypt(
                            &fragment,
                            bytes,
                            self.downloader.as_ref(),
                            self.model.is_caching_allowed(),
                            &cancel,
                        )
                        .await;
                    match decrypted {
                        Ok(payload) => {
                            let size = payload.len() as u64;
                            if let Err(e) = self.sink.push_bytes(payload).await {
                                error!(%e, "downstream queue push failed; fatal end of stream");
                                self.sink.push_eos();
                                self.paused.store(true, Ordering::SeqCst);
                                continue;
                            }
                            let _ = self.stats_tx.send(StatsEvent::Fragment {
                                download_time: timing.elapsed(),
                                size,
                            });
                            {
                                let mut shared = self.shared.lock();
                                shared.position = fragment.start;
                                shared.download_failed_count = 0;
                                shared.continuing = false;
                            }
                            self.model.advance();
                        }
                        Err(e) => self.handle_failed(e).await,
                    }
                }
                FetchOutcome::Void => self.handle_void(),
                FetchOutcome::Cancelled => {
                    debug!("fragment fetch cancelled");
                }
                FetchOutcome::Failed(err) => self.handle_failed(err).await,
            }
        }
    }

    async fn buffer_ahead_check(&self) -> bool {
        if !self.sink.is_linked() {
            tokio::time::sleep(Duration::from_micros(100)).await;
            return false;
        }

        if self.take_continuing() {
            return true;
        }

        let max_buffer = self.parent_hints.max_buffer_duration();
        let engine_position = self.position();
        if let Some(playback_position) = self.sink.playback_position() {
            if playback_position >= crate::config::BUFFER_AHEAD_MIN_POSITION
                && engine_position > playback_position + max_buffer
            {
                let delta = engine_position - playback_position - max_buffer;
                self.wait_cancellable(delta).await;
                return false;
            }
        }
        true
    }

    fn take_continuing(&self) -> bool {
        let mut shared = self.shared.lock();
        if shared.continuing {
            shared.continuing = false;
            true
        } else {
            false
        }
    }

    /// Wait for `delay`, woken early by a `restart`/signal or engine stop.
    async fn wait_cancellable(&self, delay: Duration) {
        tokio::select! {
            _ = self.stop_token.cancelled() => {}
            _ = self.wake.notified() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    fn handle_void(&self) {
        *self.state.lock() = EngineState::EndOfPlaylist;
        self.shared.lock().position = Duration::ZERO;
        self.sink.push_eos();
        self.paused.store(true, Ordering::SeqCst);
    }

    async fn handle_failed(&self, err: HlsError) {
        if err.is_fatal() || !err.is_retryable() {
            *self.state.lock() = EngineState::Error;
            let _ = self.stats_tx.send(StatsEvent::Error(err.to_string()));
            error!(%err, "non-retryable error; pausing engine");
            self.sink.push_eos();
            self.paused.store(true, Ordering::SeqCst);
            return;
        }

        let failed_count = {
            let mut shared = self.shared.lock();
            shared.download_failed_count += 1;
            shared.download_failed_count
        };

        if err.triggers_playlist_refresh() {
            *self.state.lock() = EngineState::Retrying;
            warn!(%err, "refreshing playlist due to auth/not-found error");
            if let Err(refresh_err) = self.refresher.refresh_playlist().await {
                warn!(%refresh_err, "playlist refresh failed");
            }
            // Skip this round's backoff wait (§4.4 step 3).
            self.shared.lock().continuing = true;
            return;
        }

        *self.state.lock() = EngineState::Retrying;
        let delay = time_until_retry(failed_count, &self.config);
        warn!(
            attempt = failed_count,
            delay_ms = delay.as_millis() as u64,
            %err,
            "retrying fragment fetch after backoff"
        );
        self.wait_cancellable(delay).await;
        self.shared.lock().continuing = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_constant_below_threshold() {
        let config = HlsConfig::default();
        for k in 0..config.retry_threshold {
            assert_eq!(time_until_retry(k, &config), config.retry_time_base);
        }
    }

    #[test]
    fn backoff_scenario_2_seven_failures() {
        let config = HlsConfig::default();
        for k in 1..=6 {
            assert_eq!(time_until_retry(k, &config), Duration::from_millis(500));
        }
        let delay = time_until_retry(7, &config);
        // 500 * exp(7/6) / e ~= 592ms
        assert!(delay.as_millis() >= 580 && delay.as_millis() <= 600, "{delay:?}");
    }

    #[test]
    fn backoff_is_monotonic_non_decreasing_and_bounded() {
        let config = HlsConfig::default();
        let mut prev = Duration::ZERO;
        for k in 0..200 {
            let delay = time_until_retry(k, &config);
            assert!(delay >= prev);
            assert!(delay <= config.retry_max);
            prev = delay;
        }
    }

    #[test]
    fn backoff_caps_at_retry_max() {
        let config = HlsConfig::default();
        let delay = time_until_retry(1000, &config);
        assert_eq!(delay, config.retry_max);
    }

    struct NoopSink {
        eos_count: std::sync::Mutex<u32>,
    }

    #[async_trait]
    impl DownstreamSink for NoopSink {
        fn is_linked(&self) -> bool {
            true
        }
        fn playback_position(&self) -> Option<Duration> {
            None
        }
        async fn push_bytes(&self, _bytes: Vec<u8>) -> Result<(), HlsError> {
            Ok(())
        }
        fn push_eos(&self) {
            *self.eos_count.lock().unwrap() += 1;
        }
    }

    struct NoopRefresher;

    #[async_trait]
    impl PlaylistRefresher for NoopRefresher {
        async fn refresh_playlist(&self) -> Result<bool, HlsError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn non_retryable_non_fatal_error_still_terminates_the_engine() {
        use crate::downloader::mock::MockUriDownloader;

        let model = PlaylistModel::new("http://example.com/v.m3u8");
        model
            .load(
                "http://example.com/",
                b"#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXTINF:6.0,\na.ts\n#EXT-X-ENDLIST\n",
            )
            .unwrap();

        let downloader: Arc<dyn UriDownloader> = Arc::new(MockUriDownloader::new(vec![
            FetchOutcome::Failed(HlsError::AlreadyPaused),
        ]));
        let sink = Arc::new(NoopSink {
            eos_count: std::sync::Mutex::new(0),
        });
        let (stats_tx, _stats_rx) = mpsc::unbounded_channel();

        let engine = FetchEngine::new(
            model,
            downloader,
            HlsConfig::default(),
            Arc::new(FixedParentHints(Duration::from_secs(30))),
            sink.clone() as Arc<dyn DownstreamSink>,
            Arc::new(NoopRefresher),
            stats_tx,
        );

        engine.handle_failed(HlsError::AlreadyPaused).await;

        assert_eq!(engine.state(), EngineState::Error);
        assert_eq!(*sink.eos_count.lock().unwrap(), 1);
    }
}

//! UriDownloader: the HTTP transport collaborator interface (§4.2).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use tokio_util::sync::CancellationToken;

use crate::error::HlsError;
use crate::model::Fragment;

/// Timing metadata filled in by a completed fetch.
#[derive(Debug, Clone, Copy)]
pub struct FetchTiming {
    pub start: Instant,
    pub stop: Instant,
}

impl FetchTiming {
    pub fn elapsed(&self) -> Duration {
        self.stop.duration_since(self.start)
    }
}

/// Outcome of a single fetch attempt. `Void` ("no attempt was made") is
/// distinct from `Cancelled` and `Failed` (§4.2).
#[derive(Debug)]
pub enum FetchOutcome {
    Completed { bytes: Vec<u8>, timing: FetchTiming },
    Failed(HlsError),
    Cancelled,
    Void,
}

/// Fetch a named resource or fragment, optionally ranged; cancellable; warms
/// transport connections ahead of use (§4.2).
#[async_trait]
pub trait UriDownloader: Send + Sync {
    async fn fetch(
        &self,
        uri: &str,
        compress: bool,
        allow_cache: bool,
        token: &CancellationToken,
    ) -> FetchOutcome;

    async fn fetch_fragment(
        &self,
        fragment: &Fragment,
        compress: bool,
        allow_cache: bool,
        token: &CancellationToken,
    ) -> FetchOutcome;

    /// Warm the transport (DNS/TLS) for a host.
    async fn prepare(&self, _uri: &str) {}
}

/// `reqwest`-backed implementation, matching the rest of the workspace's
/// HTTP stack (rustls TLS, configurable user agent/timeout).
pub struct HttpUriDownloader {
    client: Client,
}

impl HttpUriDownloader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn do_fetch(
        &self,
        uri: &str,
        byte_range: Option<(u64, u64)>,
        compress: bool,
        token: &CancellationToken,
    ) -> FetchOutcome {
        let start = Instant::now();
        let mut builder = self.client.get(uri);
        if let Some((from, to)) = byte_range {
            builder = builder.header("Range", format!("bytes={from}-{}", to.saturating_sub(1)));
        }
        if !compress {
            builder = builder.header("Accept-Encoding", "identity");
        }

        let request = builder.send();
        tokio::select! {
            _ = token.cancelled() => FetchOutcome::Cancelled,
            result = request => match result {
                Ok(response) => {
                    if !response.status().is_success() {
                        return FetchOutcome::Failed(HlsError::from_status(response.status(), uri.to_string()));
                    }
                    match response.bytes().await {
                        Ok(bytes) => FetchOutcome::Completed {
                            bytes: bytes.to_vec(),
                            timing: FetchTiming { start, stop: Instant::now() },
                        },
                        Err(e) => FetchOutcome::Failed(HlsError::from(e)),
                    }
                }
                Err(e) => FetchOutcome::Failed(HlsError::from(e)),
            },
        }
    }
}

#[async_trait]
impl UriDownloader for HttpUriDownloader {
    async fn fetch(
        &self,
        uri: &str,
        compress: bool,
        _allow_cache: bool,
        token: &CancellationToken,
    ) -> FetchOutcome {
        self.do_fetch(uri, None, compress, token).await
    }

    async fn fetch_fragment(
        &self,
        fragment: &Fragment,
        compress: bool,
        _allow_cache: bool,
        token: &CancellationToken,
    ) -> FetchOutcome {
        self.do_fetch(&fragment.uri, fragment.byte_range, compress, token)
            .await
    }

    async fn prepare(&self, uri: &str) {
        // Best-effort connection warm-up; failures are not surfaced, matching
        // the original's fire-and-forget `prepare` semantics.
        let _ = self.client.head(uri).send().await;
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    /// Canned-outcome test double used across the engine's test modules.
    pub struct MockUriDownloader {
        outcomes: Mutex<Vec<FetchOutcome>>,
        pub fetch_calls: Mutex<Vec<String>>,
    }

    impl MockUriDownloader {
        pub fn new(outcomes: Vec<FetchOutcome>) -> Self {
            // Outcomes are consumed front-to-back.
            let mut outcomes = outcomes;
            outcomes.reverse();
            Self {
                outcomes: Mutex::new(outcomes),
                fetch_calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl UriDownloader for MockUriDownloader {
        async fn fetch(
            &self,
            uri: &str,
            _compress: bool,
            _allow_cache: bool,
            _token: &CancellationToken,
        ) -> FetchOutcome {
            self.fetch_calls.lock().unwrap().push(uri.to_string());
            self.outcomes.lock().unwrap().pop().unwrap_or(FetchOutcome::Void)
        }

        async fn fetch_fragment(
            &self,
            fragment: &Fragment,
            _compress: bool,
            _allow_cache: bool,
            _token: &CancellationToken,
        ) -> FetchOutcome {
            self.fetch_calls.lock().unwrap().push(fragment.uri.clone());
            self.outcomes.lock().unwrap().pop().unwrap_or(FetchOutcome::Void)
        }
    }

    #[tokio::test]
    async fn mock_returns_outcomes_in_order() {
        let mock = MockUriDownloader::new(vec![
            FetchOutcome::Void,
            FetchOutcome::Cancelled,
        ]);
        let token = CancellationToken::new();
        assert!(matches!(mock.fetch("a", false, true, &token).await, FetchOutcome::Void));
        assert!(matches!(mock.fetch("b", false, true, &token).await, FetchOutcome::Cancelled));
        // Exhausted: defaults to Void.
        assert!(matches!(mock.fetch("c", false, true, &token).await, FetchOutcome::Void));
    }
}

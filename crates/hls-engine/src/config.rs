//! Ambient configuration: retry constants, buffer-ahead defaults, HTTP client settings.

use std::time::Duration;

/// `RETRY_TIME_BASE` from §4.4: constant wait below `retry_threshold`.
pub const RETRY_TIME_BASE: Duration = Duration::from_millis(500);
/// `RETRY_THRESHOLD` from §4.4: failure count at which backoff growth kicks in.
pub const RETRY_THRESHOLD: u32 = 6;
/// `RETRY_MAX` from §4.4: hard cap on the backoff wait.
pub const RETRY_MAX: Duration = Duration::from_secs(60);
/// Default `max_buffer_duration` recognized from the parent container (§6).
pub const DEFAULT_BUFFER_DURATION: Duration = Duration::from_secs(30);
/// Minimum validated position, below which the buffer-ahead gate never waits (§4.4 step 1).
pub const BUFFER_AHEAD_MIN_POSITION: Duration = Duration::from_secs(1);

/// Top-level configuration for an engine instance.
#[derive(Debug, Clone)]
pub struct HlsConfig {
    pub retry_time_base: Duration,
    pub retry_threshold: u32,
    pub retry_max: Duration,
    pub default_buffer_duration: Duration,
    pub user_agent: String,
    pub request_timeout: Duration,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            retry_time_base: RETRY_TIME_BASE,
            retry_threshold: RETRY_THRESHOLD,
            retry_max: RETRY_MAX,
            default_buffer_duration: DEFAULT_BUFFER_DURATION,
            user_agent: concat!("hls-engine/", env!("CARGO_PKG_VERSION")).to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl HlsConfig {
    pub fn builder() -> HlsConfigBuilder {
        HlsConfigBuilder::default()
    }
}

/// Builder for [`HlsConfig`], mirroring the rest of the workspace's
/// `with_*`-method builder convention.
#[derive(Debug, Default)]
pub struct HlsConfigBuilder {
    inner: OptionalConfig,
}

#[derive(Debug, Default)]
struct OptionalConfig {
    retry_time_base: Option<Duration>,
    retry_threshold: Option<u32>,
    retry_max: Option<Duration>,
    default_buffer_duration: Option<Duration>,
    user_agent: Option<String>,
    request_timeout: Option<Duration>,
}

impl HlsConfigBuilder {
    pub fn with_retry_time_base(mut self, d: Duration) -> Self {
        self.inner.retry_time_base = Some(d);
        self
    }

    pub fn with_retry_threshold(mut self, k: u32) -> Self {
        self.inner.retry_threshold = Some(k);
        self
    }

    pub fn with_retry_max(mut self, d: Duration) -> Self {
        self.inner.retry_max = Some(d);
        self
    }

    pub fn with_default_buffer_duration(mut self, d: Duration) -> Self {
        self.inner.default_buffer_duration = Some(d);
        self
    }

    pub fn with_user_agent(mut self, ua: impl Into<String>) -> Self {
        self.inner.user_agent = Some(ua.into());
        self
    }

    pub fn with_request_timeout(mut self, d: Duration) -> Self {
        self.inner.request_timeout = Some(d);
        self
    }

    pub fn build(self) -> HlsConfig {
        let default = HlsConfig::default();
        HlsConfig {
            retry_time_base: self.inner.retry_time_base.unwrap_or(default.retry_time_base),
            retry_threshold: self.inner.retry_threshold.unwrap_or(default.retry_threshold),
            retry_max: self.inner.retry_max.unwrap_or(default.retry_max),
            default_buffer_duration: self
                .inner
                .default_buffer_duration
                .unwrap_or(default.default_buffer_duration),
            user_agent: self.inner.user_agent.unwrap_or(default.user_agent),
            request_timeout: self.inner.request_timeout.unwrap_or(default.request_timeout),
        }
    }
}

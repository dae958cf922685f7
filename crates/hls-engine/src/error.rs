//! Error taxonomy for the HLS fetch engine.

use reqwest::StatusCode;

/// Errors produced by any component of the fetch engine.
#[derive(Debug, thiserror::Error)]
pub enum HlsError {
    #[error("playlist bytes are not valid UTF-8")]
    InvalidUtf8,

    #[error("playlist is incomplete (missing #EXT-X-ENDLIST)")]
    PlaylistIncomplete,

    #[error("failed to parse playlist: {reason}")]
    PlaylistParseError { reason: String },

    #[error("resource not found: {uri}")]
    ResourceNotFound { uri: String },

    #[error("not authorized to fetch: {uri}")]
    NotAuthorized { uri: String },

    #[error("fetch failed for {uri}: {reason}")]
    FetchFailed { uri: String, reason: String },

    #[error("decryption error: {reason}")]
    DecryptError { reason: String },

    #[error("seek rejected: {reason}")]
    SeekRejected { reason: String },

    #[error("stream type could not be determined")]
    TypeNotFound,

    #[error("engine already paused")]
    AlreadyPaused,

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl HlsError {
    pub fn fetch_failed(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::FetchFailed {
            uri: uri.into(),
            reason: reason.into(),
        }
    }

    pub fn decrypt(reason: impl Into<String>) -> Self {
        Self::DecryptError {
            reason: reason.into(),
        }
    }

    pub fn from_status(status: StatusCode, uri: impl Into<String>) -> Self {
        let uri = uri.into();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Self::NotAuthorized { uri },
            StatusCode::NOT_FOUND => Self::ResourceNotFound { uri },
            _ => Self::FetchFailed {
                uri,
                reason: format!("HTTP {status}"),
            },
        }
    }

    /// Whether the fetch engine should retry this error with backoff rather
    /// than treat it as fatal.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::InvalidUtf8
            | Self::PlaylistParseError { .. }
            | Self::DecryptError { .. }
            | Self::SeekRejected { .. }
            | Self::TypeNotFound
            | Self::AlreadyPaused => false,
            Self::PlaylistIncomplete
            | Self::ResourceNotFound { .. }
            | Self::NotAuthorized { .. }
            | Self::FetchFailed { .. }
            | Self::Network { .. }
            | Self::Io { .. } => true,
        }
    }

    /// Whether this error should trigger an immediate playlist refresh and
    /// skip this round's backoff wait (§4.4 step 3).
    pub fn triggers_playlist_refresh(&self) -> bool {
        matches!(
            self,
            Self::NotAuthorized { .. } | Self::ResourceNotFound { .. }
        )
    }

    /// Whether this error is fatal to the stream (posted as an element error,
    /// terminating the engine rather than retrying).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidUtf8
                | Self::PlaylistParseError { .. }
                | Self::DecryptError { .. }
                | Self::TypeNotFound
        )
    }
}

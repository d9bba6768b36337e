use std::sync::Arc;

use reqwest::StatusCode;
use url::Url;

/// Errors produced while tracking playlists.
///
/// All variants are cheap to clone so the same error can be stored on a
/// bundle, surfaced to callers, and handed to listeners and telemetry.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TrackerError {
    #[error("load cancelled")]
    Cancelled,

    #[error("tracker already started")]
    AlreadyStarted,

    #[error("HTTP request failed: {source}")]
    Network { source: Arc<reqwest::Error> },

    #[error("request failed with HTTP {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("malformed playlist: {reason}")]
    MalformedPlaylist { reason: String },

    #[error("delta update could not be applied for {url}")]
    DeltaUpdateFailed { url: Url },

    #[error("loaded playlist has unexpected type for {url}")]
    UnexpectedPlaylistType { url: Url },

    #[error("media sequence jumped backwards for {url}")]
    PlaylistReset { url: Url },

    #[error("playlist stopped advancing for {url}")]
    PlaylistStuck { url: Url },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

pub type TrackerResult<T> = Result<T, TrackerError>;

impl TrackerError {
    pub fn network(source: reqwest::Error) -> Self {
        Self::Network {
            source: Arc::new(source),
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedPlaylist {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// The HTTP status behind this error, if there is one.
    pub fn response_code(&self) -> Option<StatusCode> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Network { source } => source.status(),
            _ => None,
        }
    }

    /// Whether another attempt at the same load can reasonably succeed.
    ///
    /// Malformed payloads and protocol misuse are permanent, and so are
    /// client statuses that will not change on a retry. Transport failures,
    /// server statuses, 408/429, and the resource-shaped statuses
    /// (404/410/416, which exclusion or a later window can cure) are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. }
            | Self::PlaylistReset { .. }
            | Self::PlaylistStuck { .. } => true,
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || matches!(status.as_u16(), 404 | 408 | 410 | 416 | 429)
            }
            Self::Cancelled
            | Self::AlreadyStarted
            | Self::MalformedPlaylist { .. }
            | Self::DeltaUpdateFailed { .. }
            | Self::UnexpectedPlaylistType { .. }
            | Self::Internal { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_is_retryable_and_exposes_code() {
        let err = TrackerError::HttpStatus {
            status: StatusCode::SERVICE_UNAVAILABLE,
            url: "https://example.com/a.m3u8".into(),
        };
        assert!(err.is_retryable());
        assert_eq!(err.response_code(), Some(StatusCode::SERVICE_UNAVAILABLE));
    }

    #[test]
    fn client_statuses_are_fatal_unless_resource_shaped() {
        let status = |code: u16| TrackerError::HttpStatus {
            status: StatusCode::from_u16(code).unwrap(),
            url: "https://example.com/a.m3u8".into(),
        };
        assert!(!status(401).is_retryable());
        assert!(!status(403).is_retryable());
        assert!(status(404).is_retryable());
        assert!(status(408).is_retryable());
        assert!(status(410).is_retryable());
        assert!(status(429).is_retryable());
        assert!(status(500).is_retryable());
    }

    #[test]
    fn parse_failures_are_permanent() {
        assert!(!TrackerError::malformed("bad tag").is_retryable());
        let url: Url = "https://example.com/a.m3u8".parse().unwrap();
        assert!(!TrackerError::DeltaUpdateFailed { url }.is_retryable());
    }
}

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

/// Default coefficient applied to the target duration to decide that a
/// non-advancing live playlist is stuck.
pub const DEFAULT_STUCK_TARGET_DURATION_COEFFICIENT: f64 = 3.5;

pub const DEFAULT_USER_AGENT: &str = concat!("hls-tracker/", env!("CARGO_PKG_VERSION"));

/// Behavioral knobs of the tracker itself.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Multiplier on the target duration after which an unchanged live
    /// playlist is reported as stuck.
    pub stuck_target_duration_coefficient: f64,
    /// Lower bound of the snapshot validity window for live playlists.
    /// A live snapshot is served as valid for at least this long after its
    /// last successful load, regardless of how short the playlist is.
    pub snapshot_validity_floor: Duration,
    /// Extra headers attached to every playlist request.
    pub request_headers: HeaderMap,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            stuck_target_duration_coefficient: DEFAULT_STUCK_TARGET_DURATION_COEFFICIENT,
            snapshot_validity_floor: Duration::from_secs(30),
            request_headers: HeaderMap::new(),
        }
    }
}

/// Configuration for the built-in reqwest-backed playlist source.
#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    /// Overall timeout for a single playlist request. Blocking reloads can
    /// legitimately be held by the server for up to a target duration, so
    /// this must comfortably exceed the longest expected hold.
    pub request_timeout: Duration,

    /// Connection timeout (time to establish the initial connection).
    pub connect_timeout: Duration,

    /// User agent string.
    pub user_agent: String,

    /// Default headers merged into every request.
    pub headers: HeaderMap,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: HttpSourceConfig::default_headers(),
        }
    }
}

impl HttpSourceConfig {
    pub fn default_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static(
                "application/vnd.apple.mpegurl,application/x-mpegurl,*/*;q=0.8",
            ),
        );
        headers
    }
}

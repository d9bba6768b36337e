// Listener and telemetry surfaces. Load events are observability only and
// never alter control flow; playlist listeners participate in exclusion
// decisions through the narrow context they are handed.

use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::error::TrackerError;
use crate::playlist::MediaPlaylist;
use crate::policy::LoadErrorInfo;

/// Identifies a registered [`PlaylistEventListener`].
pub type ListenerId = u64;

/// Telemetry describing one load (or one attempt of it).
#[derive(Debug, Clone)]
pub struct LoadEventInfo {
    /// Stable across retries of the same load.
    pub task_id: u64,
    /// The request URI, including any delivery directives.
    pub uri: Url,
    pub load_duration: Duration,
    pub bytes_loaded: u64,
}

/// Telemetry sink for playlist loads.
pub trait LoadEventDispatcher: Send + Sync {
    fn load_started(&self, _info: &LoadEventInfo, _retry_count: u32) {}
    fn load_completed(&self, _info: &LoadEventInfo) {}
    fn load_canceled(&self, _info: &LoadEventInfo) {}
    fn load_error(&self, _info: &LoadEventInfo, _error: &TrackerError, _was_canceled: bool) {}
}

/// Dispatcher that drops every event.
pub struct NullEventDispatcher;

impl LoadEventDispatcher for NullEventDispatcher {}

/// Receives every refresh of the primary playlist. When this fires, the
/// tracker's primary snapshot is already the delivered snapshot.
pub trait PrimaryPlaylistListener: Send + Sync {
    fn on_primary_playlist_refreshed(&self, snapshot: Arc<MediaPlaylist>);
}

/// Exclusion capability handed to listeners during error dispatch, so a
/// listener can exclude the failing playlist from within the callback.
pub trait PlaylistExclusion {
    /// Excludes the playlist for the given duration. Returns `true` iff the
    /// playlist was excluded, i.e. it was not the primary with no fallback
    /// variant left to promote.
    fn exclude_media_playlist(&mut self, url: &Url, exclusion_duration: Duration) -> bool;
}

/// Observer of playlist changes and errors. Callbacks run synchronously on
/// the tracker's driver task and must not block.
pub trait PlaylistEventListener: Send + Sync {
    /// A snapshot changed for some tracked playlist.
    fn on_playlist_changed(&self) {}

    /// A playlist failed to refresh. Return `true` if the error was handled
    /// by excluding the playlist; returning `false` asks the tracker to keep
    /// retrying the load instead. `force_retry` indicates the tracker will
    /// retry regardless and exclusion would be counterproductive.
    fn on_playlist_error(
        &self,
        url: &Url,
        info: &LoadErrorInfo,
        force_retry: bool,
        exclusion: &mut dyn PlaylistExclusion,
    ) -> bool;
}

// Per-media-playlist state: the current snapshot, refresh bookkeeping, and
// delivery-directive request URIs. The driver owns every bundle and runs all
// transitions; this module keeps the state plus the pure pieces (URI
// construction, validity) so they can be tested in isolation.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use url::Url;

use crate::error::{TrackerError, TrackerResult};
use crate::loader::PlaylistLoader;
use crate::playlist::{MediaPlaylist, PlaylistType};

/// RFC 8216 §6.2.5 delivery-directive query parameters.
pub(crate) const BLOCK_MSN_PARAM: &str = "_HLS_msn";
pub(crate) const BLOCK_PART_PARAM: &str = "_HLS_part";
pub(crate) const SKIP_PARAM: &str = "_HLS_skip";

pub(crate) struct MediaPlaylistBundle {
    pub url: Url,
    pub loader: PlaylistLoader,
    pub snapshot: Option<Arc<MediaPlaylist>>,
    pub last_snapshot_load: Option<Instant>,
    pub last_snapshot_change: Option<Instant>,
    /// Loads requested before this instant are deferred, not dropped. May
    /// sit in the past, which means "load immediately".
    pub earliest_next_load: Option<Instant>,
    pub exclude_until: Option<Instant>,
    /// A deferred load is armed; its request URI is parked here until the
    /// timer fires.
    pub load_pending: bool,
    pub pending_request_uri: Option<Url>,
    pub playlist_error: Option<TrackerError>,
    pub active_for_playback: bool,
}

impl MediaPlaylistBundle {
    pub fn new(url: Url, min_retry_count: u32) -> Self {
        Self {
            url,
            loader: PlaylistLoader::new(min_retry_count),
            snapshot: None,
            last_snapshot_load: None,
            last_snapshot_change: None,
            earliest_next_load: None,
            exclude_until: None,
            load_pending: false,
            pending_request_uri: None,
            playlist_error: None,
            active_for_playback: false,
        }
    }

    /// Whether fallback selection must skip this bundle right now.
    pub fn is_excluded(&self, now: Instant) -> bool {
        self.exclude_until.is_some_and(|until| until > now)
    }

    /// Whether the snapshot can still be served to consumers: finished
    /// playlists always can, live ones only within a freshness window of
    /// `max(floor, playlist duration)` since the last load.
    pub fn is_snapshot_valid(&self, now: Instant, validity_floor: Duration) -> bool {
        let Some(snapshot) = &self.snapshot else {
            return false;
        };
        if snapshot.has_end_tag
            || matches!(
                snapshot.playlist_type,
                PlaylistType::Event | PlaylistType::Vod
            )
        {
            return true;
        }
        let validity = validity_floor.max(Duration::from_micros(snapshot.duration_us.max(0) as u64));
        self.last_snapshot_load
            .is_some_and(|loaded_at| loaded_at + validity > now)
    }

    /// Surfaces the loader's accumulated error or a stored playlist error.
    pub fn maybe_error(&self) -> TrackerResult<()> {
        self.loader.maybe_error()?;
        match &self.playlist_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    /// The reload URI with delivery directives derived from the current
    /// snapshot. Deterministic: the same snapshot always yields the same
    /// URI, and a snapshot without server-control support yields the plain
    /// playlist URL.
    pub fn reload_uri(&self) -> Url {
        let Some(snapshot) = &self.snapshot else {
            return self.url.clone();
        };
        let control = &snapshot.server_control;
        if control.skip_until.is_none() && !control.can_block_reload {
            return self.url.clone();
        }
        let mut uri = self.url.clone();
        {
            let mut query = uri.query_pairs_mut();
            if control.can_block_reload {
                let target_sequence = snapshot.media_sequence + snapshot.segments.len() as u64;
                query.append_pair(BLOCK_MSN_PARAM, &target_sequence.to_string());
                if snapshot.part_target_duration.is_some() {
                    let mut target_part = snapshot.trailing_parts.len();
                    if snapshot
                        .trailing_parts
                        .last()
                        .is_some_and(|part| part.is_preload)
                    {
                        // The trailing preload hint is not a published part.
                        target_part -= 1;
                    }
                    query.append_pair(BLOCK_PART_PARAM, &target_part.to_string());
                }
            }
            if control.skip_until.is_some() {
                query.append_pair(
                    SKIP_PARAM,
                    if control.can_skip_date_ranges {
                        "v2"
                    } else {
                        "YES"
                    },
                );
            }
        }
        uri
    }
}

/// Whether a request URI carried a blocking-reload directive.
pub(crate) fn is_blocking_request(uri: &Url) -> bool {
    uri.query_pairs().any(|(key, _)| key == BLOCK_MSN_PARAM)
}

#[cfg(test)]
mod tests {
    use crate::playlist::MediaPart;
    use crate::test_utils::MediaPlaylistBuilder;

    use super::*;

    fn bundle_with(snapshot: Arc<MediaPlaylist>) -> MediaPlaylistBundle {
        let mut bundle =
            MediaPlaylistBundle::new("https://example.com/a.m3u8".parse().unwrap(), 3);
        bundle.snapshot = Some(snapshot);
        bundle
    }

    #[test]
    fn plain_url_without_server_control() {
        let bundle = bundle_with(
            MediaPlaylistBuilder::new()
                .media_sequence(100)
                .segments(4, Duration::from_secs(4))
                .build_arc(),
        );
        assert_eq!(bundle.reload_uri(), bundle.url);

        let empty = MediaPlaylistBundle::new(bundle.url.clone(), 3);
        assert_eq!(empty.reload_uri(), empty.url);
    }

    #[test]
    fn blocking_reload_requests_the_next_sequence() {
        let bundle = bundle_with(
            MediaPlaylistBuilder::new()
                .media_sequence(100)
                .segments(4, Duration::from_secs(6))
                .can_block_reload()
                .build_arc(),
        );
        let uri = bundle.reload_uri();
        assert_eq!(uri.query(), Some("_HLS_msn=104"));
    }

    #[test]
    fn part_directive_skips_the_trailing_preload_hint() {
        let parts = vec![
            MediaPart {
                uri: "a.100.0.mp4".into(),
                duration_us: 500_000,
                is_preload: false,
            },
            MediaPart {
                uri: "a.100.1.mp4".into(),
                duration_us: 500_000,
                is_preload: true,
            },
        ];
        let bundle = bundle_with(
            MediaPlaylistBuilder::new()
                .media_sequence(100)
                .segments(4, Duration::from_secs(6))
                .can_block_reload()
                .part_target_duration(Duration::from_millis(500))
                .trailing_parts(parts)
                .build_arc(),
        );
        let uri = bundle.reload_uri();
        assert_eq!(uri.query(), Some("_HLS_msn=104&_HLS_part=1"));
    }

    #[test]
    fn skip_directive_uses_v2_only_for_date_range_skipping() {
        let plain_skip = bundle_with(
            MediaPlaylistBuilder::new()
                .media_sequence(100)
                .segments(4, Duration::from_secs(6))
                .skip_until(Duration::from_secs(36))
                .build_arc(),
        );
        assert_eq!(plain_skip.reload_uri().query(), Some("_HLS_skip=YES"));

        let v2_skip = bundle_with(
            MediaPlaylistBuilder::new()
                .media_sequence(100)
                .segments(4, Duration::from_secs(6))
                .skip_until(Duration::from_secs(36))
                .can_skip_date_ranges()
                .build_arc(),
        );
        assert_eq!(v2_skip.reload_uri().query(), Some("_HLS_skip=v2"));
    }

    #[test]
    fn reload_uri_is_idempotent() {
        let bundle = bundle_with(
            MediaPlaylistBuilder::new()
                .media_sequence(100)
                .segments(4, Duration::from_secs(6))
                .can_block_reload()
                .skip_until(Duration::from_secs(36))
                .build_arc(),
        );
        assert_eq!(bundle.reload_uri(), bundle.reload_uri());
        assert!(is_blocking_request(&bundle.reload_uri()));
        assert!(!is_blocking_request(&bundle.url));
    }

    #[tokio::test(start_paused = true)]
    async fn live_snapshots_expire_after_the_validity_window() {
        let mut bundle = bundle_with(
            MediaPlaylistBuilder::new()
                .media_sequence(100)
                .segments(3, Duration::from_secs(4))
                .build_arc(),
        );
        let floor = Duration::from_secs(30);
        let loaded_at = Instant::now();
        bundle.last_snapshot_load = Some(loaded_at);

        // Playlist is 12s long, so the 30s floor governs.
        assert!(bundle.is_snapshot_valid(loaded_at + Duration::from_secs(29), floor));
        assert!(!bundle.is_snapshot_valid(loaded_at + Duration::from_secs(31), floor));
    }

    #[tokio::test(start_paused = true)]
    async fn long_playlists_extend_the_validity_window() {
        let mut bundle = bundle_with(
            MediaPlaylistBuilder::new()
                .media_sequence(0)
                .segments(20, Duration::from_secs(4))
                .build_arc(),
        );
        let floor = Duration::from_secs(30);
        let loaded_at = Instant::now();
        bundle.last_snapshot_load = Some(loaded_at);

        // 80s of content outlives the floor.
        assert!(bundle.is_snapshot_valid(loaded_at + Duration::from_secs(79), floor));
        assert!(!bundle.is_snapshot_valid(loaded_at + Duration::from_secs(81), floor));
    }

    #[tokio::test(start_paused = true)]
    async fn finished_playlists_never_expire() {
        let mut vod = bundle_with(
            MediaPlaylistBuilder::new()
                .playlist_type(PlaylistType::Vod)
                .segments(3, Duration::from_secs(4))
                .build_arc(),
        );
        vod.last_snapshot_load = Some(Instant::now());
        let far = Instant::now() + Duration::from_secs(3600);
        assert!(vod.is_snapshot_valid(far, Duration::from_secs(30)));

        let ended = bundle_with(
            MediaPlaylistBuilder::new()
                .segments(3, Duration::from_secs(4))
                .end_tag()
                .build_arc(),
        );
        assert!(ended.is_snapshot_valid(far, Duration::from_secs(30)));
    }
}

// Typed playlist model consumed and produced by the tracker. Parsing bytes
// into these structures is the parser's job; the tracker only derives
// cross-snapshot state (start time, discontinuity sequence, end tag).

use std::collections::HashMap;
use std::time::Duration;

use url::Url;

/// Playlist type as signaled by `EXT-X-PLAYLIST-TYPE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaylistType {
    /// No playlist type tag: a live sliding window.
    #[default]
    Live,
    Event,
    Vod,
}

/// One variant entry of a multivariant playlist. Ordering inside
/// [`MultivariantPlaylist::variants`] defines fallback priority.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    /// Absolute media playlist URL of this variant.
    pub url: Url,
    pub bandwidth: Option<u64>,
    pub codecs: Option<String>,
    pub name: Option<String>,
}

impl Variant {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            bandwidth: None,
            codecs: None,
            name: None,
        }
    }
}

/// A parsed multivariant (master) playlist. Immutable once loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct MultivariantPlaylist {
    /// URI against which relative playlist URIs were resolved.
    pub base_uri: Url,
    pub variants: Vec<Variant>,
    /// All media playlist URLs (variants plus alternate renditions) in
    /// insertion order, deduplicated.
    pub media_playlist_urls: Vec<Url>,
}

impl MultivariantPlaylist {
    pub fn new(base_uri: Url, variants: Vec<Variant>, rendition_urls: Vec<Url>) -> Self {
        let mut media_playlist_urls: Vec<Url> = Vec::with_capacity(variants.len());
        for url in variants
            .iter()
            .map(|v| v.url.clone())
            .chain(rendition_urls)
        {
            if !media_playlist_urls.contains(&url) {
                media_playlist_urls.push(url);
            }
        }
        Self {
            base_uri,
            variants,
            media_playlist_urls,
        }
    }

    /// Wraps a directly-loaded media playlist in a synthetic single-variant
    /// multivariant playlist, so the rest of the tracker never special-cases
    /// media-playlist bootstraps.
    pub fn single_variant(url: Url) -> Self {
        Self::new(url.clone(), vec![Variant::new(url)], Vec::new())
    }
}

/// One media segment, with timing relative to the snapshot it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaSegment {
    pub uri: String,
    pub duration_us: i64,
    /// Start time relative to the snapshot's start time.
    pub relative_start_time_us: i64,
    /// Discontinuity sequence relative to the snapshot's.
    pub relative_discontinuity_sequence: i32,
}

/// A trailing low-latency partial segment.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaPart {
    pub uri: String,
    pub duration_us: i64,
    /// Whether this is an `EXT-X-PRELOAD-HINT` rather than a published part.
    /// Only the trailing part may carry this flag.
    pub is_preload: bool,
}

/// `EXT-X-SERVER-CONTROL` attributes. `None` means the attribute was absent.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServerControl {
    pub can_block_reload: bool,
    pub can_skip_date_ranges: bool,
    pub skip_until: Option<Duration>,
    pub hold_back: Option<Duration>,
    pub part_hold_back: Option<Duration>,
}

/// `EXT-X-RENDITION-REPORT`: the server's view of a sibling playlist's tip,
/// used to seed blocking reloads when the primary changes.
#[derive(Debug, Clone, PartialEq)]
pub struct RenditionReport {
    pub last_media_sequence: u64,
    pub last_part_index: Option<u64>,
}

/// An immutable media playlist snapshot plus its derived timeline anchors.
///
/// Successive snapshots replace each other; they are shared as
/// `Arc<MediaPlaylist>` and never mutated, so reference equality identifies
/// "the snapshot did not change".
#[derive(Debug, Clone, PartialEq)]
pub struct MediaPlaylist {
    pub media_sequence: u64,
    /// Signed because cross-playlist correction subtracts relative sequences.
    pub discontinuity_sequence: i32,
    pub target_duration: Duration,
    pub part_target_duration: Option<Duration>,
    /// Derived start time on the session timeline, microseconds.
    pub start_time_us: i64,
    /// Sum of all segment durations, microseconds.
    pub duration_us: i64,
    pub has_end_tag: bool,
    pub has_program_date_time: bool,
    pub has_discontinuity_sequence: bool,
    pub playlist_type: PlaylistType,
    pub segments: Vec<MediaSegment>,
    pub trailing_parts: Vec<MediaPart>,
    pub server_control: ServerControl,
    pub rendition_reports: HashMap<Url, RenditionReport>,
}

impl MediaPlaylist {
    /// End time of the last segment on the session timeline, microseconds.
    pub fn end_time_us(&self) -> i64 {
        self.start_time_us + self.duration_us
    }

    /// Whether this snapshot supersedes `other`.
    ///
    /// Compares media sequence, then segment count, then trailing-part
    /// count; with all equal, a freshly appeared end tag still counts as
    /// newer. Always newer than no snapshot at all.
    pub fn is_newer_than(&self, other: Option<&MediaPlaylist>) -> bool {
        let Some(other) = other else {
            return true;
        };
        if self.media_sequence != other.media_sequence {
            return self.media_sequence > other.media_sequence;
        }
        if self.segments.len() != other.segments.len() {
            return self.segments.len() > other.segments.len();
        }
        if self.trailing_parts.len() != other.trailing_parts.len() {
            return self.trailing_parts.len() > other.trailing_parts.len();
        }
        self.has_end_tag && !other.has_end_tag
    }

    /// A copy of this snapshot with its timeline anchors overridden.
    pub fn copy_with(&self, start_time_us: i64, discontinuity_sequence: i32) -> MediaPlaylist {
        MediaPlaylist {
            start_time_us,
            discontinuity_sequence,
            ..self.clone()
        }
    }

    /// A copy of this snapshot with the end tag set.
    pub fn copy_with_end_tag(&self) -> MediaPlaylist {
        MediaPlaylist {
            has_end_tag: true,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::test_utils::MediaPlaylistBuilder;

    use super::*;

    fn url(s: &str) -> Url {
        s.parse().unwrap()
    }

    #[test]
    fn single_variant_wraps_the_url() {
        let mv = MultivariantPlaylist::single_variant(url("https://example.com/chunks.m3u8"));
        assert_eq!(mv.variants.len(), 1);
        assert_eq!(mv.media_playlist_urls, vec![mv.variants[0].url.clone()]);
        assert_eq!(mv.base_uri, mv.variants[0].url);
    }

    #[test]
    fn media_playlist_urls_are_deduplicated_in_order() {
        let a = url("https://example.com/a.m3u8");
        let b = url("https://example.com/b.m3u8");
        let audio = url("https://example.com/audio.m3u8");
        let mv = MultivariantPlaylist::new(
            url("https://example.com/master.m3u8"),
            vec![Variant::new(a.clone()), Variant::new(b.clone())],
            vec![audio.clone(), a.clone()],
        );
        assert_eq!(mv.media_playlist_urls, vec![a, b, audio]);
    }

    #[test]
    fn newer_by_media_sequence_then_counts() {
        let base = MediaPlaylistBuilder::new()
            .media_sequence(10)
            .segments(3, Duration::from_secs(4))
            .build();
        let advanced = MediaPlaylistBuilder::new()
            .media_sequence(11)
            .segments(3, Duration::from_secs(4))
            .build();
        let grown = MediaPlaylistBuilder::new()
            .media_sequence(10)
            .segments(4, Duration::from_secs(4))
            .build();

        assert!(advanced.is_newer_than(Some(&base)));
        assert!(!base.is_newer_than(Some(&advanced)));
        assert!(grown.is_newer_than(Some(&base)));
        assert!(base.is_newer_than(None));
        assert!(!base.is_newer_than(Some(&base)));
    }

    #[test]
    fn end_tag_breaks_the_tie_when_counts_match() {
        let live = MediaPlaylistBuilder::new()
            .media_sequence(10)
            .segments(3, Duration::from_secs(4))
            .build();
        let ended = MediaPlaylistBuilder::new()
            .media_sequence(10)
            .segments(3, Duration::from_secs(4))
            .end_tag()
            .build();
        assert!(ended.is_newer_than(Some(&live)));
        assert!(!live.is_newer_than(Some(&ended)));
    }

    #[test]
    fn end_time_is_start_plus_duration() {
        let playlist = MediaPlaylistBuilder::new()
            .start_time_us(1_000_000)
            .segments(3, Duration::from_secs(4))
            .build();
        assert_eq!(playlist.end_time_us(), 1_000_000 + 12_000_000);
    }

    #[test]
    fn copies_override_only_what_they_claim() {
        let playlist = MediaPlaylistBuilder::new()
            .media_sequence(7)
            .segments(2, Duration::from_secs(2))
            .build();
        let shifted = playlist.copy_with(5_000_000, 3);
        assert_eq!(shifted.start_time_us, 5_000_000);
        assert_eq!(shifted.discontinuity_sequence, 3);
        assert_eq!(shifted.media_sequence, 7);
        assert_eq!(shifted.segments, playlist.segments);

        let ended = playlist.copy_with_end_tag();
        assert!(ended.has_end_tag);
        assert_eq!(ended.media_sequence, playlist.media_sequence);
    }
}

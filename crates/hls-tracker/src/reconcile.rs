// Stitches a freshly loaded media playlist onto the previous snapshot of the
// same URL, producing the snapshot the rest of the session observes. Pure:
// no clock, no I/O, no state.

use std::sync::Arc;

use crate::playlist::{MediaPlaylist, MediaSegment};

/// Reconciles `loaded` against the bundle's previous snapshot and the
/// primary playlist's snapshot.
///
/// Returns the previous snapshot (by reference) when the loaded playlist is
/// not newer, so callers can detect "unchanged" via `Arc::ptr_eq`. A loaded
/// playlist that is not newer but carries an end tag yields the old snapshot
/// with the end tag appended: some servers reset the media sequence when
/// appending the end tag, and this is the best consistent reading of that.
pub fn reconcile(
    old: Option<&Arc<MediaPlaylist>>,
    loaded: &Arc<MediaPlaylist>,
    primary: Option<&Arc<MediaPlaylist>>,
) -> Arc<MediaPlaylist> {
    if let Some(old) = old {
        if !loaded.is_newer_than(Some(old)) {
            return if loaded.has_end_tag && !old.has_end_tag {
                Arc::new(old.copy_with_end_tag())
            } else {
                Arc::clone(old)
            };
        }
    }
    let start_time_us = loaded_start_time_us(old, loaded, primary);
    let discontinuity_sequence = loaded_discontinuity_sequence(old, loaded, primary);
    Arc::new(loaded.copy_with(start_time_us, discontinuity_sequence))
}

fn loaded_start_time_us(
    old: Option<&Arc<MediaPlaylist>>,
    loaded: &MediaPlaylist,
    primary: Option<&Arc<MediaPlaylist>>,
) -> i64 {
    if loaded.has_program_date_time {
        return loaded.start_time_us;
    }
    let primary_start_time_us = primary.map_or(0, |p| p.start_time_us);
    let Some(old) = old else {
        return primary_start_time_us;
    };
    if let Some(overlap) = first_old_overlapping_segment(old, loaded) {
        return old.start_time_us + overlap.relative_start_time_us;
    }
    let sequence_advance = loaded.media_sequence.saturating_sub(old.media_sequence);
    if old.segments.len() as u64 == sequence_advance {
        // The new window starts exactly where the old one ended.
        return old.end_time_us();
    }
    // No overlap at all: assume the new window coincides with the primary.
    primary_start_time_us
}

fn loaded_discontinuity_sequence(
    old: Option<&Arc<MediaPlaylist>>,
    loaded: &MediaPlaylist,
    primary: Option<&Arc<MediaPlaylist>>,
) -> i32 {
    if loaded.has_discontinuity_sequence {
        return loaded.discontinuity_sequence;
    }
    // TODO: cross-playlist adjustment without an overlap is a guess; a
    // program-date-time or explicit discontinuity sequence would pin it.
    let primary_discontinuity_sequence = primary.map_or(0, |p| p.discontinuity_sequence);
    let Some(old) = old else {
        return primary_discontinuity_sequence;
    };
    if let (Some(overlap), Some(first_loaded)) = (
        first_old_overlapping_segment(old, loaded),
        loaded.segments.first(),
    ) {
        return old.discontinuity_sequence + overlap.relative_discontinuity_sequence
            - first_loaded.relative_discontinuity_sequence;
    }
    primary_discontinuity_sequence
}

/// The old segment that the loaded playlist's first segment refers to, if
/// the two windows overlap.
fn first_old_overlapping_segment<'a>(
    old: &'a MediaPlaylist,
    loaded: &MediaPlaylist,
) -> Option<&'a MediaSegment> {
    let offset = loaded.media_sequence.checked_sub(old.media_sequence)?;
    old.segments.get(usize::try_from(offset).ok()?)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::test_utils::MediaPlaylistBuilder;

    use super::*;

    fn live_window(media_sequence: u64, segment_count: usize) -> MediaPlaylistBuilder {
        MediaPlaylistBuilder::new()
            .media_sequence(media_sequence)
            .segments(segment_count, Duration::from_secs(4))
    }

    #[test]
    fn stale_load_returns_the_old_snapshot_by_reference() {
        let old = live_window(100, 3).start_time_us(7).build_arc();
        let stale = live_window(99, 3).build_arc();
        let result = reconcile(Some(&old), &stale, None);
        assert!(Arc::ptr_eq(&result, &old));
    }

    #[test]
    fn end_tag_without_advance_is_appended_to_the_old_snapshot() {
        let old = live_window(100, 3).start_time_us(7).build_arc();
        // Server reset the media sequence while appending the end tag.
        let reset_with_end = live_window(0, 1).end_tag().build_arc();
        let result = reconcile(Some(&old), &reset_with_end, None);
        assert!(result.has_end_tag);
        assert_eq!(result.media_sequence, 100);
        assert_eq!(result.start_time_us, 7);
        assert!(!Arc::ptr_eq(&result, &old));
    }

    #[test]
    fn program_date_time_wins_over_everything() {
        let old = live_window(100, 3).start_time_us(50_000_000).build_arc();
        let loaded = live_window(102, 3)
            .program_date_time()
            .start_time_us(123_456)
            .build_arc();
        let result = reconcile(Some(&old), &loaded, None);
        assert_eq!(result.start_time_us, 123_456);
    }

    #[test]
    fn first_snapshot_inherits_the_primary_start_time() {
        let primary = live_window(40, 3).start_time_us(9_000_000).build_arc();
        let loaded = live_window(100, 3).build_arc();
        let result = reconcile(None, &loaded, Some(&primary));
        assert_eq!(result.start_time_us, 9_000_000);

        let without_primary = reconcile(None, &loaded, None);
        assert_eq!(without_primary.start_time_us, 0);
    }

    #[test]
    fn overlapping_windows_carry_the_old_timeline_forward() {
        // Old window: sequences 100..103 starting at 1s, 4s segments.
        let old = live_window(100, 3).start_time_us(1_000_000).build_arc();
        // New window starts at sequence 102 = old segment index 2.
        let loaded = live_window(102, 3).build_arc();
        let result = reconcile(Some(&old), &loaded, None);
        assert_eq!(result.start_time_us, 1_000_000 + 8_000_000);
    }

    #[test]
    fn exactly_abutting_windows_continue_at_the_old_end_time() {
        let old = live_window(100, 3).start_time_us(1_000_000).build_arc();
        let loaded = live_window(103, 3).build_arc();
        let result = reconcile(Some(&old), &loaded, None);
        assert_eq!(result.start_time_us, old.end_time_us());
    }

    #[test]
    fn disjoint_windows_fall_back_to_the_primary_start_time() {
        let primary = live_window(500, 3).start_time_us(77_000_000).build_arc();
        let old = live_window(100, 3).start_time_us(1_000_000).build_arc();
        let loaded = live_window(110, 3).build_arc();
        let result = reconcile(Some(&old), &loaded, Some(&primary));
        assert_eq!(result.start_time_us, 77_000_000);
    }

    #[test]
    fn explicit_discontinuity_sequence_is_kept() {
        let old = live_window(100, 3).discontinuity_sequence(4).build_arc();
        let loaded = live_window(102, 3)
            .explicit_discontinuity_sequence(9)
            .build_arc();
        let result = reconcile(Some(&old), &loaded, None);
        assert_eq!(result.discontinuity_sequence, 9);
    }

    #[test]
    fn overlap_corrects_the_discontinuity_sequence() {
        // Old discontinuity sequence 4; its third segment sits one
        // discontinuity further in.
        let old = live_window(100, 3)
            .discontinuity_sequence(4)
            .segment_relative_discontinuities(&[0, 0, 1])
            .build_arc();
        let loaded = live_window(102, 3)
            .segment_relative_discontinuities(&[0, 1, 1])
            .build_arc();
        let result = reconcile(Some(&old), &loaded, None);
        // 4 (old) + 1 (overlap offset) - 0 (first loaded) = 5.
        assert_eq!(result.discontinuity_sequence, 5);
    }

    #[test]
    fn discontinuity_falls_back_to_primary_without_overlap() {
        let primary = live_window(500, 3).discontinuity_sequence(7).build_arc();
        let old = live_window(100, 3).discontinuity_sequence(4).build_arc();
        let loaded = live_window(110, 3).build_arc();
        let result = reconcile(Some(&old), &loaded, Some(&primary));
        assert_eq!(result.discontinuity_sequence, 7);
    }

    #[test]
    fn reconcile_is_pure() {
        let old = live_window(100, 3).start_time_us(1_000_000).build_arc();
        let loaded = live_window(102, 3).build_arc();
        let primary = live_window(90, 3).start_time_us(5).build_arc();
        let first = reconcile(Some(&old), &loaded, Some(&primary));
        let second = reconcile(Some(&old), &loaded, Some(&primary));
        assert_eq!(*first, *second);
        assert_eq!(old.media_sequence, 100);
        assert_eq!(loaded.start_time_us, 0);
    }
}

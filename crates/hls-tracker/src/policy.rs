// Load-error handling strategy: retry delays, give-up decisions, and
// track/location fallback selection. The tracker treats this as an opaque
// strategy object; the default mirrors common player behavior with linear
// backoff and status-gated fallback.

use std::time::Duration;

use rand::Rng;

use crate::error::TrackerError;

/// Classes of data the tracker loads, for per-class retry tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadDataType {
    MultivariantPlaylist,
    MediaPlaylist,
}

/// A load error together with how many times this load has failed in a row.
#[derive(Debug, Clone)]
pub struct LoadErrorInfo {
    pub error: TrackerError,
    /// 1 on the first failure of a load.
    pub error_count: u32,
}

/// What can still be fallen back to when a load keeps failing.
#[derive(Debug, Clone, Copy)]
pub struct FallbackOptions {
    pub total_locations: usize,
    pub excluded_locations: usize,
    pub total_tracks: usize,
    pub excluded_tracks: usize,
}

impl FallbackOptions {
    /// Whether excluding one more of the given kind still leaves an option.
    pub fn is_fallback_available(&self, fallback_type: FallbackType) -> bool {
        match fallback_type {
            FallbackType::Location => self.excluded_locations + 1 < self.total_locations,
            FallbackType::Track => self.excluded_tracks + 1 < self.total_tracks,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackType {
    Location,
    Track,
}

#[derive(Debug, Clone, Copy)]
pub struct FallbackSelection {
    pub fallback_type: FallbackType,
    pub exclusion_duration: Duration,
}

/// Strategy consulted on every load start and failure.
pub trait LoadErrorHandlingPolicy: Send + Sync {
    /// Error count beyond which a still-retrying load surfaces its current
    /// error to blocking callers.
    fn minimum_loadable_retry_count(&self, data_type: LoadDataType) -> u32;

    /// Delay before the next attempt, or `None` to give up fatally.
    fn retry_delay(&self, info: &LoadErrorInfo) -> Option<Duration>;

    /// An exclusion to apply instead of (or before) retrying, if any.
    fn fallback_selection(
        &self,
        options: &FallbackOptions,
        info: &LoadErrorInfo,
    ) -> Option<FallbackSelection>;

    /// Called exactly once per load once it will not be retried again.
    fn on_load_task_concluded(&self, _task_id: u64) {}
}

/// Default policy: linear backoff capped at a maximum, optional bounded
/// jitter, fatal on permanent errors, fallback only for HTTP statuses that
/// indicate the resource (rather than the connection) is the problem.
#[derive(Debug, Clone)]
pub struct DefaultLoadErrorPolicy {
    /// Per-class minimum retry count before errors surface to callers.
    pub min_retry_count: u32,
    /// Backoff step: the n-th failure waits `base_delay * (n - 1)`.
    pub base_delay: Duration,
    /// Hard cap on the computed delay.
    pub max_delay: Duration,
    /// When true, adds random jitter of [0, base_delay/2) without ever
    /// exceeding `max_delay`.
    pub jitter: bool,
    pub track_exclusion_duration: Duration,
    pub location_exclusion_duration: Duration,
}

impl Default for DefaultLoadErrorPolicy {
    fn default() -> Self {
        Self {
            min_retry_count: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            jitter: false,
            track_exclusion_duration: Duration::from_secs(60),
            location_exclusion_duration: Duration::from_secs(5 * 60),
        }
    }
}

impl DefaultLoadErrorPolicy {
    fn delay_for_error_count(&self, error_count: u32) -> Duration {
        let steps = error_count.saturating_sub(1);
        let linear = self
            .base_delay
            .checked_mul(steps)
            .unwrap_or(self.max_delay);
        let capped = linear.min(self.max_delay);

        if !self.jitter {
            return capped;
        }

        // Jitter is bounded so the final delay never exceeds `max_delay`.
        let jitter_range_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX) / 2;
        let remaining_ms =
            u64::try_from(self.max_delay.saturating_sub(capped).as_millis()).unwrap_or(0);
        let jitter_limit_ms = jitter_range_ms.min(remaining_ms);
        if jitter_limit_ms == 0 {
            return capped;
        }
        let jitter_ms = rand::rng().random_range(0..jitter_limit_ms);
        (capped + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }

    fn is_eligible_for_fallback(error: &TrackerError) -> bool {
        matches!(
            error.response_code().map(|s| s.as_u16()),
            Some(403 | 404 | 410 | 416 | 500 | 503)
        )
    }
}

impl LoadErrorHandlingPolicy for DefaultLoadErrorPolicy {
    fn minimum_loadable_retry_count(&self, _data_type: LoadDataType) -> u32 {
        self.min_retry_count
    }

    fn retry_delay(&self, info: &LoadErrorInfo) -> Option<Duration> {
        if !info.error.is_retryable() {
            return None;
        }
        Some(self.delay_for_error_count(info.error_count))
    }

    fn fallback_selection(
        &self,
        options: &FallbackOptions,
        info: &LoadErrorInfo,
    ) -> Option<FallbackSelection> {
        if !Self::is_eligible_for_fallback(&info.error) {
            return None;
        }
        if options.is_fallback_available(FallbackType::Location) {
            Some(FallbackSelection {
                fallback_type: FallbackType::Location,
                exclusion_duration: self.location_exclusion_duration,
            })
        } else if options.is_fallback_available(FallbackType::Track) {
            Some(FallbackSelection {
                fallback_type: FallbackType::Track,
                exclusion_duration: self.track_exclusion_duration,
            })
        } else {
            None
        }
    }
}

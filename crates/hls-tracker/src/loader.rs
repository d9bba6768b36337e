// Single-flight playlist loader. One loader instance exists per load target
// (the multivariant bootstrap, and one per media playlist bundle); each
// allows at most one in-flight fetch, with retries and a sticky fatal error
// decided by the driver. Fetch work runs on spawned tasks; results come back
// to the driver as messages, guarded by a generation counter so anything
// cancelled or superseded is dropped on arrival.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HeaderMap;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{TrackerError, TrackerResult};
use crate::events::LoadEventInfo;
use crate::parser::{ParsedPlaylist, PlaylistParser};
use crate::source::{LoadRequest, PlaylistDataSource};

/// What a load was fetching, used to route its outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LoadTarget {
    Multivariant,
    Media(Url),
}

/// Decision taken after a load error.
#[derive(Debug, Clone)]
pub(crate) enum RetryDecision {
    RetryAfter(Duration),
    DontRetry,
    DontRetryFatal,
}

/// Completion message posted by a fetch task.
#[derive(Debug)]
pub(crate) struct LoadOutcome {
    pub target: LoadTarget,
    pub generation: u64,
    pub task_id: u64,
    pub request_uri: Url,
    pub load_duration: Duration,
    pub result: TrackerResult<(ParsedPlaylist, u64)>,
}

struct InFlight {
    cancel: CancellationToken,
    request_uri: Url,
    started_at: Instant,
}

pub(crate) struct PlaylistLoader {
    min_retry_count: u32,
    /// Bumped on every start and cancel; outcomes and retry timers carrying
    /// an older generation are stale.
    generation: u64,
    task_id: u64,
    in_flight: Option<InFlight>,
    retry_pending: bool,
    error_count: u32,
    current_error: Option<TrackerError>,
    fatal_error: Option<TrackerError>,
    released: bool,
}

impl PlaylistLoader {
    pub fn new(min_retry_count: u32) -> Self {
        Self {
            min_retry_count,
            generation: 0,
            task_id: 0,
            in_flight: None,
            retry_pending: false,
            error_count: 0,
            current_error: None,
            fatal_error: None,
            released: false,
        }
    }

    /// Whether a load is active, including the delay before a retry.
    pub fn is_loading(&self) -> bool {
        self.in_flight.is_some() || self.retry_pending
    }

    pub fn has_fatal_error(&self) -> bool {
        self.fatal_error.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    /// Surfaces the sticky fatal error, or the current transient error once
    /// it has recurred beyond the policy's minimum retry count.
    pub fn maybe_error(&self) -> TrackerResult<()> {
        if let Some(fatal) = &self.fatal_error {
            return Err(fatal.clone());
        }
        if let Some(current) = &self.current_error {
            if self.error_count > self.min_retry_count {
                return Err(current.clone());
            }
        }
        Ok(())
    }

    /// Spawns the fetch task for one attempt. Must not be called while a
    /// load is in flight; callers gate on [`Self::is_loading`].
    #[allow(clippy::too_many_arguments)]
    pub fn start_load(
        &mut self,
        task_id: u64,
        target: LoadTarget,
        request_uri: Url,
        headers: HeaderMap,
        source: Arc<dyn PlaylistDataSource>,
        parser: Box<dyn PlaylistParser>,
        outcome_tx: mpsc::UnboundedSender<LoadOutcome>,
    ) {
        debug_assert!(self.in_flight.is_none());
        if self.released {
            return;
        }
        self.generation += 1;
        self.task_id = task_id;
        self.retry_pending = false;

        let generation = self.generation;
        let cancel = CancellationToken::new();
        self.in_flight = Some(InFlight {
            cancel: cancel.clone(),
            request_uri: request_uri.clone(),
            started_at: Instant::now(),
        });

        tokio::spawn(async move {
            let started_at = Instant::now();
            let request = LoadRequest {
                uri: request_uri.clone(),
                headers,
                allow_gzip: true,
            };
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                result = load_and_parse(source, parser, &request) => result,
            };
            let _ = outcome_tx.send(LoadOutcome {
                target,
                generation,
                task_id,
                request_uri,
                load_duration: started_at.elapsed(),
                result,
            });
        });
    }

    /// Accepts an outcome if it belongs to the current load. Returns `false`
    /// for stale outcomes, which must be ignored entirely.
    pub fn accept(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.in_flight.is_none() {
            return false;
        }
        self.in_flight = None;
        true
    }

    /// Records a successful completion.
    pub fn on_success(&mut self) {
        self.error_count = 0;
        self.current_error = None;
    }

    /// Records a failed attempt and returns the new consecutive error count.
    pub fn note_error(&mut self, error: TrackerError) -> u32 {
        self.error_count += 1;
        self.current_error = Some(error);
        self.error_count
    }

    /// Arms the retry flag; the driver schedules the actual timer.
    pub fn set_retry_pending(&mut self) {
        self.retry_pending = true;
    }

    /// Consumes a fired retry timer. Returns `true` iff the retry is still
    /// wanted (same generation, not cancelled or superseded meanwhile).
    pub fn take_retry(&mut self, generation: u64) -> bool {
        if generation != self.generation || !self.retry_pending || self.released {
            return false;
        }
        self.retry_pending = false;
        true
    }

    /// Ends the current load without retrying; error state is reset.
    pub fn conclude(&mut self) {
        self.error_count = 0;
        self.current_error = None;
    }

    pub fn set_fatal(&mut self, error: TrackerError) {
        self.fatal_error = Some(error);
    }

    /// Cancels any in-flight load and disables further starts. Returns
    /// telemetry for the cancelled load, if one was in flight.
    pub fn release(&mut self) -> Option<LoadEventInfo> {
        self.released = true;
        self.retry_pending = false;
        self.generation += 1;
        let in_flight = self.in_flight.take()?;
        in_flight.cancel.cancel();
        Some(LoadEventInfo {
            task_id: self.task_id,
            uri: in_flight.request_uri,
            load_duration: in_flight.started_at.elapsed(),
            bytes_loaded: 0,
        })
    }
}

async fn load_and_parse(
    source: Arc<dyn PlaylistDataSource>,
    parser: Box<dyn PlaylistParser>,
    request: &LoadRequest,
) -> TrackerResult<(ParsedPlaylist, u64)> {
    let bytes = source.load(request).await?;
    let bytes_loaded = bytes.len() as u64;
    let parsed = parser.parse(&request.uri, &bytes)?;
    Ok((parsed, bytes_loaded))
}

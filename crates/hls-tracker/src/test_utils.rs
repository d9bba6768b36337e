// Reusable fixtures: snapshot builders, a scripted origin that stands in
// for both the data source and the parser, and recording observers. Public
// so integration tests and downstream consumers can drive a tracker without
// a real origin.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;
use url::Url;

use crate::error::{TrackerError, TrackerResult};
use crate::events::{
    LoadEventDispatcher, LoadEventInfo, PlaylistEventListener, PlaylistExclusion,
    PrimaryPlaylistListener,
};
use crate::parser::{ParsedPlaylist, PlaylistParser, PlaylistParserFactory};
use crate::playlist::{
    MediaPart, MediaPlaylist, MediaSegment, MultivariantPlaylist, PlaylistType, RenditionReport,
    ServerControl, Variant,
};
use crate::policy::LoadErrorInfo;
use crate::source::{LoadRequest, PlaylistDataSource};

/// Builds [`MediaPlaylist`] snapshots with realistic derived fields.
#[derive(Debug, Clone)]
pub struct MediaPlaylistBuilder {
    media_sequence: u64,
    discontinuity_sequence: i32,
    has_discontinuity_sequence: bool,
    target_duration: Duration,
    part_target_duration: Option<Duration>,
    start_time_us: i64,
    has_end_tag: bool,
    has_program_date_time: bool,
    playlist_type: PlaylistType,
    segment_durations_us: Vec<i64>,
    segment_relative_discontinuities: Vec<i32>,
    trailing_parts: Vec<MediaPart>,
    server_control: ServerControl,
    rendition_reports: HashMap<Url, RenditionReport>,
}

impl Default for MediaPlaylistBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaPlaylistBuilder {
    pub fn new() -> Self {
        Self {
            media_sequence: 0,
            discontinuity_sequence: 0,
            has_discontinuity_sequence: false,
            target_duration: Duration::from_secs(6),
            part_target_duration: None,
            start_time_us: 0,
            has_end_tag: false,
            has_program_date_time: false,
            playlist_type: PlaylistType::Live,
            segment_durations_us: Vec::new(),
            segment_relative_discontinuities: Vec::new(),
            trailing_parts: Vec::new(),
            server_control: ServerControl::default(),
            rendition_reports: HashMap::new(),
        }
    }

    pub fn media_sequence(mut self, media_sequence: u64) -> Self {
        self.media_sequence = media_sequence;
        self
    }

    /// Sets the discontinuity sequence value without marking it explicit,
    /// as if it had been derived by reconciliation.
    pub fn discontinuity_sequence(mut self, sequence: i32) -> Self {
        self.discontinuity_sequence = sequence;
        self
    }

    /// Sets an `EXT-X-DISCONTINUITY-SEQUENCE` the playlist itself carries.
    pub fn explicit_discontinuity_sequence(mut self, sequence: i32) -> Self {
        self.discontinuity_sequence = sequence;
        self.has_discontinuity_sequence = true;
        self
    }

    /// Appends `count` segments of equal duration and adopts that duration
    /// as the target duration.
    pub fn segments(mut self, count: usize, each: Duration) -> Self {
        let each_us = each.as_micros() as i64;
        self.segment_durations_us
            .extend(std::iter::repeat_n(each_us, count));
        self.segment_relative_discontinuities = vec![0; self.segment_durations_us.len()];
        self.target_duration = each;
        self
    }

    /// Overrides the per-segment relative discontinuity sequences; call
    /// after [`Self::segments`].
    pub fn segment_relative_discontinuities(mut self, relative: &[i32]) -> Self {
        assert_eq!(relative.len(), self.segment_durations_us.len());
        self.segment_relative_discontinuities = relative.to_vec();
        self
    }

    pub fn target_duration(mut self, target: Duration) -> Self {
        self.target_duration = target;
        self
    }

    pub fn part_target_duration(mut self, part_target: Duration) -> Self {
        self.part_target_duration = Some(part_target);
        self
    }

    pub fn trailing_parts(mut self, parts: Vec<MediaPart>) -> Self {
        self.trailing_parts = parts;
        self
    }

    pub fn start_time_us(mut self, start_time_us: i64) -> Self {
        self.start_time_us = start_time_us;
        self
    }

    pub fn end_tag(mut self) -> Self {
        self.has_end_tag = true;
        self
    }

    pub fn program_date_time(mut self) -> Self {
        self.has_program_date_time = true;
        self
    }

    pub fn playlist_type(mut self, playlist_type: PlaylistType) -> Self {
        self.playlist_type = playlist_type;
        self
    }

    pub fn can_block_reload(mut self) -> Self {
        self.server_control.can_block_reload = true;
        self
    }

    pub fn can_skip_date_ranges(mut self) -> Self {
        self.server_control.can_skip_date_ranges = true;
        self
    }

    pub fn skip_until(mut self, skip_until: Duration) -> Self {
        self.server_control.skip_until = Some(skip_until);
        self
    }

    pub fn rendition_report(mut self, url: &Url, sequence: u64, part: Option<u64>) -> Self {
        self.rendition_reports.insert(
            url.clone(),
            RenditionReport {
                last_media_sequence: sequence,
                last_part_index: part,
            },
        );
        self
    }

    pub fn build(self) -> MediaPlaylist {
        let mut segments = Vec::with_capacity(self.segment_durations_us.len());
        let mut elapsed_us = 0;
        for (index, duration_us) in self.segment_durations_us.iter().copied().enumerate() {
            segments.push(MediaSegment {
                uri: format!("segment_{}.ts", self.media_sequence + index as u64),
                duration_us,
                relative_start_time_us: elapsed_us,
                relative_discontinuity_sequence: self.segment_relative_discontinuities[index],
            });
            elapsed_us += duration_us;
        }
        MediaPlaylist {
            media_sequence: self.media_sequence,
            discontinuity_sequence: self.discontinuity_sequence,
            target_duration: self.target_duration,
            part_target_duration: self.part_target_duration,
            start_time_us: self.start_time_us,
            duration_us: elapsed_us,
            has_end_tag: self.has_end_tag,
            has_program_date_time: self.has_program_date_time,
            has_discontinuity_sequence: self.has_discontinuity_sequence,
            playlist_type: self.playlist_type,
            segments,
            trailing_parts: self.trailing_parts,
            server_control: self.server_control,
            rendition_reports: self.rendition_reports,
        }
    }

    pub fn build_arc(self) -> Arc<MediaPlaylist> {
        Arc::new(self.build())
    }
}

/// A multivariant playlist over the given variant URLs.
pub fn multivariant(base_uri: &Url, variant_urls: &[&Url]) -> Arc<MultivariantPlaylist> {
    let variants = variant_urls
        .iter()
        .map(|url| Variant::new((*url).clone()))
        .collect();
    Arc::new(MultivariantPlaylist::new(
        base_uri.clone(),
        variants,
        Vec::new(),
    ))
}

/// One request observed by the scripted origin.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub uri: Url,
    pub at: Instant,
}

#[derive(Default)]
struct OriginInner {
    scripts: Mutex<HashMap<Url, VecDeque<TrackerResult<ParsedPlaylist>>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

/// Scripted stand-in for the data source and parser factory.
///
/// Responses are queued per playlist URL (directives stripped for matching).
/// Transport-shaped errors surface from the source, parse-shaped errors from
/// the parser. An exhausted queue leaves the request hanging, which is how
/// tests stop an otherwise endless refresh loop.
#[derive(Clone, Default)]
pub struct ScriptedOrigin {
    inner: Arc<OriginInner>,
}

impl ScriptedOrigin {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(uri: &Url) -> Url {
        let mut key = uri.clone();
        key.set_query(None);
        key.set_fragment(None);
        key
    }

    pub fn enqueue(&self, url: &Url, result: TrackerResult<ParsedPlaylist>) {
        self.inner
            .scripts
            .lock()
            .unwrap()
            .entry(Self::key(url))
            .or_default()
            .push_back(result);
    }

    pub fn enqueue_media(&self, url: &Url, playlist: Arc<MediaPlaylist>) {
        self.enqueue(url, Ok(ParsedPlaylist::Media(playlist)));
    }

    pub fn enqueue_multivariant(&self, url: &Url, playlist: Arc<MultivariantPlaylist>) {
        self.enqueue(url, Ok(ParsedPlaylist::Multivariant(playlist)));
    }

    pub fn enqueue_error(&self, url: &Url, error: TrackerError) {
        self.enqueue(url, Err(error));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.inner.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, url: &Url) -> Vec<RecordedRequest> {
        let key = Self::key(url);
        self.requests()
            .into_iter()
            .filter(|request| Self::key(&request.uri) == key)
            .collect()
    }

    pub fn source(&self) -> Arc<dyn PlaylistDataSource> {
        Arc::new(ScriptedSource {
            inner: self.inner.clone(),
        })
    }

    pub fn parser_factory(&self) -> Arc<dyn PlaylistParserFactory> {
        Arc::new(ScriptedParserFactory {
            inner: self.inner.clone(),
        })
    }
}

fn is_parse_shaped(error: &TrackerError) -> bool {
    matches!(
        error,
        TrackerError::MalformedPlaylist { .. }
            | TrackerError::DeltaUpdateFailed { .. }
            | TrackerError::UnexpectedPlaylistType { .. }
    )
}

struct ScriptedSource {
    inner: Arc<OriginInner>,
}

#[async_trait]
impl PlaylistDataSource for ScriptedSource {
    async fn load(&self, request: &LoadRequest) -> TrackerResult<Bytes> {
        self.inner.requests.lock().unwrap().push(RecordedRequest {
            uri: request.uri.clone(),
            at: Instant::now(),
        });
        let key = ScriptedOrigin::key(&request.uri);
        let next = {
            let mut scripts = self.inner.scripts.lock().unwrap();
            match scripts.get_mut(&key) {
                Some(queue) => match queue.front() {
                    Some(Err(error)) if !is_parse_shaped(error) => {
                        Some(queue.pop_front().map(|entry| entry.map(|_| ())))
                    }
                    Some(_) => Some(None),
                    None => None,
                },
                None => None,
            }
        };
        match next {
            // Queue exhausted (or never scripted): hang until cancelled.
            None => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            Some(Some(Err(error))) => Err(error),
            _ => Ok(Bytes::new()),
        }
    }
}

struct ScriptedParser {
    inner: Arc<OriginInner>,
}

impl PlaylistParser for ScriptedParser {
    fn parse(&self, request_uri: &Url, _bytes: &[u8]) -> TrackerResult<ParsedPlaylist> {
        let key = ScriptedOrigin::key(request_uri);
        self.inner
            .scripts
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Err(TrackerError::internal(format!("no script for {key}"))))
    }
}

struct ScriptedParserFactory {
    inner: Arc<OriginInner>,
}

impl PlaylistParserFactory for ScriptedParserFactory {
    fn create_initial_parser(&self) -> Box<dyn PlaylistParser> {
        Box::new(ScriptedParser {
            inner: self.inner.clone(),
        })
    }

    fn create_media_parser(
        &self,
        _multivariant: &Arc<MultivariantPlaylist>,
        _previous: Option<&Arc<MediaPlaylist>>,
    ) -> Box<dyn PlaylistParser> {
        Box::new(ScriptedParser {
            inner: self.inner.clone(),
        })
    }
}

/// Records every primary playlist refresh.
#[derive(Default)]
pub struct RecordingPrimaryListener {
    snapshots: Mutex<Vec<Arc<MediaPlaylist>>>,
}

impl RecordingPrimaryListener {
    pub fn snapshots(&self) -> Vec<Arc<MediaPlaylist>> {
        self.snapshots.lock().unwrap().clone()
    }

    pub fn latest(&self) -> Option<Arc<MediaPlaylist>> {
        self.snapshots.lock().unwrap().last().cloned()
    }
}

impl PrimaryPlaylistListener for RecordingPrimaryListener {
    fn on_primary_playlist_refreshed(&self, snapshot: Arc<MediaPlaylist>) {
        self.snapshots.lock().unwrap().push(snapshot);
    }
}

/// What a [`RecordingEventListener`] does when asked about an error.
#[derive(Debug, Clone, Copy)]
pub enum ErrorReaction {
    /// Never exclude; ask the tracker to keep retrying.
    Decline,
    /// Exclude the failing playlist for this long.
    Exclude(Duration),
}

#[derive(Debug, Clone)]
pub struct RecordedError {
    pub url: Url,
    pub error: TrackerError,
    pub force_retry: bool,
}

/// Records change/error callbacks and reacts to errors as configured.
pub struct RecordingEventListener {
    reaction: ErrorReaction,
    changed: Mutex<u32>,
    errors: Mutex<Vec<RecordedError>>,
}

impl RecordingEventListener {
    pub fn declining() -> Arc<Self> {
        Arc::new(Self {
            reaction: ErrorReaction::Decline,
            changed: Mutex::new(0),
            errors: Mutex::new(Vec::new()),
        })
    }

    pub fn excluding(duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            reaction: ErrorReaction::Exclude(duration),
            changed: Mutex::new(0),
            errors: Mutex::new(Vec::new()),
        })
    }

    pub fn changed_count(&self) -> u32 {
        *self.changed.lock().unwrap()
    }

    pub fn errors(&self) -> Vec<RecordedError> {
        self.errors.lock().unwrap().clone()
    }
}

impl PlaylistEventListener for RecordingEventListener {
    fn on_playlist_changed(&self) {
        *self.changed.lock().unwrap() += 1;
    }

    fn on_playlist_error(
        &self,
        url: &Url,
        info: &LoadErrorInfo,
        force_retry: bool,
        exclusion: &mut dyn PlaylistExclusion,
    ) -> bool {
        self.errors.lock().unwrap().push(RecordedError {
            url: url.clone(),
            error: info.error.clone(),
            force_retry,
        });
        match self.reaction {
            ErrorReaction::Decline => false,
            ErrorReaction::Exclude(duration) => exclusion.exclude_media_playlist(url, duration),
        }
    }
}

/// Telemetry events captured by [`RecordingDispatcher`].
#[derive(Debug, Clone)]
pub enum DispatchedEvent {
    Started { uri: Url, retry_count: u32 },
    Completed { uri: Url },
    Canceled { uri: Url },
    Error { uri: Url, was_canceled: bool },
}

#[derive(Default)]
pub struct RecordingDispatcher {
    events: Mutex<Vec<DispatchedEvent>>,
}

impl RecordingDispatcher {
    pub fn events(&self) -> Vec<DispatchedEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl LoadEventDispatcher for RecordingDispatcher {
    fn load_started(&self, info: &LoadEventInfo, retry_count: u32) {
        self.events.lock().unwrap().push(DispatchedEvent::Started {
            uri: info.uri.clone(),
            retry_count,
        });
    }

    fn load_completed(&self, info: &LoadEventInfo) {
        self.events
            .lock()
            .unwrap()
            .push(DispatchedEvent::Completed {
                uri: info.uri.clone(),
            });
    }

    fn load_canceled(&self, info: &LoadEventInfo) {
        self.events.lock().unwrap().push(DispatchedEvent::Canceled {
            uri: info.uri.clone(),
        });
    }

    fn load_error(&self, info: &LoadEventInfo, _error: &TrackerError, was_canceled: bool) {
        self.events.lock().unwrap().push(DispatchedEvent::Error {
            uri: info.uri.clone(),
            was_canceled,
        });
    }
}

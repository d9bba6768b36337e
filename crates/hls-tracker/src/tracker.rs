// The tracker proper: a driver task that owns every bundle and serializes
// all state transitions, plus the public handle that talks to it. Fetch
// tasks and timers post messages back to the driver; nothing mutates
// tracker state from outside it, so listener ordering guarantees hold by
// construction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::bundle::{MediaPlaylistBundle, is_blocking_request};
use crate::config::{HttpSourceConfig, TrackerConfig};
use crate::error::{TrackerError, TrackerResult};
use crate::events::{
    ListenerId, LoadEventDispatcher, LoadEventInfo, NullEventDispatcher, PlaylistEventListener,
    PlaylistExclusion, PrimaryPlaylistListener,
};
use crate::loader::{LoadOutcome, LoadTarget, PlaylistLoader, RetryDecision};
use crate::parser::{ParsedPlaylist, PlaylistParserFactory};
use crate::playlist::{MediaPlaylist, MultivariantPlaylist};
use crate::policy::{
    DefaultLoadErrorPolicy, FallbackOptions, FallbackType, LoadDataType, LoadErrorHandlingPolicy,
    LoadErrorInfo,
};
use crate::reconcile::reconcile;
use crate::source::{HttpPlaylistSource, PlaylistDataSource};

/// Handle to a playlist tracker driver. Dropping the handle cancels the
/// driver together with every pending timer and in-flight load.
pub struct HlsPlaylistTracker {
    cmd_tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
}

impl HlsPlaylistTracker {
    /// Starts building a tracker around the given parser factory.
    pub fn builder(parser_factory: Arc<dyn PlaylistParserFactory>) -> TrackerBuilder {
        TrackerBuilder::new(parser_factory)
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command, fallback: T) -> T {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(command(reply)).await.is_err() {
            return fallback;
        }
        rx.await.unwrap_or(fallback)
    }

    async fn post(&self, command: Command) {
        let _ = self.cmd_tx.send(command).await;
    }

    /// Loads the multivariant playlist and begins tracking. The listener
    /// receives every refresh of the primary playlist. Fails if the tracker
    /// is already started.
    pub async fn start(
        &self,
        uri: Url,
        listener: Arc<dyn PrimaryPlaylistListener>,
    ) -> TrackerResult<()> {
        self.request(
            |reply| Command::Start {
                uri,
                listener,
                reply,
            },
            Err(TrackerError::Cancelled),
        )
        .await
    }

    /// Stops tracking: cancels timers and in-flight loads and clears all
    /// state. The tracker may be started again afterwards.
    pub async fn stop(&self) {
        self.request(|reply| Command::Stop { reply }, ()).await;
    }

    pub async fn add_listener(&self, listener: Arc<dyn PlaylistEventListener>) -> ListenerId {
        self.request(|reply| Command::AddListener { listener, reply }, 0)
            .await
    }

    pub async fn remove_listener(&self, id: ListenerId) {
        self.post(Command::RemoveListener { id }).await;
    }

    /// Requests a refresh of the given playlist, with delivery directives
    /// when the server supports them. Idempotent while a load is pending.
    pub async fn refresh_playlist(&self, url: &Url) {
        self.post(Command::Refresh { url: url.clone() }).await;
    }

    /// The current snapshot for a playlist URL, if any. With
    /// `is_for_playback` the call also makes the playlist a candidate for
    /// primary selection and keeps it refreshing while active.
    pub async fn playlist_snapshot(
        &self,
        url: &Url,
        is_for_playback: bool,
    ) -> Option<Arc<MediaPlaylist>> {
        self.request(
            |reply| Command::Snapshot {
                url: url.clone(),
                is_for_playback,
                reply,
            },
            None,
        )
        .await
    }

    pub async fn multivariant_playlist(&self) -> Option<Arc<MultivariantPlaylist>> {
        self.request(|reply| Command::Multivariant { reply }, None)
            .await
    }

    /// Whether the tracked stream is live, decided by the first primary
    /// snapshot.
    pub async fn is_live(&self) -> bool {
        self.request(|reply| Command::IsLive { reply }, false).await
    }

    /// Start time of the first primary snapshot, set exactly once per
    /// `start`.
    pub async fn initial_start_time_us(&self) -> Option<i64> {
        self.request(|reply| Command::InitialStartTime { reply }, None)
            .await
    }

    pub async fn is_snapshot_valid(&self, url: &Url) -> bool {
        self.request(
            |reply| Command::IsSnapshotValid {
                url: url.clone(),
                reply,
            },
            false,
        )
        .await
    }

    /// Excludes a playlist from fallback selection. Returns `true` iff the
    /// playlist was excluded, i.e. it was not the primary with no fallback
    /// left to promote.
    pub async fn exclude_media_playlist(&self, url: &Url, exclusion_duration: Duration) -> bool {
        self.request(
            |reply| Command::ExcludePlaylist {
                url: url.clone(),
                duration: exclusion_duration,
                reply,
            },
            false,
        )
        .await
    }

    /// Stops the keep-refreshing behavior granted by a for-playback
    /// snapshot query.
    pub async fn deactivate_playlist_for_playback(&self, url: &Url) {
        self.post(Command::DeactivateForPlayback { url: url.clone() })
            .await;
    }

    /// Surfaces a fatal multivariant load error or the primary playlist's
    /// accumulated refresh error, if any.
    pub async fn check_primary_refresh_error(&self) -> TrackerResult<()> {
        self.request(|reply| Command::CheckPrimaryRefreshError { reply }, Ok(()))
            .await
    }

    /// Surfaces the given playlist's accumulated refresh error, if any.
    pub async fn check_refresh_error(&self, url: &Url) -> TrackerResult<()> {
        self.request(
            |reply| Command::CheckRefreshError {
                url: url.clone(),
                reply,
            },
            Ok(()),
        )
        .await
    }
}

impl Drop for HlsPlaylistTracker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Configures and spawns a tracker driver.
pub struct TrackerBuilder {
    config: TrackerConfig,
    parser_factory: Arc<dyn PlaylistParserFactory>,
    source: Option<Arc<dyn PlaylistDataSource>>,
    policy: Arc<dyn LoadErrorHandlingPolicy>,
    dispatcher: Arc<dyn LoadEventDispatcher>,
}

impl TrackerBuilder {
    fn new(parser_factory: Arc<dyn PlaylistParserFactory>) -> Self {
        Self {
            config: TrackerConfig::default(),
            parser_factory,
            source: None,
            policy: Arc::new(DefaultLoadErrorPolicy::default()),
            dispatcher: Arc::new(NullEventDispatcher),
        }
    }

    pub fn config(mut self, config: TrackerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn source(mut self, source: Arc<dyn PlaylistDataSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn policy(mut self, policy: Arc<dyn LoadErrorHandlingPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn LoadEventDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Spawns the driver task on the current runtime and returns its
    /// handle. Without an explicit source, a default HTTP source is built.
    pub fn build(self) -> TrackerResult<HlsPlaylistTracker> {
        let source = match self.source {
            Some(source) => source,
            None => Arc::new(HttpPlaylistSource::new(HttpSourceConfig::default())?),
        };
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let driver = Driver {
            config: self.config,
            source,
            parser_factory: self.parser_factory,
            policy: self.policy,
            dispatcher: self.dispatcher,
            cancel: cancel.clone(),
            outcome_tx,
            timer_tx,
            next_task_id: 0,
            next_listener_id: 0,
            epoch: 0,
            listeners: Vec::new(),
            session: None,
        };
        tokio::spawn(driver.run(cmd_rx, outcome_rx, timer_rx));
        Ok(HlsPlaylistTracker { cmd_tx, cancel })
    }
}

enum Command {
    Start {
        uri: Url,
        listener: Arc<dyn PrimaryPlaylistListener>,
        reply: oneshot::Sender<TrackerResult<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    AddListener {
        listener: Arc<dyn PlaylistEventListener>,
        reply: oneshot::Sender<ListenerId>,
    },
    RemoveListener {
        id: ListenerId,
    },
    Refresh {
        url: Url,
    },
    Snapshot {
        url: Url,
        is_for_playback: bool,
        reply: oneshot::Sender<Option<Arc<MediaPlaylist>>>,
    },
    Multivariant {
        reply: oneshot::Sender<Option<Arc<MultivariantPlaylist>>>,
    },
    IsLive {
        reply: oneshot::Sender<bool>,
    },
    InitialStartTime {
        reply: oneshot::Sender<Option<i64>>,
    },
    IsSnapshotValid {
        url: Url,
        reply: oneshot::Sender<bool>,
    },
    ExcludePlaylist {
        url: Url,
        duration: Duration,
        reply: oneshot::Sender<bool>,
    },
    DeactivateForPlayback {
        url: Url,
    },
    CheckPrimaryRefreshError {
        reply: oneshot::Sender<TrackerResult<()>>,
    },
    CheckRefreshError {
        url: Url,
        reply: oneshot::Sender<TrackerResult<()>>,
    },
}

#[derive(Debug)]
enum TimerMsg {
    /// A deferred bundle reload came due.
    Reload { url: Url, epoch: u64 },
    /// A retry delay elapsed.
    Retry {
        target: LoadTarget,
        generation: u64,
        epoch: u64,
        request_uri: Url,
    },
}

/// Per-`start` state. Dropped wholesale on `stop`.
struct Session {
    primary_listener: Arc<dyn PrimaryPlaylistListener>,
    initial_loader: PlaylistLoader,
    multivariant: Option<Arc<MultivariantPlaylist>>,
    primary_url: Option<Url>,
    primary_snapshot: Option<Arc<MediaPlaylist>>,
    is_live: bool,
    initial_start_time_us: Option<i64>,
    bundles: HashMap<Url, MediaPlaylistBundle>,
    /// First-primary bootstrap error handling is active until the first
    /// snapshot change.
    bootstrapping: bool,
}

struct Driver {
    config: TrackerConfig,
    source: Arc<dyn PlaylistDataSource>,
    parser_factory: Arc<dyn PlaylistParserFactory>,
    policy: Arc<dyn LoadErrorHandlingPolicy>,
    dispatcher: Arc<dyn LoadEventDispatcher>,
    cancel: CancellationToken,
    outcome_tx: mpsc::UnboundedSender<LoadOutcome>,
    timer_tx: mpsc::UnboundedSender<TimerMsg>,
    next_task_id: u64,
    next_listener_id: ListenerId,
    /// Bumped on stop; timers carrying an older epoch are stale.
    epoch: u64,
    listeners: Vec<(ListenerId, Arc<dyn PlaylistEventListener>)>,
    session: Option<Session>,
}

enum Event {
    Command(Command),
    Load(LoadOutcome),
    Timer(TimerMsg),
    Shutdown,
}

impl Driver {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut outcome_rx: mpsc::UnboundedReceiver<LoadOutcome>,
        mut timer_rx: mpsc::UnboundedReceiver<TimerMsg>,
    ) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Event::Shutdown,
                command = cmd_rx.recv() => command.map_or(Event::Shutdown, Event::Command),
                outcome = outcome_rx.recv() => outcome.map_or(Event::Shutdown, Event::Load),
                timer = timer_rx.recv() => timer.map_or(Event::Shutdown, Event::Timer),
            };
            match event {
                Event::Shutdown => break,
                Event::Command(command) => self.on_command(command),
                Event::Load(outcome) => self.on_load_outcome(outcome),
                Event::Timer(timer) => self.on_timer(timer),
            }
        }
        self.handle_stop();
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Start {
                uri,
                listener,
                reply,
            } => {
                let _ = reply.send(self.handle_start(uri, listener));
            }
            Command::Stop { reply } => {
                self.handle_stop();
                let _ = reply.send(());
            }
            Command::AddListener { listener, reply } => {
                self.next_listener_id += 1;
                self.listeners.push((self.next_listener_id, listener));
                let _ = reply.send(self.next_listener_id);
            }
            Command::RemoveListener { id } => {
                self.listeners.retain(|(listener_id, _)| *listener_id != id);
            }
            Command::Refresh { url } => self.bundle_load_playlist(&url, true),
            Command::Snapshot {
                url,
                is_for_playback,
                reply,
            } => {
                let _ = reply.send(self.snapshot_query(&url, is_for_playback));
            }
            Command::Multivariant { reply } => {
                let _ = reply.send(self.session.as_ref().and_then(|s| s.multivariant.clone()));
            }
            Command::IsLive { reply } => {
                let _ = reply.send(self.session.as_ref().is_some_and(|s| s.is_live));
            }
            Command::InitialStartTime { reply } => {
                let _ = reply.send(self.session.as_ref().and_then(|s| s.initial_start_time_us));
            }
            Command::IsSnapshotValid { url, reply } => {
                let valid = self
                    .session
                    .as_ref()
                    .and_then(|s| s.bundles.get(&url))
                    .is_some_and(|bundle| {
                        bundle.is_snapshot_valid(Instant::now(), self.config.snapshot_validity_floor)
                    });
                let _ = reply.send(valid);
            }
            Command::ExcludePlaylist {
                url,
                duration,
                reply,
            } => {
                let _ = reply.send(self.tracker_exclude(&url, duration));
            }
            Command::DeactivateForPlayback { url } => {
                if let Some(bundle) = self.bundle_mut(&url) {
                    bundle.active_for_playback = false;
                }
            }
            Command::CheckPrimaryRefreshError { reply } => {
                let _ = reply.send(self.check_primary_refresh_error());
            }
            Command::CheckRefreshError { url, reply } => {
                let _ = reply.send(self.check_refresh_error(&url));
            }
        }
    }

    fn alloc_task_id(&mut self) -> u64 {
        self.next_task_id += 1;
        self.next_task_id
    }

    fn bundle_mut(&mut self, url: &Url) -> Option<&mut MediaPlaylistBundle> {
        self.session.as_mut()?.bundles.get_mut(url)
    }

    fn spawn_timer(&self, delay: Duration, msg: TimerMsg) {
        let timer_tx = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timer_tx.send(msg);
        });
    }

    // Session lifecycle.

    fn handle_start(
        &mut self,
        uri: Url,
        listener: Arc<dyn PrimaryPlaylistListener>,
    ) -> TrackerResult<()> {
        if self.session.is_some() {
            return Err(TrackerError::AlreadyStarted);
        }
        debug!(uri = %uri, "starting playlist tracking");
        let min_retry = self
            .policy
            .minimum_loadable_retry_count(LoadDataType::MultivariantPlaylist);
        self.session = Some(Session {
            primary_listener: listener,
            initial_loader: PlaylistLoader::new(min_retry),
            multivariant: None,
            primary_url: None,
            primary_snapshot: None,
            is_live: false,
            initial_start_time_us: None,
            bundles: HashMap::new(),
            bootstrapping: false,
        });
        let task_id = self.alloc_task_id();
        self.start_initial_load(uri, task_id);
        Ok(())
    }

    fn handle_stop(&mut self) {
        self.epoch += 1;
        let Some(mut session) = self.session.take() else {
            return;
        };
        if let Some(info) = session.initial_loader.release() {
            self.policy.on_load_task_concluded(info.task_id);
            self.dispatcher.load_canceled(&info);
        }
        for (_, mut bundle) in session.bundles.drain() {
            if let Some(info) = bundle.loader.release() {
                self.policy.on_load_task_concluded(info.task_id);
                self.dispatcher.load_canceled(&info);
            }
        }
        debug!("playlist tracking stopped");
    }

    // Multivariant bootstrap.

    fn start_initial_load(&mut self, request_uri: Url, task_id: u64) {
        let parser = self.parser_factory.create_initial_parser();
        let headers = self.config.request_headers.clone();
        let source = self.source.clone();
        let outcome_tx = self.outcome_tx.clone();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let retry_count = session.initial_loader.error_count();
        session.initial_loader.start_load(
            task_id,
            LoadTarget::Multivariant,
            request_uri.clone(),
            headers,
            source,
            parser,
            outcome_tx,
        );
        self.dispatcher.load_started(
            &LoadEventInfo {
                task_id,
                uri: request_uri,
                load_duration: Duration::ZERO,
                bytes_loaded: 0,
            },
            retry_count,
        );
    }

    fn on_load_outcome(&mut self, outcome: LoadOutcome) {
        match outcome.target.clone() {
            LoadTarget::Multivariant => self.on_initial_outcome(outcome),
            LoadTarget::Media(url) => self.on_media_outcome(url, outcome),
        }
    }

    fn on_initial_outcome(&mut self, outcome: LoadOutcome) {
        let accepted = self
            .session
            .as_mut()
            .is_some_and(|s| s.initial_loader.accept(outcome.generation));
        if !accepted {
            return;
        }
        let mut info = LoadEventInfo {
            task_id: outcome.task_id,
            uri: outcome.request_uri.clone(),
            load_duration: outcome.load_duration,
            bytes_loaded: 0,
        };
        match outcome.result {
            Ok((parsed, bytes_loaded)) => {
                info.bytes_loaded = bytes_loaded;
                if let Some(session) = self.session.as_mut() {
                    session.initial_loader.on_success();
                }
                self.on_multivariant_loaded(parsed, outcome.request_uri, info);
            }
            Err(error) => {
                let Some(error_count) = self
                    .session
                    .as_mut()
                    .map(|s| s.initial_loader.note_error(error.clone()))
                else {
                    return;
                };
                let decision = match self.policy.retry_delay(&LoadErrorInfo {
                    error: error.clone(),
                    error_count,
                }) {
                    Some(delay) => RetryDecision::RetryAfter(delay),
                    None => RetryDecision::DontRetryFatal,
                };
                let was_canceled = !matches!(decision, RetryDecision::RetryAfter(_));
                self.dispatcher.load_error(&info, &error, was_canceled);
                match decision {
                    RetryDecision::RetryAfter(delay) => {
                        warn!(
                            uri = %info.uri,
                            attempt = error_count,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "retrying multivariant playlist load"
                        );
                        let Some(generation) = self.session.as_mut().map(|s| {
                            s.initial_loader.set_retry_pending();
                            s.initial_loader.generation()
                        }) else {
                            return;
                        };
                        self.spawn_timer(
                            delay,
                            TimerMsg::Retry {
                                target: LoadTarget::Multivariant,
                                generation,
                                epoch: self.epoch,
                                request_uri: outcome.request_uri,
                            },
                        );
                    }
                    // The bootstrap load is never handed to listeners, so a
                    // bare DontRetry does not arise for it.
                    RetryDecision::DontRetry | RetryDecision::DontRetryFatal => {
                        if let Some(session) = self.session.as_mut() {
                            session.initial_loader.set_fatal(error);
                        }
                        self.policy.on_load_task_concluded(info.task_id);
                    }
                }
            }
        }
    }

    fn on_multivariant_loaded(
        &mut self,
        parsed: ParsedPlaylist,
        request_uri: Url,
        info: LoadEventInfo,
    ) {
        let (multivariant, direct_media) = match parsed {
            ParsedPlaylist::Multivariant(multivariant) => (multivariant, None),
            // A media playlist at the top level: wrap it and reuse the
            // parsed result without a second round-trip.
            ParsedPlaylist::Media(media) => (
                Arc::new(MultivariantPlaylist::single_variant(request_uri)),
                Some(media),
            ),
        };
        if multivariant.variants.is_empty() {
            let error = TrackerError::malformed("multivariant playlist has no variants");
            if let Some(session) = self.session.as_mut() {
                session.initial_loader.set_fatal(error.clone());
            }
            self.dispatcher.load_error(&info, &error, true);
            self.policy.on_load_task_concluded(info.task_id);
            return;
        }
        let primary_url = multivariant.variants[0].url.clone();
        debug!(
            variants = multivariant.variants.len(),
            playlists = multivariant.media_playlist_urls.len(),
            primary = %primary_url,
            "multivariant playlist loaded"
        );
        let media_min_retry = self
            .policy
            .minimum_loadable_retry_count(LoadDataType::MediaPlaylist);
        if let Some(session) = self.session.as_mut() {
            session.multivariant = Some(multivariant.clone());
            session.primary_url = Some(primary_url.clone());
            session.bootstrapping = true;
            for url in &multivariant.media_playlist_urls {
                session
                    .bundles
                    .insert(url.clone(), MediaPlaylistBundle::new(url.clone(), media_min_retry));
            }
        }
        match direct_media {
            Some(media) => self.process_loaded_playlist(&primary_url, media, &info),
            None => self.bundle_load_playlist(&primary_url, false),
        }
        self.policy.on_load_task_concluded(info.task_id);
        self.dispatcher.load_completed(&info);
    }

    // Media playlist loads.

    fn bundle_load_playlist(&mut self, url: &Url, allow_directives: bool) {
        let Some(request_uri) = self.bundle_mut(url).map(|bundle| {
            if allow_directives {
                bundle.reload_uri()
            } else {
                bundle.url.clone()
            }
        }) else {
            return;
        };
        self.bundle_load_playlist_internal(url, request_uri);
    }

    fn bundle_load_playlist_internal(&mut self, url: &Url, request_uri: Url) {
        enum Action {
            Skip,
            Defer(Duration),
            Now,
        }
        let action = {
            let Some(bundle) = self.bundle_mut(url) else {
                return;
            };
            // Entering the load path always re-admits the playlist to
            // fallback selection.
            bundle.exclude_until = None;
            if bundle.load_pending
                || bundle.loader.is_loading()
                || bundle.loader.has_fatal_error()
            {
                Action::Skip
            } else {
                let now = Instant::now();
                match bundle.earliest_next_load {
                    Some(earliest) if now < earliest => {
                        bundle.load_pending = true;
                        bundle.pending_request_uri = Some(request_uri.clone());
                        Action::Defer(earliest - now)
                    }
                    _ => Action::Now,
                }
            }
        };
        match action {
            Action::Skip => {}
            Action::Defer(delay) => self.spawn_timer(
                delay,
                TimerMsg::Reload {
                    url: url.clone(),
                    epoch: self.epoch,
                },
            ),
            Action::Now => {
                let task_id = self.alloc_task_id();
                self.bundle_load_immediately(url, request_uri, task_id);
            }
        }
    }

    fn bundle_load_immediately(&mut self, url: &Url, request_uri: Url, task_id: u64) {
        let parser = {
            let Some(session) = self.session.as_ref() else {
                return;
            };
            let Some(multivariant) = session.multivariant.as_ref() else {
                return;
            };
            let previous = session.bundles.get(url).and_then(|b| b.snapshot.as_ref());
            self.parser_factory.create_media_parser(multivariant, previous)
        };
        let headers = self.config.request_headers.clone();
        let source = self.source.clone();
        let outcome_tx = self.outcome_tx.clone();
        let Some(bundle) = self.bundle_mut(url) else {
            return;
        };
        let retry_count = bundle.loader.error_count();
        bundle.loader.start_load(
            task_id,
            LoadTarget::Media(url.clone()),
            request_uri.clone(),
            headers,
            source,
            parser,
            outcome_tx,
        );
        self.dispatcher.load_started(
            &LoadEventInfo {
                task_id,
                uri: request_uri,
                load_duration: Duration::ZERO,
                bytes_loaded: 0,
            },
            retry_count,
        );
    }

    fn on_media_outcome(&mut self, url: Url, outcome: LoadOutcome) {
        let accepted = self
            .bundle_mut(&url)
            .is_some_and(|bundle| bundle.loader.accept(outcome.generation));
        if !accepted {
            return;
        }
        let mut info = LoadEventInfo {
            task_id: outcome.task_id,
            uri: outcome.request_uri.clone(),
            load_duration: outcome.load_duration,
            bytes_loaded: 0,
        };
        match outcome.result {
            Ok((ParsedPlaylist::Media(media), bytes_loaded)) => {
                info.bytes_loaded = bytes_loaded;
                if let Some(bundle) = self.bundle_mut(&url) {
                    bundle.loader.on_success();
                }
                self.process_loaded_playlist(&url, media, &info);
                self.dispatcher.load_completed(&info);
                self.policy.on_load_task_concluded(info.task_id);
            }
            Ok((ParsedPlaylist::Multivariant(_), bytes_loaded)) => {
                info.bytes_loaded = bytes_loaded;
                let error = TrackerError::UnexpectedPlaylistType { url: url.clone() };
                if let Some(bundle) = self.bundle_mut(&url) {
                    bundle.loader.conclude();
                    bundle.playlist_error = Some(error.clone());
                }
                self.dispatcher.load_error(&info, &error, true);
                self.policy.on_load_task_concluded(info.task_id);
            }
            Err(error) => self.on_media_load_error(&url, outcome.request_uri, error, info),
        }
    }

    fn on_media_load_error(
        &mut self,
        url: &Url,
        request_uri: Url,
        error: TrackerError,
        info: LoadEventInfo,
    ) {
        let decision = self.media_load_error_decision(url, &request_uri, &error);
        let was_canceled = !matches!(decision, RetryDecision::RetryAfter(_));
        self.dispatcher.load_error(&info, &error, was_canceled);
        match decision {
            RetryDecision::RetryAfter(delay) => {
                let Some((generation, attempt)) = self.bundle_mut(url).map(|bundle| {
                    bundle.loader.set_retry_pending();
                    (bundle.loader.generation(), bundle.loader.error_count())
                }) else {
                    return;
                };
                warn!(
                    url = %url,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "retrying media playlist load"
                );
                self.spawn_timer(
                    delay,
                    TimerMsg::Retry {
                        target: LoadTarget::Media(url.clone()),
                        generation,
                        epoch: self.epoch,
                        request_uri,
                    },
                );
            }
            RetryDecision::DontRetry => {
                if let Some(bundle) = self.bundle_mut(url) {
                    bundle.loader.conclude();
                }
                self.policy.on_load_task_concluded(info.task_id);
            }
            RetryDecision::DontRetryFatal => {
                if let Some(bundle) = self.bundle_mut(url) {
                    bundle.loader.set_fatal(error.clone());
                }
                self.policy.on_load_task_concluded(info.task_id);
            }
        }
    }

    /// Decides the fate of a failed media playlist load: the forced-reload
    /// rule for rejected blocking requests and delta updates first, then
    /// listeners (which may exclude the playlist), then the policy.
    fn media_load_error_decision(
        &mut self,
        url: &Url,
        request_uri: &Url,
        error: &TrackerError,
    ) -> RetryDecision {
        let blocking = is_blocking_request(request_uri);
        let delta_failed = matches!(error, TrackerError::DeltaUpdateFailed { .. });
        if blocking || delta_failed {
            let status = error.response_code().map(|status| status.as_u16());
            if delta_failed || status == Some(400) || status == Some(503) {
                // RFC 8216 §6.2.5.2 / §6.3.7: answer a failed delta update
                // or rejected blocking request with a full, non-blocking
                // reload right away.
                if let Some(bundle) = self.bundle_mut(url) {
                    bundle.earliest_next_load = None;
                    bundle.loader.conclude();
                }
                self.bundle_load_playlist(url, false);
                return RetryDecision::DontRetry;
            }
        }
        let Some(error_count) = self
            .bundle_mut(url)
            .map(|bundle| bundle.loader.note_error(error.clone()))
        else {
            return RetryDecision::DontRetry;
        };
        let error_info = LoadErrorInfo {
            error: error.clone(),
            error_count,
        };
        if self.notify_playlist_error(url, &error_info, false) {
            match self.policy.retry_delay(&error_info) {
                Some(delay) => RetryDecision::RetryAfter(delay),
                None => RetryDecision::DontRetryFatal,
            }
        } else {
            // A listener already handled the error by excluding the
            // playlist.
            RetryDecision::DontRetry
        }
    }

    fn process_loaded_playlist(
        &mut self,
        url: &Url,
        loaded: Arc<MediaPlaylist>,
        info: &LoadEventInfo,
    ) {
        let now = Instant::now();
        let stuck_coefficient = self.config.stuck_target_duration_coefficient;
        let primary_snapshot = self.session.as_ref().and_then(|s| s.primary_snapshot.clone());

        let (new_snapshot, changed, detection) = {
            let Some(bundle) = self.bundle_mut(url) else {
                return;
            };
            let old = bundle.snapshot.clone();
            bundle.last_snapshot_load = Some(now);
            let new_snapshot = reconcile(old.as_ref(), &loaded, primary_snapshot.as_ref());
            let changed = old
                .as_ref()
                .is_none_or(|old| !Arc::ptr_eq(old, &new_snapshot));
            bundle.snapshot = Some(new_snapshot.clone());
            let mut detection = None;
            if changed {
                bundle.playlist_error = None;
                bundle.last_snapshot_change = Some(now);
            } else if !new_snapshot.has_end_tag {
                if (loaded.media_sequence + loaded.segments.len() as u64)
                    < new_snapshot.media_sequence
                {
                    // The media sequence jumped backwards; the server has
                    // probably reset. Exclusion would not help here.
                    detection = Some((TrackerError::PlaylistReset { url: url.clone() }, true));
                } else if bundle.last_snapshot_change.is_some_and(|changed_at| {
                    now.duration_since(changed_at)
                        > new_snapshot.target_duration.mul_f64(stuck_coefficient)
                }) {
                    detection = Some((TrackerError::PlaylistStuck { url: url.clone() }, false));
                }
                if let Some((error, _)) = &detection {
                    warn!(url = %url, error = %error, "playlist refresh anomaly");
                    bundle.playlist_error = Some(error.clone());
                }
            }
            (new_snapshot, changed, detection)
        };

        if changed {
            self.on_playlist_updated(url, new_snapshot.clone());
        } else if let Some((error, force_retry)) = detection {
            let error_info = LoadErrorInfo {
                error,
                error_count: 1,
            };
            self.notify_playlist_error(url, &error_info, force_retry);
        }

        let should_reload = {
            let Some(session) = self.session.as_mut() else {
                return;
            };
            let is_primary = session.primary_url.as_ref() == Some(url);
            let Some(bundle) = session.bundles.get_mut(url) else {
                return;
            };
            let control = &new_snapshot.server_control;
            let delay = if !control.can_block_reload {
                // Without blocking support, poll once per target duration
                // after a change and twice as often otherwise.
                if changed {
                    new_snapshot.target_duration
                } else {
                    new_snapshot.target_duration / 2
                }
            } else if !changed {
                // The server advertised CAN-BLOCK-RELOAD=YES but returned
                // without blocking; back off instead of spinning.
                new_snapshot
                    .part_target_duration
                    .map_or(new_snapshot.target_duration / 2, |part| part / 2)
            } else {
                Duration::ZERO
            };
            bundle.earliest_next_load = Some(
                (now + delay)
                    .checked_sub(info.load_duration)
                    .unwrap_or(now),
            );
            !new_snapshot.has_end_tag && (is_primary || bundle.active_for_playback)
        };
        if should_reload {
            self.bundle_load_playlist(url, true);
        }
    }

    // Fan-out.

    fn on_playlist_updated(&mut self, url: &Url, snapshot: Arc<MediaPlaylist>) {
        let mut primary_listener = None;
        if let Some(session) = self.session.as_mut() {
            if session.primary_url.as_ref() == Some(url) {
                if session.primary_snapshot.is_none() {
                    session.is_live = !snapshot.has_end_tag;
                    session.initial_start_time_us = Some(snapshot.start_time_us);
                    debug!(is_live = session.is_live, "first primary snapshot obtained");
                }
                session.primary_snapshot = Some(snapshot.clone());
                primary_listener = Some(session.primary_listener.clone());
            }
            // The bootstrap error handling retires on the first change.
            session.bootstrapping = false;
        }
        if let Some(listener) = primary_listener {
            listener.on_primary_playlist_refreshed(snapshot);
        }
        let listeners: Vec<_> = self.listeners.iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener.on_playlist_changed();
        }
    }

    /// Notifies listeners of a refresh error. Returns `true` iff any
    /// listener declined to exclude the playlist, i.e. the load should be
    /// retried.
    fn notify_playlist_error(
        &mut self,
        url: &Url,
        error_info: &LoadErrorInfo,
        force_retry: bool,
    ) -> bool {
        let mut declined = false;
        if self.session.as_ref().is_some_and(|s| s.bootstrapping) {
            self.run_bootstrap_fallback(url, error_info);
            // The bootstrap handler never excludes on the caller's behalf.
            declined = true;
        }
        let listeners: Vec<_> = self.listeners.iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            let excluded = listener.on_playlist_error(url, error_info, force_retry, self);
            declined |= !excluded;
        }
        declined
    }

    /// Until the first primary snapshot exists, load errors apply exclusion
    /// directly through the policy so a broken first variant cannot stall
    /// the whole session.
    fn run_bootstrap_fallback(&mut self, url: &Url, error_info: &LoadErrorInfo) {
        let options = {
            let Some(session) = self.session.as_ref() else {
                return;
            };
            if session.primary_snapshot.is_some() {
                return;
            }
            let Some(multivariant) = session.multivariant.as_ref() else {
                return;
            };
            let now = Instant::now();
            let excluded_tracks = multivariant
                .variants
                .iter()
                .filter(|variant| {
                    session
                        .bundles
                        .get(&variant.url)
                        .is_some_and(|bundle| bundle.is_excluded(now))
                })
                .count();
            FallbackOptions {
                total_locations: 1,
                excluded_locations: 0,
                total_tracks: multivariant.variants.len(),
                excluded_tracks,
            }
        };
        if let Some(selection) = self.policy.fallback_selection(&options, error_info) {
            if selection.fallback_type == FallbackType::Track {
                self.exclude_playlist_inner(url, selection.exclusion_duration);
            }
        }
    }

    // Primary selection and exclusion.

    fn snapshot_query(&mut self, url: &Url, is_for_playback: bool) -> Option<Arc<MediaPlaylist>> {
        let snapshot = self
            .session
            .as_ref()?
            .bundles
            .get(url)
            .and_then(|bundle| bundle.snapshot.clone());
        if snapshot.is_some() && is_for_playback {
            self.maybe_set_primary_url(url);
            self.maybe_activate_for_playback(url);
        }
        snapshot
    }

    fn maybe_set_primary_url(&mut self, url: &Url) {
        let adopt = {
            let Some(session) = self.session.as_mut() else {
                return;
            };
            let Some(multivariant) = session.multivariant.as_ref() else {
                return;
            };
            // Ignore non-variant playlists, and never switch away from an
            // ended stream.
            if session.primary_url.as_ref() == Some(url)
                || !multivariant.variants.iter().any(|v| &v.url == url)
                || session
                    .primary_snapshot
                    .as_ref()
                    .is_some_and(|s| s.has_end_tag)
            {
                return;
            }
            session.primary_url = Some(url.clone());
            session.bundles.get(url).and_then(|b| b.snapshot.clone())
        };
        debug!(url = %url, "primary media playlist switched");
        match adopt {
            Some(snapshot) if snapshot.has_end_tag => {
                if let Some(session) = self.session.as_mut() {
                    session.primary_snapshot = Some(snapshot.clone());
                    let listener = session.primary_listener.clone();
                    listener.on_primary_playlist_refreshed(snapshot);
                }
            }
            _ => {
                // The new primary's snapshot may be stale; refresh it before
                // it becomes authoritative.
                let request_uri = self.request_uri_for_primary_change(url);
                self.bundle_load_playlist_internal(url, request_uri);
            }
        }
    }

    fn maybe_activate_for_playback(&mut self, url: &Url) {
        let reload = {
            let Some(bundle) = self.bundle_mut(url) else {
                return;
            };
            if bundle.active_for_playback {
                return;
            }
            bundle.active_for_playback = true;
            bundle
                .snapshot
                .as_ref()
                .is_some_and(|snapshot| !snapshot.has_end_tag)
        };
        if reload {
            // The snapshot may be stale; an active playlist keeps
            // refreshing on its own from here on.
            self.bundle_load_playlist(url, true);
        }
    }

    /// Promotes the first non-excluded variant to primary. Returns whether
    /// a promotion happened.
    fn maybe_select_new_primary_url(&mut self) -> bool {
        let promoted = {
            let Some(session) = self.session.as_ref() else {
                return false;
            };
            let Some(multivariant) = session.multivariant.as_ref() else {
                return false;
            };
            let now = Instant::now();
            multivariant
                .variants
                .iter()
                .map(|variant| &variant.url)
                .find(|url| {
                    session
                        .bundles
                        .get(url)
                        .is_some_and(|bundle| !bundle.is_excluded(now))
                })
                .cloned()
        };
        let Some(url) = promoted else {
            return false;
        };
        debug!(url = %url, "promoted fallback variant to primary");
        if let Some(session) = self.session.as_mut() {
            session.primary_url = Some(url.clone());
        }
        let request_uri = self.request_uri_for_primary_change(&url);
        self.bundle_load_playlist_internal(&url, request_uri);
        true
    }

    /// The request URI for a freshly promoted primary: when the outgoing
    /// primary advertised blocking reloads and carries a rendition report
    /// for the new URL, the report seeds the blocking directives.
    fn request_uri_for_primary_change(&self, new_primary_url: &Url) -> Url {
        if let Some(snapshot) = self.session.as_ref().and_then(|s| s.primary_snapshot.as_ref()) {
            if snapshot.server_control.can_block_reload {
                if let Some(report) = snapshot.rendition_reports.get(new_primary_url) {
                    let mut uri = new_primary_url.clone();
                    {
                        let mut query = uri.query_pairs_mut();
                        query.append_pair(
                            crate::bundle::BLOCK_MSN_PARAM,
                            &report.last_media_sequence.to_string(),
                        );
                        if let Some(part_index) = report.last_part_index {
                            query.append_pair(
                                crate::bundle::BLOCK_PART_PARAM,
                                &part_index.to_string(),
                            );
                        }
                    }
                    return uri;
                }
            }
        }
        new_primary_url.clone()
    }

    /// Bundle-level exclusion. Returns `true` iff the playlist is the
    /// primary and no fallback could be promoted.
    fn exclude_playlist_inner(&mut self, url: &Url, duration: Duration) -> bool {
        let is_primary = {
            let primary = self.session.as_ref().and_then(|s| s.primary_url.clone());
            let Some(bundle) = self.bundle_mut(url) else {
                return false;
            };
            bundle.exclude_until = Some(Instant::now() + duration);
            debug!(url = %url, duration_ms = duration.as_millis() as u64, "excluded media playlist");
            primary.as_ref() == Some(url)
        };
        is_primary && !self.maybe_select_new_primary_url()
    }

    /// Tracker-level exclusion semantics: `true` iff the playlist ended up
    /// excluded.
    fn tracker_exclude(&mut self, url: &Url, duration: Duration) -> bool {
        let known = self
            .session
            .as_ref()
            .is_some_and(|s| s.bundles.contains_key(url));
        known && !self.exclude_playlist_inner(url, duration)
    }

    // Error surfacing.

    fn check_primary_refresh_error(&self) -> TrackerResult<()> {
        let Some(session) = self.session.as_ref() else {
            return Ok(());
        };
        session.initial_loader.maybe_error()?;
        if let Some(url) = &session.primary_url {
            self.check_refresh_error(url)?;
        }
        Ok(())
    }

    fn check_refresh_error(&self, url: &Url) -> TrackerResult<()> {
        match self.session.as_ref().and_then(|s| s.bundles.get(url)) {
            Some(bundle) => bundle.maybe_error(),
            None => Ok(()),
        }
    }

    // Timers.

    fn on_timer(&mut self, msg: TimerMsg) {
        match msg {
            TimerMsg::Reload { url, epoch } => {
                if epoch != self.epoch {
                    return;
                }
                let request_uri = {
                    let Some(bundle) = self.bundle_mut(&url) else {
                        return;
                    };
                    if !bundle.load_pending {
                        return;
                    }
                    bundle.load_pending = false;
                    bundle.pending_request_uri.take()
                };
                if let Some(request_uri) = request_uri {
                    let task_id = self.alloc_task_id();
                    self.bundle_load_immediately(&url, request_uri, task_id);
                }
            }
            TimerMsg::Retry {
                target,
                generation,
                epoch,
                request_uri,
            } => {
                if epoch != self.epoch {
                    return;
                }
                match target {
                    LoadTarget::Multivariant => {
                        let task_id = {
                            let Some(session) = self.session.as_mut() else {
                                return;
                            };
                            if !session.initial_loader.take_retry(generation) {
                                return;
                            }
                            session.initial_loader.task_id()
                        };
                        self.start_initial_load(request_uri, task_id);
                    }
                    LoadTarget::Media(url) => {
                        let task_id = {
                            let Some(bundle) = self.bundle_mut(&url) else {
                                return;
                            };
                            if !bundle.loader.take_retry(generation) {
                                return;
                            }
                            bundle.loader.task_id()
                        };
                        self.bundle_load_immediately(&url, request_uri, task_id);
                    }
                }
            }
        }
    }
}

impl PlaylistExclusion for Driver {
    fn exclude_media_playlist(&mut self, url: &Url, exclusion_duration: Duration) -> bool {
        self.tracker_exclude(url, exclusion_duration)
    }
}

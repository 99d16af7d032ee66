//! Recording session
//!
//! One tokio task owns the state, the chunk buffer, the held stream and the
//! current artifact. Commands and engine notifications share one channel, so
//! they are reduced strictly in arrival order. Observers read a `watch`
//! snapshot.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::artifact::{assemble, resolve_media_type, Artifact, ArtifactRef, ArtifactStore};
use crate::audio::{ensure_registered, EndedObserver, LegOptions, LiveStream, MediaTrack, TrackKind};
use crate::buffer::ChunkBuffer;
use crate::effects::{EffectRunner, Job};
use crate::error::{ErrorCode, SessionError};
use crate::settings::SessionConfig;
use crate::state_machine::{reduce, Context, Effect, Event, State, Status};
use crate::visualizer::{SharedTarget, Visualizer, VisualizerHandle};

const EVENT_CHANNEL_CAPACITY: usize = 64;

pub type StartCallback = Arc<dyn Fn() + Send + Sync>;
pub type StopCallback = Arc<dyn Fn(&ArtifactRef, &Artifact) + Send + Sync>;

/// What observers see of the session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub status: Status,
    pub error: ErrorCode,
    pub artifact: Option<ArtifactRef>,
    pub is_muted: bool,
    pub buffered_chunks: usize,
    /// Recording time of the current take when the snapshot was published
    pub elapsed_ms: u64,
    #[serde(skip)]
    pub preview_stream: Option<LiveStream>,
    #[serde(skip)]
    pub preview_audio_stream: Option<LiveStream>,
    #[serde(skip)]
    clock: TakeClock,
}

impl SessionSnapshot {
    fn initial(error: ErrorCode) -> Self {
        Self {
            status: Status::Idle,
            error,
            artifact: None,
            is_muted: false,
            buffered_chunks: 0,
            elapsed_ms: 0,
            preview_stream: None,
            preview_audio_stream: None,
            clock: TakeClock::default(),
        }
    }

    /// Recording time of the current take up to now, pauses excluded.
    pub fn elapsed(&self) -> Duration {
        self.clock.elapsed()
    }
}

/// Running time of a take across its legs.
#[derive(Debug, Clone, Copy, Default)]
struct TakeClock {
    recorded: Duration,
    running_since: Option<Instant>,
}

impl TakeClock {
    fn run(&mut self, first_leg: bool) {
        if first_leg {
            self.recorded = Duration::ZERO;
        }
        self.running_since = Some(Instant::now());
    }

    fn halt(&mut self) {
        if let Some(since) = self.running_since.take() {
            self.recorded += since.elapsed();
        }
    }

    fn elapsed(&self) -> Duration {
        self.recorded + self.running_since.map_or(Duration::ZERO, |since| since.elapsed())
    }
}

pub struct SessionBuilder {
    config: SessionConfig,
    runner: Arc<dyn EffectRunner>,
    on_start: Option<StartCallback>,
    on_stop: Option<StopCallback>,
    seed: Vec<Bytes>,
    custom_stream: Option<LiveStream>,
    render_target: Option<SharedTarget>,
}

impl SessionBuilder {
    pub fn new(config: SessionConfig, runner: Arc<dyn EffectRunner>) -> Self {
        Self {
            config,
            runner,
            on_start: None,
            on_stop: None,
            seed: Vec::new(),
            custom_stream: None,
            render_target: None,
        }
    }

    /// Called each time an engine leg reports it has started.
    pub fn on_start(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_start = Some(Arc::new(callback));
        self
    }

    /// Called with the final artifact once a stop completes.
    pub fn on_stop(
        mut self,
        callback: impl Fn(&ArtifactRef, &Artifact) + Send + Sync + 'static,
    ) -> Self {
        self.on_stop = Some(Arc::new(callback));
        self
    }

    /// Fragment placed in the buffer before any capture.
    pub fn seed_fragment(mut self, fragment: impl Into<Bytes>) -> Self {
        self.seed.push(fragment.into());
        self
    }

    /// Record from this stream instead of acquiring one.
    pub fn custom_stream(mut self, stream: LiveStream) -> Self {
        self.custom_stream = Some(stream);
        self
    }

    pub fn render_target(mut self, target: SharedTarget) -> Self {
        self.render_target = Some(target);
        self
    }

    /// Spawn the session loop. Must be called within a tokio runtime.
    pub fn spawn(self) -> Session {
        let fatal = self.check_capabilities();
        let initial_error = fatal.unwrap_or_default();

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::initial(initial_error));
        let store = ArtifactStore::new();
        let cancel = CancellationToken::new();

        let mut buffer = ChunkBuffer::new();
        for fragment in self.seed {
            buffer.push(fragment);
        }

        let media_type = resolve_media_type(
            self.config.artifact_type_override.as_deref(),
            self.config.video_requested(),
        );

        let mut session_loop = SessionLoop {
            state: State::Idle {
                error: initial_error,
            },
            media_type,
            fatal,
            runner: self.runner,
            tx: tx.clone(),
            stream: None,
            buffer,
            take_start: 0,
            clock: TakeClock::default(),
            artifact: None,
            store: store.clone(),
            muted: false,
            visualizer: None,
            render_target: self.render_target,
            on_start: self.on_start,
            on_stop: self.on_stop,
            snapshot_tx,
            config: self.config,
        };

        if let Some(stream) = self.custom_stream {
            log::info!("Using caller-provided stream {}", stream.id());
            session_loop.apply(Effect::AdoptStream(stream));
            session_loop.apply(Effect::EmitSnapshot);
        } else if session_loop.config.acquire_on_construct && fatal.is_none() {
            let _ = tx.try_send(Event::Prime);
        }

        let task = tokio::spawn(run_session_loop(session_loop, rx, cancel.clone()));

        Session {
            tx,
            snapshot: snapshot_rx,
            store,
            _guard: cancel.clone().drop_guard(),
            cancel,
            task: tokio::sync::Mutex::new(Some(task)),
        }
    }

    fn check_capabilities(&self) -> Option<ErrorCode> {
        if let Err(e) = ensure_registered() {
            log::error!("Session unusable: {}", e);
            return Some(ErrorCode::EncoderInitializationFailed);
        }
        let caps = self.runner.capabilities();
        if !caps.recording {
            log::error!("Session unusable: backend cannot record");
            return Some(ErrorCode::UnsupportedCapability);
        }
        if self.config.screen && !caps.display_capture {
            log::error!("Session unusable: screen capture requested but not supported");
            return Some(ErrorCode::UnsupportedCapability);
        }
        None
    }
}

/// Handle on a running session. Dropping it tears the session down.
pub struct Session {
    tx: mpsc::Sender<Event>,
    snapshot: watch::Receiver<SessionSnapshot>,
    store: ArtifactStore,
    cancel: CancellationToken,
    _guard: DropGuard,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub fn builder(config: SessionConfig, runner: Arc<dyn EffectRunner>) -> SessionBuilder {
        SessionBuilder::new(config, runner)
    }

    pub fn start(&self) -> Result<(), SessionError> {
        self.command(Event::Start)
    }

    pub fn pause(&self) -> Result<(), SessionError> {
        self.command(Event::Pause)
    }

    pub fn resume(&self) -> Result<(), SessionError> {
        self.command(Event::Resume)
    }

    pub fn stop(&self) -> Result<(), SessionError> {
        self.command(Event::Stop)
    }

    pub fn mute_audio(&self) -> Result<(), SessionError> {
        self.command(Event::MuteAudio)
    }

    pub fn unmute_audio(&self) -> Result<(), SessionError> {
        self.command(Event::UnmuteAudio)
    }

    pub fn clear_artifact(&self) -> Result<(), SessionError> {
        self.command(Event::ClearArtifact)
    }

    /// Deliver an event, waiting for queue space.
    pub async fn send(&self, event: Event) -> Result<(), SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::Closed);
        }
        self.tx.send(event).await?;
        Ok(())
    }

    fn command(&self, event: Event) -> Result<(), SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::Closed);
        }
        self.tx.try_send(event)?;
        Ok(())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn status(&self) -> Status {
        self.snapshot.borrow().status
    }

    pub fn error(&self) -> ErrorCode {
        self.snapshot.borrow().error
    }

    pub fn artifact_ref(&self) -> Option<ArtifactRef> {
        self.snapshot.borrow().artifact.clone()
    }

    /// The current artifact, if one is published and not revoked.
    pub fn artifact(&self) -> Option<Artifact> {
        self.artifact_ref().and_then(|r| self.store.resolve(&r))
    }

    pub fn is_muted(&self) -> bool {
        self.snapshot.borrow().is_muted
    }

    /// Recording time of the current (or last) take, pauses excluded.
    pub fn elapsed(&self) -> Duration {
        self.snapshot.borrow().elapsed()
    }

    /// Video tracks of the held stream.
    pub fn preview_stream(&self) -> Option<LiveStream> {
        self.snapshot.borrow().preview_stream.clone()
    }

    /// Audio tracks of the held stream.
    pub fn preview_audio_stream(&self) -> Option<LiveStream> {
        self.snapshot.borrow().preview_audio_stream.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.store
    }

    /// Wait until a published snapshot satisfies `pred`.
    pub async fn wait_for(
        &self,
        pred: impl Fn(&SessionSnapshot) -> bool,
    ) -> Result<SessionSnapshot, SessionError> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(|s| pred(s))
            .await
            .map_err(|_| SessionError::Closed)?;
        Ok(snapshot.clone())
    }

    /// Release the stream, the visualizer and engine resources, then end the
    /// loop. Safe to call more than once.
    pub async fn teardown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::error!("Session loop panicked: {}", e);
            }
        }
    }
}

struct SessionLoop {
    state: State,
    config: SessionConfig,
    media_type: String,
    fatal: Option<ErrorCode>,
    runner: Arc<dyn EffectRunner>,
    tx: mpsc::Sender<Event>,
    stream: Option<LiveStream>,
    buffer: ChunkBuffer,
    /// Buffer length when the current take started; earlier chunks survive
    /// a failed take
    take_start: usize,
    clock: TakeClock,
    artifact: Option<ArtifactRef>,
    store: ArtifactStore,
    muted: bool,
    visualizer: Option<VisualizerHandle>,
    render_target: Option<SharedTarget>,
    on_start: Option<StartCallback>,
    on_stop: Option<StopCallback>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

async fn run_session_loop(
    mut session: SessionLoop,
    mut rx: mpsc::Receiver<Event>,
    cancel: CancellationToken,
) {
    log::info!("Session loop started");

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        session.handle(event);
    }

    session.shutdown();
    log::info!("Session loop ended");
}

impl SessionLoop {
    fn context(&self) -> Context {
        Context {
            stream_ready: self.stream.as_ref().is_some_and(LiveStream::is_live),
            fatal: self.fatal,
            stop_tracks_on_stop: self.config.stop_tracks_on_stop,
        }
    }

    fn handle(&mut self, event: Event) {
        log::debug!("Received event: {}", event.label());

        if let Event::TrackEnded { track } = &event {
            if !self.holds_track(*track) {
                log::debug!("Ignoring end of track {} outside the held stream", track);
                return;
            }
        }

        let old_discriminant = std::mem::discriminant(&self.state);
        let (next, effects) = reduce(&self.state, event, &self.context());
        let new_discriminant = std::mem::discriminant(&next);

        if old_discriminant != new_discriminant {
            log::info!("State transition: {:?} -> {:?}", self.state, next);
        }

        self.state = next;

        for effect in effects {
            self.apply(effect);
        }
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::AcquireMedia { take } => {
                let on_screen_ended = self.config.screen.then(|| self.ended_observer());
                self.runner.spawn(
                    Job::Acquire {
                        take,
                        request: self.config.media_request(),
                        on_screen_ended,
                    },
                    self.tx.clone(),
                );
            }

            Effect::AdoptStream(stream) => {
                let held_already = match self.stream.take() {
                    Some(old) if old.id() != stream.id() => {
                        log::debug!("Replacing stream {} with {}", old.id(), stream.id());
                        old.stop_all();
                        false
                    }
                    Some(_) => true,
                    None => false,
                };
                if !held_already {
                    // Losing the input device ends the take
                    for track in stream.audio_tracks() {
                        track.on_ended(self.ended_observer());
                    }
                }
                stream.set_audio_enabled(!self.muted);
                stream
                    .analyser()
                    .configure(self.config.visualizer.fft_size, self.config.visualizer.smoothing);
                log::info!(
                    "Holding stream {} ({} tracks)",
                    stream.id(),
                    stream.tracks().len()
                );
                self.stream = Some(stream);
            }

            Effect::ReleaseStream(stream) => {
                if self.stream.as_ref().map(LiveStream::id) != Some(stream.id()) {
                    stream.stop_all();
                }
            }

            Effect::StopTracks => {
                if let Some(stream) = &self.stream {
                    log::debug!("Stopping tracks of stream {}", stream.id());
                    stream.stop_all();
                }
            }

            Effect::StartEngine { take, leg } => match &self.stream {
                Some(stream) => {
                    if leg == 0 {
                        self.take_start = self.buffer.len();
                    }
                    self.clock.run(leg == 0);
                    self.runner.spawn(
                        Job::StartLeg {
                            stream: stream.clone(),
                            options: LegOptions {
                                take,
                                leg,
                                flush_interval: self.config.flush_interval(),
                                mime_type: self.config.recorder_mime_type().to_string(),
                            },
                        },
                        self.tx.clone(),
                    )
                }
                None => {
                    log::error!("No stream to record take {} from", take);
                    let event = Event::EngineFailed {
                        take,
                        leg,
                        error: ErrorCode::DeviceUnavailable,
                    };
                    if self.tx.try_send(event).is_err() {
                        log::error!("Session queue full, engine failure lost");
                    }
                }
            },

            Effect::PauseEngine { take, leg } => {
                self.clock.halt();
                self.runner.spawn(Job::PauseLeg { take, leg }, self.tx.clone())
            }
            Effect::StopEngine { take, leg } => {
                self.clock.halt();
                self.runner.spawn(Job::StopLeg { take, leg }, self.tx.clone())
            }
            Effect::DisposeEngine { take } => {
                self.clock.halt();
                self.runner.spawn(Job::DisposeTake { take }, self.tx.clone())
            }

            Effect::BufferChunk(data) => {
                if data.is_empty() {
                    return;
                }
                let seq = self.buffer.push(data);
                log::trace!("Buffered chunk {} ({} total bytes)", seq, self.buffer.total_bytes());
            }

            Effect::DiscardBuffer => {
                let discarded = self.buffer.len().saturating_sub(self.take_start);
                if discarded > 0 {
                    log::info!("Discarding {} buffered chunks", discarded);
                }
                self.buffer.truncate(self.take_start);
            }
            Effect::ClearBuffer => {
                self.buffer.clear();
                self.take_start = 0;
            }

            Effect::Assemble => {
                let artifact = assemble(&self.buffer.snapshot(), &self.media_type);
                log::info!(
                    "Assembled {} bytes from {} chunks",
                    artifact.len(),
                    artifact.fragments
                );
                // Superseded references stay resolvable until the caller
                // revokes them through the store
                self.artifact = Some(self.store.create_ref(artifact));
            }

            Effect::RefreshArtifact => {
                let artifact = assemble(&self.buffer.snapshot(), &self.media_type);
                log::debug!("Refreshed artifact to {} bytes", artifact.len());
                let refreshed = self
                    .artifact
                    .as_ref()
                    .is_some_and(|reference| self.store.replace(reference, artifact.clone()));
                if !refreshed {
                    self.artifact = Some(self.store.create_ref(artifact));
                }
            }

            Effect::NotifyStart => {
                if let Some(on_start) = &self.on_start {
                    on_start();
                }
            }

            Effect::NotifyStop => {
                let Some(on_stop) = &self.on_stop else {
                    return;
                };
                if let Some(reference) = &self.artifact {
                    if let Some(artifact) = self.store.resolve(reference) {
                        on_stop(reference, &artifact);
                    }
                }
            }

            Effect::SetAudioEnabled(enabled) => {
                self.muted = !enabled;
                if let Some(stream) = &self.stream {
                    stream.set_audio_enabled(enabled);
                }
            }

            Effect::RevokeArtifact => {
                if let Some(reference) = self.artifact.take() {
                    self.store.revoke(&reference);
                }
            }

            Effect::StartVisualizer => {
                let (Some(target), Some(stream)) = (&self.render_target, &self.stream) else {
                    return;
                };
                if let Some(mut previous) = self.visualizer.take() {
                    previous.stop();
                }
                self.visualizer = Some(Visualizer::start(
                    stream.analyser().clone(),
                    target.clone(),
                    &self.config.visualizer,
                ));
            }

            Effect::StopVisualizer => {
                if let Some(mut visualizer) = self.visualizer.take() {
                    visualizer.stop();
                }
            }

            Effect::EmitSnapshot => {
                self.snapshot_tx.send_replace(self.snapshot());
            }
        }
    }

    fn holds_track(&self, id: uuid::Uuid) -> bool {
        self.stream
            .as_ref()
            .is_some_and(|s| s.tracks().iter().any(|t| t.id() == id))
    }

    fn ended_observer(&self) -> EndedObserver {
        let tx = self.tx.clone();
        Arc::new(move |track: &MediaTrack| {
            log::info!("{:?} track '{}' ended", track.kind(), track.label());
            if tx.try_send(Event::TrackEnded { track: track.id() }).is_err() {
                log::warn!("Could not deliver end of track {}", track.id());
            }
        })
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            status: self.state.status(),
            error: self.state.error(),
            artifact: self.artifact.clone(),
            is_muted: self.muted,
            buffered_chunks: self.buffer.len(),
            elapsed_ms: u64::try_from(self.clock.elapsed().as_millis()).unwrap_or(u64::MAX),
            preview_stream: self.stream.as_ref().and_then(|s| s.view(TrackKind::Video)),
            preview_audio_stream: self.stream.as_ref().and_then(|s| s.view(TrackKind::Audio)),
            clock: self.clock,
        }
    }

    /// Tracks first, then the visualizer, then engine resources.
    fn shutdown(&mut self) {
        if let Some(stream) = &self.stream {
            log::info!("Releasing stream {}", stream.id());
            stream.stop_all();
        }
        if let Some(mut visualizer) = self.visualizer.take() {
            visualizer.stop();
        }
        self.runner.spawn(Job::Shutdown, self.tx.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::{Capabilities, StubEffectRunner};

    #[tokio::test]
    async fn screen_without_display_capture_blocks_start() {
        let runner = StubEffectRunner::with_capabilities(Capabilities {
            display_capture: false,
            recording: true,
        });
        let config = SessionConfig {
            screen: true,
            ..SessionConfig::default()
        };
        let session = Session::builder(config, runner.clone()).spawn();
        assert_eq!(session.error(), ErrorCode::UnsupportedCapability);

        session.start().unwrap();
        // Reduced after the start, so the start has been handled once it shows
        session.mute_audio().unwrap();
        let snapshot = session.wait_for(|s| s.is_muted).await.unwrap();
        assert_eq!(snapshot.status, Status::Idle);
        assert_eq!(snapshot.error, ErrorCode::UnsupportedCapability);
        assert!(runner.jobs().is_empty());
    }

    #[tokio::test]
    async fn elapsed_time_excludes_pauses() {
        let session = Session::builder(SessionConfig::default(), StubEffectRunner::new()).spawn();
        session.start().unwrap();
        session
            .wait_for(|s| s.status == Status::Recording)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        session.pause().unwrap();
        let paused = session
            .wait_for(|s| s.status == Status::Paused)
            .await
            .unwrap();
        assert!(paused.elapsed() >= Duration::from_millis(40));
        assert!(paused.elapsed_ms >= 40);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(session.elapsed(), paused.elapsed());

        session.resume().unwrap();
        session
            .wait_for(|s| s.status == Status::Recording)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let running = session.elapsed();
        assert!(running > paused.elapsed());
        assert!(running < paused.elapsed() + Duration::from_millis(150));
    }

    #[tokio::test]
    async fn acquire_on_construct_holds_stream_without_recording() {
        let runner = StubEffectRunner::new();
        let config = SessionConfig {
            acquire_on_construct: true,
            ..SessionConfig::default()
        };
        let session = Session::builder(config, runner.clone()).spawn();

        let snapshot = session
            .wait_for(|s| s.preview_audio_stream.is_some())
            .await
            .unwrap();
        assert_eq!(snapshot.status, Status::Idle);
        assert!(snapshot.preview_stream.is_none());
        assert_eq!(runner.jobs(), vec!["acquire"]);

        // The held stream is used directly
        session.start().unwrap();
        session
            .wait_for(|s| s.status == Status::Recording)
            .await
            .unwrap();
        assert_eq!(runner.jobs(), vec!["acquire", "start_leg"]);
    }

    #[tokio::test]
    async fn commands_after_teardown_are_refused() {
        let session = Session::builder(SessionConfig::default(), StubEffectRunner::new()).spawn();
        session.teardown().await;
        session.teardown().await;
        assert_eq!(session.start(), Err(SessionError::Closed));
        assert_eq!(session.send(Event::Stop).await, Err(SessionError::Closed));
    }

    #[tokio::test]
    async fn snapshot_serializes_camel_case() {
        let session = Session::builder(SessionConfig::default(), StubEffectRunner::new()).spawn();
        let json = serde_json::to_value(session.snapshot()).unwrap();
        assert_eq!(json["status"], "idle");
        assert_eq!(json["error"], "NONE");
        assert_eq!(json["isMuted"], false);
        assert_eq!(json["elapsedMs"], 0);
        assert!(json.get("previewStream").is_none());
    }
}

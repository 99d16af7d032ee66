//! Effect runner for the recording session
//!
//! The session loop applies bookkeeping effects (buffer, artifact, snapshot)
//! inline and hands device work to an `EffectRunner` as `Job`s. Completion is
//! reported back as `Event`s on the session channel.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::audio::{
    acquire, EndedObserver, EngineLeg, LegOptions, LiveStream, MediaDevices, MediaRequest,
    SignalFormat,
};
use crate::error::{CaptureError, ErrorCode};
use crate::state_machine::Event;

/// Device work requested by the session.
pub enum Job {
    Acquire {
        take: Uuid,
        request: MediaRequest,
        on_screen_ended: Option<EndedObserver>,
    },
    /// Start a leg; any previous leg of the same take is disposed first.
    StartLeg {
        stream: LiveStream,
        options: LegOptions,
    },
    PauseLeg {
        take: Uuid,
        leg: u32,
    },
    StopLeg {
        take: Uuid,
        leg: u32,
    },
    DisposeTake {
        take: Uuid,
    },
    /// Release every engine resource (session teardown).
    Shutdown,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::Acquire { take, request, .. } => f
                .debug_struct("Acquire")
                .field("take", take)
                .field("request", request)
                .finish_non_exhaustive(),
            Job::StartLeg { stream, options } => f
                .debug_struct("StartLeg")
                .field("stream", &stream.id())
                .field("options", options)
                .finish(),
            Job::PauseLeg { take, leg } => write!(f, "PauseLeg({}, {})", take, leg),
            Job::StopLeg { take, leg } => write!(f, "StopLeg({}, {})", take, leg),
            Job::DisposeTake { take } => write!(f, "DisposeTake({})", take),
            Job::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// What the backend behind a runner can do. Checked once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub display_capture: bool,
    pub recording: bool,
}

/// Trait for running device jobs asynchronously.
/// Completion events are sent back via the provided channel.
pub trait EffectRunner: Send + Sync + 'static {
    fn spawn(&self, job: Job, tx: mpsc::Sender<Event>);

    fn capabilities(&self) -> Capabilities;
}

/// Runner backed by a real `MediaDevices` and recording engine legs.
pub struct DeviceEffectRunner {
    devices: Arc<dyn MediaDevices>,
    legs: Arc<Mutex<HashMap<Uuid, EngineLeg>>>,
}

impl DeviceEffectRunner {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Arc<Self> {
        Arc::new(Self {
            devices,
            legs: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn legs(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, EngineLeg>> {
        self.legs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EffectRunner for DeviceEffectRunner {
    fn spawn(&self, job: Job, tx: mpsc::Sender<Event>) {
        match job {
            Job::Acquire {
                take,
                request,
                on_screen_ended,
            } => {
                let devices = self.devices.clone();
                tokio::spawn(async move {
                    // Permission prompts and device handshakes block
                    let result = tokio::task::spawn_blocking(move || {
                        acquire(devices.as_ref(), &request, on_screen_ended)
                    })
                    .await;

                    let event = match result {
                        Ok(Ok(stream)) => Event::MediaAcquired { take, stream },
                        Ok(Err(e)) => {
                            log::error!("Failed to acquire media: {}", e);
                            Event::MediaFailed {
                                take,
                                error: e.code(),
                            }
                        }
                        Err(e) => {
                            log::error!("Acquisition task failed: {}", e);
                            Event::MediaFailed {
                                take,
                                error: ErrorCode::DeviceUnavailable,
                            }
                        }
                    };
                    if let Err(mpsc::error::SendError(event)) = tx.send(event).await {
                        // Session is gone; do not leak the device
                        if let Event::MediaAcquired { stream, .. } = event {
                            stream.stop_all();
                        }
                    }
                });
            }

            Job::StartLeg { stream, options } => {
                let (take, leg) = (options.take, options.leg);
                let previous = self.legs().remove(&take).map(EngineLeg::dispose);

                match EngineLeg::start(&stream, options, previous, tx.clone()) {
                    Ok(engine) => {
                        self.legs().insert(take, engine);
                    }
                    Err(e) => {
                        log::error!("Failed to start engine leg {} of take {}: {}", leg, take, e);
                        tokio::spawn(async move {
                            let _ = tx
                                .send(Event::EngineFailed {
                                    take,
                                    leg,
                                    error: e.code(),
                                })
                                .await;
                        });
                    }
                }
            }

            Job::PauseLeg { take, leg } => match self.legs().get(&take) {
                Some(engine) if engine.leg() == leg => engine.pause(),
                _ => log::warn!("PauseLeg: no active leg {} for take {}", leg, take),
            },

            Job::StopLeg { take, leg } => {
                let engine = self.legs().remove(&take);
                match engine {
                    // The leg reports EngineStopped after its final chunk
                    Some(engine) => engine.stop(),
                    None => {
                        log::warn!("StopLeg: no active leg for take {}", take);
                        tokio::spawn(async move {
                            let _ = tx.send(Event::EngineStopped { take, leg }).await;
                        });
                    }
                }
            }

            Job::DisposeTake { take } => {
                if let Some(engine) = self.legs().remove(&take) {
                    drop(engine.dispose());
                }
            }

            Job::Shutdown => {
                let legs: Vec<EngineLeg> = self.legs().drain().map(|(_, leg)| leg).collect();
                if !legs.is_empty() {
                    log::info!("Disposing {} engine leg(s)", legs.len());
                }
                for engine in legs {
                    drop(engine.dispose());
                }
            }
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            display_capture: self.devices.supports_display_capture(),
            recording: self.devices.supports_recording(),
        }
    }
}

/// How the stub answers acquisition requests.
#[derive(Debug, Clone)]
pub enum StubAcquire {
    /// A fresh synthetic audio stream per acquisition
    Grant,
    Deny(CaptureError),
    /// Never answer; the take stays in `acquiring_media`
    Hold,
}

#[derive(Clone)]
struct StubLeg {
    take: Uuid,
    leg: u32,
    tx: mpsc::Sender<Event>,
}

/// Scripted runner for tests and demos. Chunks are injected by the caller
/// with `deliver_chunk`; nothing touches real devices.
pub struct StubEffectRunner {
    acquire: Mutex<StubAcquire>,
    capabilities: Capabilities,
    current: Mutex<Option<StubLeg>>,
    fail_next_leg: Mutex<Option<CaptureError>>,
    streams: Mutex<Vec<LiveStream>>,
    jobs: Mutex<Vec<String>>,
}

impl StubEffectRunner {
    pub fn new() -> Arc<Self> {
        Self::with_acquire(StubAcquire::Grant)
    }

    pub fn with_acquire(acquire: StubAcquire) -> Arc<Self> {
        Arc::new(Self {
            acquire: Mutex::new(acquire),
            ..Self::bare()
        })
    }

    pub fn with_capabilities(capabilities: Capabilities) -> Arc<Self> {
        Arc::new(Self {
            capabilities,
            ..Self::bare()
        })
    }

    fn bare() -> Self {
        Self {
            acquire: Mutex::new(StubAcquire::Grant),
            capabilities: Capabilities {
                display_capture: true,
                recording: true,
            },
            current: Mutex::new(None),
            fail_next_leg: Mutex::new(None),
            streams: Mutex::new(Vec::new()),
            jobs: Mutex::new(Vec::new()),
        }
    }

    pub fn set_acquire(&self, acquire: StubAcquire) {
        *lock(&self.acquire) = acquire;
    }

    /// The next `StartLeg` fails with `error`.
    pub fn fail_next_leg(&self, error: CaptureError) {
        *lock(&self.fail_next_leg) = Some(error);
    }

    /// Deliver a chunk as the current leg. Returns false if no leg is active.
    pub async fn deliver_chunk(&self, data: impl Into<Bytes>) -> bool {
        let Some(current) = lock(&self.current).clone() else {
            return false;
        };
        current
            .tx
            .send(Event::DataAvailable {
                take: current.take,
                leg: current.leg,
                data: data.into(),
            })
            .await
            .is_ok()
    }

    /// Every stream handed out so far, oldest first.
    pub fn streams(&self) -> Vec<LiveStream> {
        lock(&self.streams).clone()
    }

    pub fn last_stream(&self) -> Option<LiveStream> {
        lock(&self.streams).last().cloned()
    }

    /// Names of the jobs received so far, in order.
    pub fn jobs(&self) -> Vec<String> {
        lock(&self.jobs).clone()
    }

    pub fn active_leg(&self) -> Option<(Uuid, u32)> {
        lock(&self.current).as_ref().map(|l| (l.take, l.leg))
    }

    fn record(&self, name: &str) {
        lock(&self.jobs).push(name.to_string());
    }

    fn reply(&self, tx: mpsc::Sender<Event>, event: Event) {
        tokio::spawn(async move {
            let _ = tx.send(event).await;
        });
    }
}

impl EffectRunner for StubEffectRunner {
    fn spawn(&self, job: Job, tx: mpsc::Sender<Event>) {
        match job {
            Job::Acquire { take, .. } => {
                self.record("acquire");
                let outcome = lock(&self.acquire).clone();
                match outcome {
                    StubAcquire::Grant => {
                        let (stream, _track) = LiveStream::synthetic(SignalFormat::default());
                        lock(&self.streams).push(stream.clone());
                        log::info!("Stub: media acquired, stream={}", stream.id());
                        self.reply(tx, Event::MediaAcquired { take, stream });
                    }
                    StubAcquire::Deny(e) => {
                        log::info!("Stub: media denied: {}", e);
                        self.reply(
                            tx,
                            Event::MediaFailed {
                                take,
                                error: e.code(),
                            },
                        );
                    }
                    StubAcquire::Hold => log::info!("Stub: holding acquisition for {}", take),
                }
            }

            Job::StartLeg { options, .. } => {
                self.record("start_leg");
                let (take, leg) = (options.take, options.leg);
                if let Some(e) = lock(&self.fail_next_leg).take() {
                    log::info!("Stub: engine leg {} failing: {}", leg, e);
                    self.reply(
                        tx,
                        Event::EngineFailed {
                            take,
                            leg,
                            error: e.code(),
                        },
                    );
                    return;
                }
                *lock(&self.current) = Some(StubLeg {
                    take,
                    leg,
                    tx: tx.clone(),
                });
                self.reply(tx, Event::EngineStarted { take, leg });
            }

            Job::PauseLeg { .. } => self.record("pause_leg"),

            Job::StopLeg { take, leg } => {
                self.record("stop_leg");
                lock(&self.current).take();
                self.reply(tx, Event::EngineStopped { take, leg });
            }

            Job::DisposeTake { .. } => {
                self.record("dispose_take");
                lock(&self.current).take();
            }

            Job::Shutdown => {
                self.record("shutdown");
                lock(&self.current).take();
            }
        }
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::audio::acquire::fake::FakeDevices;

    async fn next_event(rx: &mut mpsc::Receiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn acquire_reports_stream() {
        let runner = DeviceEffectRunner::new(FakeDevices::new());
        let (tx, mut rx) = mpsc::channel(8);
        let take = Uuid::new_v4();

        runner.spawn(
            Job::Acquire {
                take,
                request: MediaRequest::default(),
                on_screen_ended: None,
            },
            tx,
        );

        match next_event(&mut rx).await {
            Event::MediaAcquired { take: t, stream } => {
                assert_eq!(t, take);
                assert!(stream.has_live_audio());
            }
            other => panic!("unexpected {}", other.label()),
        }
    }

    #[tokio::test]
    async fn acquire_failure_reports_code() {
        let devices = Arc::new(FakeDevices {
            display: true,
            microphone_error: Some(CaptureError::DeviceUnavailable("gone".into())),
            issued: Default::default(),
        });
        let runner = DeviceEffectRunner::new(devices);
        let (tx, mut rx) = mpsc::channel(8);

        runner.spawn(
            Job::Acquire {
                take: Uuid::new_v4(),
                request: MediaRequest::default(),
                on_screen_ended: None,
            },
            tx,
        );

        assert!(matches!(
            next_event(&mut rx).await,
            Event::MediaFailed {
                error: ErrorCode::DeviceUnavailable,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn stop_without_leg_still_reports_stopped() {
        let runner = DeviceEffectRunner::new(FakeDevices::new());
        let (tx, mut rx) = mpsc::channel(8);
        let take = Uuid::new_v4();

        runner.spawn(Job::StopLeg { take, leg: 0 }, tx);
        assert!(matches!(
            next_event(&mut rx).await,
            Event::EngineStopped { leg: 0, .. }
        ));
    }

    #[tokio::test]
    async fn resume_leg_waits_for_previous_leg() {
        let runner = DeviceEffectRunner::new(FakeDevices::new());
        let (stream, track) = LiveStream::synthetic(SignalFormat::default());
        let (tx, mut rx) = mpsc::channel(16);
        let take = Uuid::new_v4();
        let options = |leg| LegOptions {
            take,
            leg,
            flush_interval: Duration::from_secs(3600),
            mime_type: "audio/pcm".to_string(),
        };

        runner.spawn(
            Job::StartLeg {
                stream: stream.clone(),
                options: options(0),
            },
            tx.clone(),
        );
        assert!(matches!(next_event(&mut rx).await, Event::EngineStarted { leg: 0, .. }));

        track.publish(&[1]);
        runner.spawn(Job::PauseLeg { take, leg: 0 }, tx.clone());
        runner.spawn(
            Job::StartLeg {
                stream: stream.clone(),
                options: options(1),
            },
            tx.clone(),
        );

        // Leg 0's tail chunk precedes leg 1's start
        match next_event(&mut rx).await {
            Event::DataAvailable { leg, data, .. } => {
                assert_eq!(leg, 0);
                assert_eq!(&data[..], &[1, 0]);
            }
            other => panic!("unexpected {}", other.label()),
        }
        assert!(matches!(next_event(&mut rx).await, Event::EngineStarted { leg: 1, .. }));

        track.publish(&[2]);
        runner.spawn(Job::StopLeg { take, leg: 1 }, tx);
        assert!(matches!(
            next_event(&mut rx).await,
            Event::DataAvailable { leg: 1, .. }
        ));
        assert!(matches!(next_event(&mut rx).await, Event::EngineStopped { leg: 1, .. }));
    }

    #[tokio::test]
    async fn unknown_encoder_reports_engine_failure() {
        let runner = DeviceEffectRunner::new(FakeDevices::new());
        let (stream, _track) = LiveStream::synthetic(SignalFormat::default());
        let (tx, mut rx) = mpsc::channel(8);

        runner.spawn(
            Job::StartLeg {
                stream,
                options: LegOptions {
                    take: Uuid::new_v4(),
                    leg: 0,
                    flush_interval: Duration::from_secs(1),
                    mime_type: "video/webm".to_string(),
                },
            },
            tx,
        );
        assert!(matches!(
            next_event(&mut rx).await,
            Event::EngineFailed {
                error: ErrorCode::NoRecorderAvailable,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn stub_delivers_chunks_for_current_leg() {
        let stub = StubEffectRunner::new();
        let (tx, mut rx) = mpsc::channel(8);
        assert!(!stub.deliver_chunk(&b"early"[..]).await);

        let (stream, _) = LiveStream::synthetic(SignalFormat::default());
        let take = Uuid::new_v4();
        stub.spawn(
            Job::StartLeg {
                stream,
                options: LegOptions {
                    take,
                    leg: 0,
                    flush_interval: Duration::from_secs(1),
                    mime_type: "audio/wav".to_string(),
                },
            },
            tx,
        );
        assert!(stub.deliver_chunk(vec![0u8; 10]).await);
        assert_eq!(stub.active_leg(), Some((take, 0)));
        assert_eq!(stub.jobs(), vec!["start_leg"]);

        let mut saw_chunk = false;
        for _ in 0..2 {
            if let Event::DataAvailable { data, .. } = next_event(&mut rx).await {
                assert_eq!(data.len(), 10);
                saw_chunk = true;
            }
        }
        assert!(saw_chunk);
    }
}

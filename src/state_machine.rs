//! State machine for the recording session
//!
//! This module implements the core state machine using a single-writer pattern.
//! All state transitions go through the `reduce()` function, which returns
//! a new state and a list of effects to execute.

use bytes::Bytes;
use serde::Serialize;
use uuid::Uuid;

use crate::audio::LiveStream;
use crate::error::ErrorCode;

/// Internal state of the recording workflow.
/// This is the authoritative state - all transitions go through the reducer.
///
/// `take` identifies one start..stop recording; `leg` numbers the engine
/// instances within it (0 at start, +1 per resume).
#[derive(Debug, Clone, PartialEq)]
pub enum State {
    Idle {
        error: ErrorCode,
    },
    AcquiringMedia {
        take: Uuid,
        /// False when acquiring ahead of time (acquire on construct).
        record: bool,
    },
    Recording {
        take: Uuid,
        leg: u32,
    },
    Paused {
        take: Uuid,
        leg: u32,
    },
    Stopping {
        take: Uuid,
        leg: u32,
    },
    Stopped,
}

impl Default for State {
    fn default() -> Self {
        State::Idle {
            error: ErrorCode::None,
        }
    }
}

impl State {
    pub fn status(&self) -> Status {
        match self {
            State::Idle { .. } => Status::Idle,
            State::AcquiringMedia { .. } => Status::AcquiringMedia,
            State::Recording { .. } => Status::Recording,
            State::Paused { .. } => Status::Paused,
            State::Stopping { .. } => Status::Stopping,
            State::Stopped => Status::Stopped,
        }
    }

    pub fn error(&self) -> ErrorCode {
        match self {
            State::Idle { error } => *error,
            _ => ErrorCode::None,
        }
    }

    /// The take in flight, if any.
    pub fn take(&self) -> Option<Uuid> {
        match self {
            State::AcquiringMedia { take, .. }
            | State::Recording { take, .. }
            | State::Paused { take, .. }
            | State::Stopping { take, .. } => Some(*take),
            State::Idle { .. } | State::Stopped => None,
        }
    }
}

/// Status vocabulary exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Idle,
    AcquiringMedia,
    Recording,
    Paused,
    Stopping,
    Stopped,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Idle => "idle",
            Status::AcquiringMedia => "acquiring_media",
            Status::Recording => "recording",
            Status::Paused => "paused",
            Status::Stopping => "stopping",
            Status::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that can trigger state transitions.
/// Commands come from the session handle; notifications from the
/// acquisition and engine tasks.
#[derive(Debug, Clone)]
pub enum Event {
    // Commands
    Start,
    Pause,
    Resume,
    Stop,
    MuteAudio,
    UnmuteAudio,
    ClearArtifact,
    /// Acquire the stream without recording (acquire on construct)
    Prime,

    // Acquisition
    MediaAcquired {
        take: Uuid,
        stream: LiveStream,
    },
    MediaFailed {
        take: Uuid,
        error: ErrorCode,
    },

    // Engine notifications
    EngineStarted {
        take: Uuid,
        leg: u32,
    },
    DataAvailable {
        take: Uuid,
        leg: u32,
        data: Bytes,
    },
    EngineStopped {
        take: Uuid,
        leg: u32,
    },
    EngineFailed {
        take: Uuid,
        leg: u32,
        error: ErrorCode,
    },

    /// A held track was ended by the platform (device lost or sharing revoked)
    TrackEnded {
        track: Uuid,
    },
}

impl Event {
    /// Short name for logs (chunks and streams are too noisy for `Debug`).
    pub fn label(&self) -> &'static str {
        match self {
            Event::Start => "start",
            Event::Pause => "pause",
            Event::Resume => "resume",
            Event::Stop => "stop",
            Event::MuteAudio => "mute_audio",
            Event::UnmuteAudio => "unmute_audio",
            Event::ClearArtifact => "clear_artifact",
            Event::Prime => "prime",
            Event::MediaAcquired { .. } => "media_acquired",
            Event::MediaFailed { .. } => "media_failed",
            Event::EngineStarted { .. } => "engine_started",
            Event::DataAvailable { .. } => "data_available",
            Event::EngineStopped { .. } => "engine_stopped",
            Event::EngineFailed { .. } => "engine_failed",
            Event::TrackEnded { .. } => "track_ended",
        }
    }
}

/// Effects to be executed after a state transition.
/// The session loop applies them in order.
#[derive(Debug, Clone)]
pub enum Effect {
    AcquireMedia { take: Uuid },
    /// Make this the held stream, stopping the previous one
    AdoptStream(LiveStream),
    /// Stop the tracks of a stream that arrived for an abandoned take
    ReleaseStream(LiveStream),
    /// Stop the tracks of the held stream
    StopTracks,
    StartEngine { take: Uuid, leg: u32 },
    PauseEngine { take: Uuid, leg: u32 },
    StopEngine { take: Uuid, leg: u32 },
    DisposeEngine { take: Uuid },
    BufferChunk(Bytes),
    /// Drop the buffered chunks of a failed or abandoned take
    DiscardBuffer,
    /// Assemble the buffer and publish the artifact
    Assemble,
    /// Assemble the buffer into the current reference, keeping its handle
    RefreshArtifact,
    /// Empty the buffer after a completed stop
    ClearBuffer,
    NotifyStart,
    NotifyStop,
    SetAudioEnabled(bool),
    RevokeArtifact,
    StartVisualizer,
    StopVisualizer,
    /// Publish the session snapshot to observers
    EmitSnapshot,
}

/// Facts about the world outside the state the reducer needs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Context {
    /// A held stream exists and none of its tracks has ended
    pub stream_ready: bool,
    /// Construction-time failure that blocks every start
    pub fatal: Option<ErrorCode>,
    pub stop_tracks_on_stop: bool,
}

/// Reducer function: (state, event, context) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore notifications with stale take ids
/// - Always emit EmitSnapshot after observable changes
pub fn reduce(state: &State, event: Event, ctx: &Context) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use State::*;

    let current_take = state.take();
    let is_current = |take: Uuid| current_take == Some(take);

    match (state, event) {
        // -----------------
        // Start
        // -----------------
        (Idle { .. } | Stopped, Start) => {
            if let Some(fatal) = ctx.fatal {
                log::warn!("Start refused: {}", fatal);
                return (Idle { error: fatal }, vec![EmitSnapshot]);
            }
            let take = Uuid::new_v4();
            if ctx.stream_ready {
                (
                    Recording { take, leg: 0 },
                    vec![StartEngine { take, leg: 0 }, StartVisualizer, EmitSnapshot],
                )
            } else {
                (
                    AcquiringMedia { take, record: true },
                    vec![AcquireMedia { take }, EmitSnapshot],
                )
            }
        }
        (_, Start) => {
            log::debug!("Start ignored while {}", state.status());
            (state.clone(), vec![])
        }

        (Idle { .. }, Prime) if ctx.fatal.is_none() && !ctx.stream_ready => {
            let take = Uuid::new_v4();
            (
                AcquiringMedia {
                    take,
                    record: false,
                },
                vec![AcquireMedia { take }, EmitSnapshot],
            )
        }

        // -----------------
        // AcquiringMedia
        // -----------------
        (AcquiringMedia { take, record }, MediaAcquired { take: id, stream }) if *take == id => {
            if *record {
                (
                    Recording {
                        take: *take,
                        leg: 0,
                    },
                    vec![
                        AdoptStream(stream),
                        StartEngine {
                            take: *take,
                            leg: 0,
                        },
                        StartVisualizer,
                        EmitSnapshot,
                    ],
                )
            } else {
                (
                    Idle {
                        error: ErrorCode::None,
                    },
                    vec![AdoptStream(stream), EmitSnapshot],
                )
            }
        }
        (AcquiringMedia { take, .. }, MediaFailed { take: id, error }) if *take == id => {
            (Idle { error }, vec![EmitSnapshot])
        }
        (AcquiringMedia { .. }, Stop) => (
            Idle {
                error: ErrorCode::None,
            },
            vec![EmitSnapshot],
        ),

        // -----------------
        // Recording
        // -----------------
        (Recording { take, leg }, Pause) => (
            Paused {
                take: *take,
                leg: *leg,
            },
            vec![
                PauseEngine {
                    take: *take,
                    leg: *leg,
                },
                StopVisualizer,
                Assemble,
                EmitSnapshot,
            ],
        ),
        (Recording { take, leg }, EngineStarted { take: id, leg: l })
            if *take == id && *leg == l =>
        {
            (state.clone(), vec![NotifyStart])
        }

        // -----------------
        // Paused
        // -----------------
        // A new engine leg on the same stream; the previous leg is disposed
        // by the runner before the new one emits anything.
        (Paused { take, leg }, Resume) => (
            Recording {
                take: *take,
                leg: leg + 1,
            },
            vec![
                StartEngine {
                    take: *take,
                    leg: leg + 1,
                },
                StartVisualizer,
                EmitSnapshot,
            ],
        ),

        // -----------------
        // Stop (recording or paused)
        // -----------------
        (Recording { take, leg } | Paused { take, leg }, Stop) => (
            Stopping {
                take: *take,
                leg: *leg,
            },
            vec![
                StopEngine {
                    take: *take,
                    leg: *leg,
                },
                StopVisualizer,
                EmitSnapshot,
            ],
        ),
        // A track ended out-of-band takes the stop path
        (Recording { take, leg } | Paused { take, leg }, TrackEnded { track }) => {
            log::info!("Track {} ended by platform, stopping take {}", track, take);
            (
                Stopping {
                    take: *take,
                    leg: *leg,
                },
                vec![
                    StopEngine {
                        take: *take,
                        leg: *leg,
                    },
                    StopVisualizer,
                    EmitSnapshot,
                ],
            )
        }

        // -----------------
        // Chunks: accepted from any leg of the current take
        // -----------------
        (Recording { take, .. } | Stopping { take, .. }, DataAvailable { take: id, data, .. })
            if *take == id =>
        {
            (state.clone(), vec![BufferChunk(data), EmitSnapshot])
        }
        // Tail of a pausing leg: refresh the interim artifact
        (Paused { take, .. }, DataAvailable { take: id, data, .. }) if *take == id => (
            state.clone(),
            vec![BufferChunk(data), RefreshArtifact, EmitSnapshot],
        ),

        // -----------------
        // Stopping
        // -----------------
        (Stopping { take, leg }, EngineStopped { take: id, leg: l }) if *take == id && *leg == l => {
            let mut effects = vec![Assemble, NotifyStop, ClearBuffer];
            if ctx.stop_tracks_on_stop {
                effects.push(StopTracks);
            }
            effects.push(EmitSnapshot);
            (Stopped, effects)
        }

        // -----------------
        // Engine errors: no partial artifact
        // -----------------
        (
            Recording { take, .. } | Paused { take, .. } | Stopping { take, .. },
            EngineFailed { take: id, leg, error },
        ) if *take == id => {
            log::warn!("Engine leg {} of take {} failed: {}", leg, take, error);
            (
                Idle { error },
                vec![
                    DisposeEngine { take: *take },
                    DiscardBuffer,
                    StopVisualizer,
                    EmitSnapshot,
                ],
            )
        }

        // -----------------
        // Any state
        // -----------------
        (_, MuteAudio) => (state.clone(), vec![SetAudioEnabled(false), EmitSnapshot]),
        (_, UnmuteAudio) => (state.clone(), vec![SetAudioEnabled(true), EmitSnapshot]),

        (_, ClearArtifact) => {
            let mut effects = vec![RevokeArtifact];
            if let Recording { take, .. } | Paused { take, .. } | Stopping { take, .. } = state {
                log::info!("Clearing artifact abandons take {}", take);
                effects.extend([DisposeEngine { take: *take }, DiscardBuffer, StopVisualizer]);
            }
            effects.push(EmitSnapshot);
            (
                Idle {
                    error: state.error(),
                },
                effects,
            )
        }

        // -----------------
        // Stale notifications (drop, releasing what they carry)
        // -----------------
        (_, MediaAcquired { take, stream }) => {
            log::debug!("Releasing stream {} for stale take {}", stream.id(), take);
            (state.clone(), vec![ReleaseStream(stream)])
        }
        (_, MediaFailed { take, .. }) if !is_current(take) => (state.clone(), vec![]),
        (_, DataAvailable { take, leg, data }) if !is_current(take) => {
            log::debug!(
                "Dropping {} bytes from stale leg {} of take {}",
                data.len(),
                leg,
                take
            );
            (state.clone(), vec![])
        }
        (_, EngineStopped { take, .. }) if !is_current(take) => (state.clone(), vec![]),
        (_, EngineFailed { take, .. }) if !is_current(take) => (state.clone(), vec![]),

        // -----------------
        // Unhandled: no transition
        // -----------------
        _ => (state.clone(), vec![]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SignalFormat;

    fn ctx() -> Context {
        Context {
            stream_ready: false,
            fatal: None,
            stop_tracks_on_stop: true,
        }
    }

    fn ready() -> Context {
        Context {
            stream_ready: true,
            ..ctx()
        }
    }

    fn stream() -> LiveStream {
        LiveStream::synthetic(SignalFormat::default()).0
    }

    fn has(effects: &[Effect], pred: impl Fn(&Effect) -> bool) -> bool {
        effects.iter().any(pred)
    }

    #[test]
    fn idle_start_without_stream_acquires() {
        let (next, effects) = reduce(&State::default(), Event::Start, &ctx());
        assert!(matches!(next, State::AcquiringMedia { record: true, .. }));
        assert!(has(&effects, |e| matches!(e, Effect::AcquireMedia { .. })));
        assert!(has(&effects, |e| matches!(e, Effect::EmitSnapshot)));
    }

    #[test]
    fn idle_start_with_live_stream_records_immediately() {
        let (next, effects) = reduce(&State::default(), Event::Start, &ready());
        assert!(matches!(next, State::Recording { leg: 0, .. }));
        assert!(has(&effects, |e| matches!(e, Effect::StartEngine { leg: 0, .. })));
        assert!(has(&effects, |e| matches!(e, Effect::StartVisualizer)));
    }

    #[test]
    fn start_clears_prior_error() {
        let state = State::Idle {
            error: ErrorCode::PermissionDenied,
        };
        let (next, _) = reduce(&state, Event::Start, &ctx());
        assert_eq!(next.error(), ErrorCode::None);
    }

    #[test]
    fn start_is_refused_while_fatal_error_stands() {
        let fatal = Context {
            fatal: Some(ErrorCode::UnsupportedCapability),
            ..ready()
        };
        let (next, effects) = reduce(&State::default(), Event::Start, &fatal);
        assert_eq!(next.error(), ErrorCode::UnsupportedCapability);
        assert!(!has(&effects, |e| matches!(e, Effect::StartEngine { .. })));
    }

    #[test]
    fn start_while_recording_is_noop() {
        let state = State::Recording {
            take: Uuid::new_v4(),
            leg: 0,
        };
        let (next, effects) = reduce(&state, Event::Start, &ready());
        assert_eq!(next, state);
        assert!(effects.is_empty());
    }

    #[test]
    fn acquired_stream_starts_recording() {
        let take = Uuid::new_v4();
        let state = State::AcquiringMedia { take, record: true };
        let (next, effects) = reduce(
            &state,
            Event::MediaAcquired {
                take,
                stream: stream(),
            },
            &ctx(),
        );
        assert_eq!(next, State::Recording { take, leg: 0 });
        assert!(matches!(effects[0], Effect::AdoptStream(_)));
        assert!(matches!(effects[1], Effect::StartEngine { leg: 0, .. }));
    }

    #[test]
    fn primed_stream_returns_to_idle() {
        let (acquiring, _) = reduce(&State::default(), Event::Prime, &ctx());
        let State::AcquiringMedia { take, record } = acquiring.clone() else {
            panic!("expected acquiring, got {:?}", acquiring);
        };
        assert!(!record);

        let (next, effects) = reduce(
            &acquiring,
            Event::MediaAcquired {
                take,
                stream: stream(),
            },
            &ctx(),
        );
        assert_eq!(next.status(), Status::Idle);
        assert!(has(&effects, |e| matches!(e, Effect::AdoptStream(_))));
        assert!(!has(&effects, |e| matches!(e, Effect::StartEngine { .. })));
    }

    #[test]
    fn acquisition_failure_returns_to_idle_with_error() {
        let take = Uuid::new_v4();
        let state = State::AcquiringMedia { take, record: true };
        let (next, _) = reduce(
            &state,
            Event::MediaFailed {
                take,
                error: ErrorCode::PermissionDenied,
            },
            &ctx(),
        );
        assert_eq!(
            next,
            State::Idle {
                error: ErrorCode::PermissionDenied
            }
        );
    }

    #[test]
    fn stream_for_cancelled_take_is_released() {
        let take = Uuid::new_v4();
        let (idle, _) = reduce(
            &State::AcquiringMedia { take, record: true },
            Event::Stop,
            &ctx(),
        );
        assert_eq!(idle.status(), Status::Idle);

        let (next, effects) = reduce(
            &idle,
            Event::MediaAcquired {
                take,
                stream: stream(),
            },
            &ctx(),
        );
        assert_eq!(next, idle);
        assert!(matches!(effects.as_slice(), [Effect::ReleaseStream(_)]));
    }

    #[test]
    fn pause_assembles_without_clearing() {
        let take = Uuid::new_v4();
        let (next, effects) = reduce(&State::Recording { take, leg: 0 }, Event::Pause, &ctx());
        assert_eq!(next, State::Paused { take, leg: 0 });
        assert!(has(&effects, |e| matches!(e, Effect::PauseEngine { .. })));
        assert!(has(&effects, |e| matches!(e, Effect::Assemble)));
        assert!(has(&effects, |e| matches!(e, Effect::StopVisualizer)));
        assert!(!has(&effects, |e| matches!(
            e,
            Effect::ClearBuffer | Effect::DiscardBuffer
        )));
    }

    #[test]
    fn resume_starts_a_new_leg() {
        let take = Uuid::new_v4();
        let (next, effects) = reduce(&State::Paused { take, leg: 2 }, Event::Resume, &ctx());
        assert_eq!(next, State::Recording { take, leg: 3 });
        assert!(has(&effects, |e| matches!(e, Effect::StartEngine { leg: 3, .. })));
    }

    #[test]
    fn pause_and_resume_in_wrong_state_are_noops() {
        let (next, effects) = reduce(&State::default(), Event::Pause, &ctx());
        assert_eq!(next, State::default());
        assert!(effects.is_empty());

        let recording = State::Recording {
            take: Uuid::new_v4(),
            leg: 0,
        };
        let (next, effects) = reduce(&recording, Event::Resume, &ctx());
        assert_eq!(next, recording);
        assert!(effects.is_empty());
    }

    #[test]
    fn chunks_from_earlier_legs_are_kept() {
        let take = Uuid::new_v4();
        let (_, effects) = reduce(
            &State::Recording { take, leg: 1 },
            Event::DataAvailable {
                take,
                leg: 0,
                data: Bytes::from_static(b"tail"),
            },
            &ctx(),
        );
        assert!(has(&effects, |e| matches!(e, Effect::BufferChunk(_))));
    }

    #[test]
    fn chunk_while_paused_refreshes_interim_artifact() {
        let take = Uuid::new_v4();
        let (_, effects) = reduce(
            &State::Paused { take, leg: 0 },
            Event::DataAvailable {
                take,
                leg: 0,
                data: Bytes::from_static(b"tail"),
            },
            &ctx(),
        );
        assert!(matches!(effects[0], Effect::BufferChunk(_)));
        assert!(matches!(effects[1], Effect::RefreshArtifact));
    }

    #[test]
    fn stale_chunk_is_ignored() {
        let state = State::Recording {
            take: Uuid::new_v4(),
            leg: 0,
        };
        let (next, effects) = reduce(
            &state,
            Event::DataAvailable {
                take: Uuid::new_v4(),
                leg: 0,
                data: Bytes::from_static(b"x"),
            },
            &ctx(),
        );
        assert_eq!(next, state);
        assert!(effects.is_empty());
    }

    #[test]
    fn stop_waits_for_engine_before_assembling() {
        let take = Uuid::new_v4();
        let (stopping, effects) = reduce(&State::Recording { take, leg: 0 }, Event::Stop, &ctx());
        assert_eq!(stopping, State::Stopping { take, leg: 0 });
        assert!(has(&effects, |e| matches!(e, Effect::StopEngine { .. })));
        assert!(!has(&effects, |e| matches!(e, Effect::Assemble)));

        let (next, effects) = reduce(&stopping, Event::EngineStopped { take, leg: 0 }, &ctx());
        assert_eq!(next, State::Stopped);
        let kinds: Vec<&str> = effects
            .iter()
            .map(|e| match e {
                Effect::Assemble => "assemble",
                Effect::NotifyStop => "notify",
                Effect::ClearBuffer => "clear",
                Effect::StopTracks => "tracks",
                Effect::EmitSnapshot => "emit",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["assemble", "notify", "clear", "tracks", "emit"]);
    }

    #[test]
    fn stop_keeps_tracks_when_configured() {
        let take = Uuid::new_v4();
        let keep = Context {
            stop_tracks_on_stop: false,
            ..ctx()
        };
        let (_, effects) = reduce(
            &State::Stopping { take, leg: 0 },
            Event::EngineStopped { take, leg: 0 },
            &keep,
        );
        assert!(!has(&effects, |e| matches!(e, Effect::StopTracks)));
    }

    #[test]
    fn stop_from_paused_stops_the_paused_leg() {
        let take = Uuid::new_v4();
        let (next, effects) = reduce(&State::Paused { take, leg: 1 }, Event::Stop, &ctx());
        assert_eq!(next, State::Stopping { take, leg: 1 });
        assert!(has(&effects, |e| matches!(e, Effect::StopEngine { leg: 1, .. })));
    }

    #[test]
    fn stopped_session_can_start_again() {
        let (next, _) = reduce(&State::Stopped, Event::Start, &ctx());
        assert_eq!(next.status(), Status::AcquiringMedia);
    }

    #[test]
    fn engine_failure_discards_take() {
        let take = Uuid::new_v4();
        let (next, effects) = reduce(
            &State::Recording { take, leg: 0 },
            Event::EngineFailed {
                take,
                leg: 0,
                error: ErrorCode::NoRecorderAvailable,
            },
            &ctx(),
        );
        assert_eq!(
            next,
            State::Idle {
                error: ErrorCode::NoRecorderAvailable
            }
        );
        assert!(has(&effects, |e| matches!(e, Effect::DiscardBuffer)));
        assert!(has(&effects, |e| matches!(e, Effect::DisposeEngine { .. })));
        assert!(!has(&effects, |e| matches!(e, Effect::Assemble)));
    }

    #[test]
    fn started_notification_invokes_on_start() {
        let take = Uuid::new_v4();
        let state = State::Recording { take, leg: 1 };
        let (next, effects) = reduce(&state, Event::EngineStarted { take, leg: 1 }, &ctx());
        assert_eq!(next, state);
        assert!(matches!(effects.as_slice(), [Effect::NotifyStart]));
    }

    #[test]
    fn mute_is_allowed_in_any_state() {
        for state in [
            State::default(),
            State::Recording {
                take: Uuid::new_v4(),
                leg: 0,
            },
            State::Stopped,
        ] {
            let (next, effects) = reduce(&state, Event::MuteAudio, &ctx());
            assert_eq!(next, state);
            assert!(matches!(effects[0], Effect::SetAudioEnabled(false)));
        }
    }

    #[test]
    fn clear_artifact_abandons_take() {
        let take = Uuid::new_v4();
        let (next, effects) = reduce(&State::Paused { take, leg: 0 }, Event::ClearArtifact, &ctx());
        assert_eq!(next.status(), Status::Idle);
        assert!(matches!(effects[0], Effect::RevokeArtifact));
        assert!(has(&effects, |e| matches!(e, Effect::DisposeEngine { .. })));
        assert!(has(&effects, |e| matches!(e, Effect::DiscardBuffer)));
        assert!(!has(&effects, |e| matches!(e, Effect::StopTracks)));
    }

    #[test]
    fn clear_artifact_keeps_idle_error() {
        let state = State::Idle {
            error: ErrorCode::DeviceUnavailable,
        };
        let (next, _) = reduce(&state, Event::ClearArtifact, &ctx());
        assert_eq!(next, state);
    }

    #[test]
    fn screen_end_takes_stop_path() {
        let take = Uuid::new_v4();
        let (next, effects) = reduce(
            &State::Recording { take, leg: 0 },
            Event::TrackEnded {
                track: Uuid::new_v4(),
            },
            &ctx(),
        );
        assert_eq!(next, State::Stopping { take, leg: 0 });
        assert!(has(&effects, |e| matches!(e, Effect::StopEngine { .. })));
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&Status::AcquiringMedia).unwrap();
        assert_eq!(json, "\"acquiring_media\"");
    }
}

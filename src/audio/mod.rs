//! Audio capture module for session-recorder
//!
//! Live streams and their tracks, platform acquisition (CPAL microphones),
//! the recording engine that turns samples into encoded chunks, and the
//! analyser the visualizer reads from.

pub mod acquire;
pub mod capture;
pub mod encoder;
pub mod engine;
pub mod stream;
mod waveform;

pub use acquire::{acquire, MediaDevices, MediaRequest, TrackConstraints, TrackRequest};
pub use capture::CpalDevices;
pub use encoder::{ensure_registered, Encoder, EncoderRegistry};
pub use engine::{EngineLeg, LegCommand, LegOptions};
pub use stream::{
    EndedObserver, LiveStream, MediaTrack, SignalFeed, SignalFormat, StreamSource, TrackKind,
};
pub use waveform::{
    Analyser, WaveformBuffer, DEFAULT_FFT_SIZE, DEFAULT_MAX_DECIBELS, DEFAULT_MIN_DECIBELS,
    DEFAULT_SMOOTHING,
};

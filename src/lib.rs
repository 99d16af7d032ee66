//! Pausable live capture sessions.
//!
//! A `Session` acquires a live stream, records it through successive engine
//! legs into an ordered chunk buffer, and assembles the buffer into an
//! addressable artifact on pause and stop. A visualizer can draw the live
//! signal while recording.

pub mod artifact;
pub mod audio;
pub mod buffer;
pub mod effects;
pub mod error;
pub mod session;
pub mod settings;
pub mod state_machine;
pub mod visualizer;

pub use artifact::{Artifact, ArtifactRef, ArtifactStore};
pub use effects::{Capabilities, DeviceEffectRunner, EffectRunner, Job, StubAcquire, StubEffectRunner};
pub use error::{CaptureError, ErrorCode, SessionError};
pub use session::{Session, SessionBuilder, SessionSnapshot};
pub use settings::{SessionConfig, VisualizerMode, VisualizerSettings};
pub use state_machine::{Event, Status};
pub use visualizer::{RenderError, RenderTarget, SharedTarget, VisualizerFrame};

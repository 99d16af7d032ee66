//! Signal source acquisition
//!
//! Turns a `MediaRequest` into a `LiveStream` through a platform
//! `MediaDevices` backend. Screen capture is combined with a separate
//! microphone acquisition when audio is also requested.

use serde::{Deserialize, Serialize};

use super::stream::{EndedObserver, LiveStream, StreamSource};
use crate::error::CaptureError;

/// Optional hints for a requested track. Backends honour what they can.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TrackConstraints {
    pub sample_rate: Option<u32>,
    pub channel_count: Option<u16>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<f32>,
}

/// Either a plain on/off switch or a set of constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TrackRequest {
    Enabled(bool),
    Constrained(TrackConstraints),
}

impl TrackRequest {
    pub fn is_requested(&self) -> bool {
        !matches!(self, TrackRequest::Enabled(false))
    }

    /// Constraints for a requested track (empty when just `true`).
    pub fn constraints(&self) -> Option<TrackConstraints> {
        match self {
            TrackRequest::Enabled(false) => None,
            TrackRequest::Enabled(true) => Some(TrackConstraints::default()),
            TrackRequest::Constrained(c) => Some(c.clone()),
        }
    }
}

impl From<bool> for TrackRequest {
    fn from(enabled: bool) -> Self {
        TrackRequest::Enabled(enabled)
    }
}

/// What the session asks the platform for.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaRequest {
    pub audio: TrackRequest,
    pub video: TrackRequest,
    pub screen: bool,
}

impl Default for MediaRequest {
    fn default() -> Self {
        Self {
            audio: TrackRequest::Enabled(true),
            video: TrackRequest::Enabled(false),
            screen: false,
        }
    }
}

/// Platform capture backend.
///
/// Calls may block (permission prompts, device handshakes); the session
/// always invokes them off the async executor.
pub trait MediaDevices: Send + Sync + 'static {
    /// Microphone and/or camera capture.
    fn user_media(
        &self,
        audio: Option<&TrackConstraints>,
        video: Option<&TrackConstraints>,
    ) -> Result<LiveStream, CaptureError>;

    /// Screen capture. The returned stream carries video tracks.
    fn display_media(&self, video: &TrackConstraints) -> Result<LiveStream, CaptureError>;

    fn supports_display_capture(&self) -> bool;

    /// Whether streams from this backend can be recorded at all.
    fn supports_recording(&self) -> bool {
        true
    }
}

/// Acquire a live stream for `request`.
///
/// In screen mode `on_screen_ended` is registered on every screen video
/// track, and the microphone's audio tracks are merged into the screen
/// stream when audio is requested.
pub fn acquire(
    devices: &dyn MediaDevices,
    request: &MediaRequest,
    on_screen_ended: Option<EndedObserver>,
) -> Result<LiveStream, CaptureError> {
    let audio = request.audio.constraints();

    if request.screen {
        if !devices.supports_display_capture() {
            return Err(CaptureError::UnsupportedCapability(
                "screen capture is not supported by this backend".to_string(),
            ));
        }

        let video = request.video.constraints().unwrap_or_default();
        let mut screen = devices.display_media(&video)?;
        if let Some(observer) = on_screen_ended {
            for track in screen.video_tracks() {
                track.on_ended(observer.clone());
            }
        }

        if let Some(audio) = audio {
            match devices.user_media(Some(&audio), None) {
                Ok(microphone) => screen.merge_audio_from(microphone),
                Err(e) => {
                    log::warn!("Microphone acquisition failed, releasing screen: {}", e);
                    screen.stop_all();
                    return Err(e);
                }
            }
        }

        log::info!(
            "Acquired screen stream {} ({} tracks)",
            screen.id(),
            screen.tracks().len()
        );
        return Ok(screen);
    }

    let video = request.video.constraints();
    if audio.is_none() && video.is_none() {
        return Err(CaptureError::UnsupportedCapability(
            "neither audio nor video was requested".to_string(),
        ));
    }

    let stream = devices.user_media(audio.as_ref(), video.as_ref())?;
    log::info!(
        "Acquired {:?} stream {} ({} tracks)",
        stream.source(),
        stream.id(),
        stream.tracks().len()
    );
    Ok(stream)
}

/// Source kind a plain `user_media` call produces.
pub fn user_media_source(video: Option<&TrackConstraints>) -> StreamSource {
    if video.is_some() {
        StreamSource::Camera
    } else {
        StreamSource::Microphone
    }
}

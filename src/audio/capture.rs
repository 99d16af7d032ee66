//! Microphone capture through CPAL
//!
//! Each acquired input runs on a dedicated capture thread: cpal streams are
//! not `Send`, so the thread owns the stream and parks until the track is
//! stopped. Samples are converted to i16 and published on the track.

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Weak};
use std::thread;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    BuildStreamError, DefaultStreamConfigError, Device, SampleFormat, Stream, StreamConfig,
    StreamError,
};

use super::acquire::{MediaDevices, TrackConstraints};
use super::stream::{LiveStream, MediaTrack, SignalFeed, SignalFormat, StreamSource};
use crate::error::CaptureError;

/// `MediaDevices` backed by the default CPAL host. Microphones only.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalDevices;

impl CpalDevices {
    pub fn new() -> Self {
        Self
    }
}

impl MediaDevices for CpalDevices {
    fn user_media(
        &self,
        audio: Option<&TrackConstraints>,
        video: Option<&TrackConstraints>,
    ) -> Result<LiveStream, CaptureError> {
        if video.is_some() {
            return Err(CaptureError::UnsupportedCapability(
                "camera capture is not available on this host".to_string(),
            ));
        }
        let constraints = audio.cloned().ok_or_else(|| {
            CaptureError::UnsupportedCapability("no audio track requested".to_string())
        })?;

        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);
        thread::Builder::new()
            .name("session-recorder-capture".to_string())
            .spawn(move || capture_thread(constraints, ready_tx))
            .map_err(|e| CaptureError::DeviceUnavailable(format!("capture thread: {}", e)))?;

        ready_rx.recv().map_err(|_| {
            CaptureError::DeviceUnavailable("capture thread exited during setup".to_string())
        })?
    }

    fn display_media(&self, _video: &TrackConstraints) -> Result<LiveStream, CaptureError> {
        Err(CaptureError::UnsupportedCapability(
            "screen capture is not available on this host".to_string(),
        ))
    }

    fn supports_display_capture(&self) -> bool {
        false
    }
}

/// Owns the cpal stream for the lifetime of one audio track.
fn capture_thread(
    constraints: TrackConstraints,
    ready: std_mpsc::SyncSender<Result<LiveStream, CaptureError>>,
) {
    let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

    let stream = match open_input(&constraints, stop_tx) {
        Ok((stream, live)) => {
            if ready.send(Ok(live)).is_err() {
                return;
            }
            stream
        }
        Err(e) => {
            log::error!("Failed to open audio input: {}", e);
            let _ = ready.send(Err(e));
            return;
        }
    };

    // Returns when the track is stopped or dropped
    let _ = stop_rx.recv();
    drop(stream);
    log::info!("Audio input released");
}

fn open_input(
    constraints: &TrackConstraints,
    stop_tx: std_mpsc::Sender<()>,
) -> Result<(Stream, LiveStream), CaptureError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or_else(|| {
        CaptureError::DeviceUnavailable("no audio input device found".to_string())
    })?;
    let label = device
        .name()
        .unwrap_or_else(|_| "default input".to_string());
    log::info!("Using audio input device: {}", label);

    let (config, sample_format) = pick_config(&device, constraints)?;
    log::info!(
        "Audio config: {} Hz, {} channels, {:?}",
        config.sample_rate.0,
        config.channels,
        sample_format
    );

    let feed = SignalFeed::new(SignalFormat {
        sample_rate: config.sample_rate.0,
        channels: config.channels,
    });
    let track = MediaTrack::audio(label, feed.clone(), move || {
        let _ = stop_tx.send(());
    });

    let stream = match sample_format {
        SampleFormat::I16 => build_stream::<i16>(&device, &config, Arc::downgrade(&track)),
        SampleFormat::U16 => build_stream::<u16>(&device, &config, Arc::downgrade(&track)),
        SampleFormat::F32 => build_stream::<f32>(&device, &config, Arc::downgrade(&track)),
        other => Err(CaptureError::UnsupportedCapability(format!(
            "sample format {:?}",
            other
        ))),
    }?;

    stream.play().map_err(|e| match e {
        cpal::PlayStreamError::DeviceNotAvailable => {
            CaptureError::DeviceUnavailable("device disappeared before capture".to_string())
        }
        other => classify_backend_error(other.to_string()),
    })?;

    let live = LiveStream::new(StreamSource::Microphone, feed).with_track(track);
    Ok((stream, live))
}

/// The default input config, or a supported one matching the constraints.
fn pick_config(
    device: &Device,
    constraints: &TrackConstraints,
) -> Result<(StreamConfig, SampleFormat), CaptureError> {
    let default = device.default_input_config().map_err(map_config_error)?;

    if constraints.sample_rate.is_none() && constraints.channel_count.is_none() {
        let format = default.sample_format();
        return Ok((default.into(), format));
    }

    let wanted_rate = constraints.sample_rate.unwrap_or(default.sample_rate().0);
    let wanted_channels = constraints.channel_count.unwrap_or(default.channels());

    let matching = device.supported_input_configs().ok().and_then(|mut ranges| {
        ranges.find(|range| {
            range.channels() == wanted_channels
                && range.min_sample_rate().0 <= wanted_rate
                && range.max_sample_rate().0 >= wanted_rate
        })
    });

    match matching {
        Some(range) => {
            let supported = range.with_sample_rate(cpal::SampleRate(wanted_rate));
            let format = supported.sample_format();
            Ok((supported.into(), format))
        }
        None => {
            log::warn!(
                "No input config for {} Hz / {} channels, using device default",
                wanted_rate,
                wanted_channels
            );
            let format = default.sample_format();
            Ok((default.into(), format))
        }
    }
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    track: Weak<MediaTrack>,
) -> Result<Stream, CaptureError>
where
    T: cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let error_track = track.clone();
    let err_fn = move |err: StreamError| {
        log::error!("Audio stream error: {}", err);
        if matches!(err, StreamError::DeviceNotAvailable) {
            if let Some(track) = error_track.upgrade() {
                track.end();
            }
        }
    };

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let Some(track) = track.upgrade() else {
                    return;
                };
                let samples: Vec<i16> = data.iter().map(|&s| sample_to_i16(s)).collect();
                track.publish(&samples);
            },
            err_fn,
            None,
        )
        .map_err(map_build_error)
}

fn map_config_error(err: DefaultStreamConfigError) -> CaptureError {
    match err {
        DefaultStreamConfigError::DeviceNotAvailable => {
            CaptureError::DeviceUnavailable("input device not available".to_string())
        }
        DefaultStreamConfigError::StreamTypeNotSupported => {
            CaptureError::UnsupportedCapability("input stream type not supported".to_string())
        }
        other => classify_backend_error(other.to_string()),
    }
}

fn map_build_error(err: BuildStreamError) -> CaptureError {
    match err {
        BuildStreamError::DeviceNotAvailable => {
            CaptureError::DeviceUnavailable("input device not available".to_string())
        }
        BuildStreamError::StreamConfigNotSupported => {
            CaptureError::UnsupportedCapability("input stream config not supported".to_string())
        }
        other => classify_backend_error(other.to_string()),
    }
}

/// Backends report permission problems only as text.
fn classify_backend_error(message: String) -> CaptureError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
    {
        CaptureError::PermissionDenied(message)
    } else {
        CaptureError::DeviceUnavailable(message)
    }
}

/// Convert any sample type to i16.
fn sample_to_i16<T>(sample: T) -> i16
where
    T: cpal::Sample,
    f32: cpal::FromSample<T>,
{
    let f32_sample: f32 = sample.to_sample::<f32>();
    let clamped = f32_sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_to_i16() {
        assert_eq!(sample_to_i16(0.0f32), 0);
        assert_eq!(sample_to_i16(1.0f32), i16::MAX);
        assert_eq!(sample_to_i16(-1.0f32), -i16::MAX);

        // Clamping
        assert_eq!(sample_to_i16(2.0f32), i16::MAX);
        assert_eq!(sample_to_i16(-2.0f32), -i16::MAX);
    }

    #[test]
    fn backend_permission_text_maps_to_permission_denied() {
        let err = classify_backend_error("Access denied by the system".to_string());
        assert!(matches!(err, CaptureError::PermissionDenied(_)));
        let err = classify_backend_error("ALSA function 'snd_pcm_open' failed".to_string());
        assert!(matches!(err, CaptureError::DeviceUnavailable(_)));
    }

    #[test]
    fn build_errors_map_to_codes() {
        assert!(matches!(
            map_build_error(BuildStreamError::DeviceNotAvailable),
            CaptureError::DeviceUnavailable(_)
        ));
        assert!(matches!(
            map_build_error(BuildStreamError::StreamConfigNotSupported),
            CaptureError::UnsupportedCapability(_)
        ));
    }

    #[test]
    fn video_and_screen_are_unsupported() {
        let devices = CpalDevices::new();
        let err = devices
            .user_media(None, Some(&TrackConstraints::default()))
            .unwrap_err();
        assert!(matches!(err, CaptureError::UnsupportedCapability(_)));
        assert!(!devices.supports_display_capture());
        assert!(devices.display_media(&TrackConstraints::default()).is_err());
    }
}

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::{MediaRequest, TrackRequest};

const SETTINGS_DIR_NAME: &str = "session-recorder";
const SETTINGS_FILE_NAME: &str = "settings.json";

/// Session configuration. Every field has a default so partial files load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Capture audio: `true`/`false` or a constraints object.
    pub audio: TrackRequest,

    /// Capture video. Also switches the default artifact type to video.
    pub video: TrackRequest,

    /// Capture the screen instead of a camera; requested audio comes from a
    /// separate microphone stream merged into the screen stream.
    pub screen: bool,

    /// Media type stamped on assembled artifacts instead of the default.
    pub artifact_type_override: Option<String>,

    /// Encoder used by the recording engine (default `audio/wav`).
    pub recorder_mime_type: Option<String>,

    /// How often the engine flushes encoded data into the chunk buffer.
    pub flush_interval_ms: u64,

    /// Stop every track of the live stream once a stop completes.
    pub stop_tracks_on_stop: bool,

    /// Acquire the live stream as soon as the session is constructed.
    pub acquire_on_construct: bool,

    pub visualizer: VisualizerSettings,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            audio: TrackRequest::Enabled(true),
            video: TrackRequest::Enabled(false),
            screen: false,
            artifact_type_override: None,
            recorder_mime_type: None,
            flush_interval_ms: 1000,
            stop_tracks_on_stop: true,
            acquire_on_construct: false,
            visualizer: VisualizerSettings::default(),
        }
    }
}

impl SessionConfig {
    pub fn media_request(&self) -> MediaRequest {
        MediaRequest {
            audio: self.audio.clone(),
            video: self.video.clone(),
            screen: self.screen,
        }
    }

    pub fn video_requested(&self) -> bool {
        self.video.is_requested()
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    pub fn recorder_mime_type(&self) -> &str {
        self.recorder_mime_type
            .as_deref()
            .unwrap_or(crate::audio::encoder::WAV_MIME_TYPE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisualizerMode {
    /// Frequency bars scrolling right to left.
    Bars,
    /// Time-domain line across the canvas.
    Line,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualizerSettings {
    pub mode: VisualizerMode,
    /// Delay between frames (16ms is roughly display refresh).
    pub frame_interval_ms: u64,
    pub fft_size: usize,
    pub smoothing: f32,
    pub bar_width: u32,
    pub bar_spacing: u32,
    pub scroll_speed: u32,
}

impl Default for VisualizerSettings {
    fn default() -> Self {
        Self {
            mode: VisualizerMode::Bars,
            frame_interval_ms: 16,
            fft_size: 1024,
            smoothing: 0.85,
            bar_width: 30,
            bar_spacing: 100,
            scroll_speed: 1,
        }
    }
}

impl VisualizerSettings {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms.max(1))
    }
}

/// Errors from reading or writing the settings file.
#[derive(Debug)]
pub enum SettingsError {
    NoConfigDir,
    Io { path: PathBuf, message: String },
    Parse { path: PathBuf, message: String },
    Serialize(String),
}

impl std::fmt::Display for SettingsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettingsError::NoConfigDir => write!(f, "Could not determine config directory"),
            SettingsError::Io { path, message } => write!(f, "{:?}: {}", path, message),
            SettingsError::Parse { path, message } => {
                write!(f, "Failed to parse {:?}: {}", path, message)
            }
            SettingsError::Serialize(e) => write!(f, "Serialize settings: {}", e),
        }
    }
}

impl std::error::Error for SettingsError {}

/// `<config dir>/session-recorder/settings.json`
pub fn default_settings_path() -> Result<PathBuf, SettingsError> {
    let dir = dirs::config_dir().ok_or(SettingsError::NoConfigDir)?;
    Ok(dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
}

/// Read settings from `path`, failing on a missing or malformed file.
pub fn try_load_settings(path: &Path) -> Result<SessionConfig, SettingsError> {
    let contents = std::fs::read_to_string(path).map_err(|e| SettingsError::Io {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    serde_json::from_str(&contents).map_err(|e| SettingsError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Read settings from `path`, falling back to defaults on any problem.
pub fn load_settings(path: &Path) -> SessionConfig {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<SessionConfig>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                SessionConfig::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => SessionConfig::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            SessionConfig::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &SessionConfig) -> Result<(), SettingsError> {
    let io_err = |path: &Path, e: std::io::Error| SettingsError::Io {
        path: path.to_path_buf(),
        message: e.to_string(),
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }

    let contents = serde_json::to_string_pretty(settings)
        .map_err(|e| SettingsError::Serialize(e.to_string()))?;

    // Write to a temp file in the same directory, then rename over the target.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents).map_err(|e| io_err(&tmp_path, e))?;

    // Windows rename fails if the destination exists
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(io_err(path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path).map_err(|e| io_err(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::TrackConstraints;

    #[test]
    fn partial_file_uses_defaults() {
        let config: SessionConfig = serde_json::from_str(r#"{"video": true}"#).unwrap();
        assert!(config.video_requested());
        assert!(config.audio.is_requested());
        assert_eq!(config.flush_interval_ms, 1000);
        assert!(config.stop_tracks_on_stop);
        assert_eq!(config.visualizer.fft_size, 1024);
    }

    #[test]
    fn audio_accepts_constraints() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"audio": {"sampleRate": 44100, "channelCount": 2}}"#).unwrap();
        assert_eq!(
            config.media_request().audio.constraints(),
            Some(TrackConstraints {
                sample_rate: Some(44_100),
                channel_count: Some(2),
                ..TrackConstraints::default()
            })
        );
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE_NAME);
        let config = SessionConfig {
            screen: true,
            artifact_type_override: Some("audio/x-custom".to_string()),
            flush_interval_ms: 250,
            ..SessionConfig::default()
        };

        save_settings(&path, &config).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(load_settings(&path), config);
        assert_eq!(try_load_settings(&path).unwrap(), config);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        assert_eq!(load_settings(&path), SessionConfig::default());
        assert!(matches!(
            try_load_settings(&path),
            Err(SettingsError::Io { .. })
        ));
    }

    #[test]
    fn malformed_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_settings(&path), SessionConfig::default());
        assert!(matches!(
            try_load_settings(&path),
            Err(SettingsError::Parse { .. })
        ));
    }
}

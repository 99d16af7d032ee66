//! Pluggable chunk encoders
//!
//! The recording engine turns PCM16 packets into encoded bytes through an
//! `Encoder` looked up by MIME type. Encoders are registered once per process
//! in a lazily initialised registry; the session triggers that registration
//! at construction so a failure surfaces as `EncoderInitializationFailed`
//! before the first recording.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use bytes::BytesMut;
use hound::{WavSpec, WavWriter};
use once_cell::sync::OnceCell;

use super::stream::SignalFormat;
use crate::error::CaptureError;

pub const WAV_MIME_TYPE: &str = "audio/wav";
pub const PCM_MIME_TYPE: &str = "audio/l16";

/// Encodes interleaved PCM16 into a container/codec byte stream.
pub trait Encoder: Send + Sync {
    fn mime_type(&self) -> &str;

    /// Bytes opening a take. Only the first engine leg of a take writes them.
    fn header(&self, format: SignalFormat) -> Result<Vec<u8>, CaptureError>;

    fn encode(&self, samples: &[i16], out: &mut BytesMut);
}

/// Streaming WAV: a RIFF header with open-ended sizes, then PCM16LE frames.
pub struct WavEncoder;

impl Encoder for WavEncoder {
    fn mime_type(&self) -> &str {
        WAV_MIME_TYPE
    }

    fn header(&self, format: SignalFormat) -> Result<Vec<u8>, CaptureError> {
        let spec = WavSpec {
            channels: format.channels,
            sample_rate: format.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut cursor = Cursor::new(Vec::new());
        WavWriter::new(&mut cursor, spec)
            .and_then(|writer| writer.finalize())
            .map_err(|e| CaptureError::EncoderInitializationFailed(e.to_string()))?;
        let mut header = cursor.into_inner();

        // The total length is unknown while streaming: mark the RIFF and
        // data sizes as open-ended. An empty data chunk is the header's tail.
        let len = header.len();
        if len < 12 {
            return Err(CaptureError::EncoderInitializationFailed(format!(
                "WAV header too short ({} bytes)",
                len
            )));
        }
        header[4..8].copy_from_slice(&u32::MAX.to_le_bytes());
        header[len - 4..].copy_from_slice(&u32::MAX.to_le_bytes());
        Ok(header)
    }

    fn encode(&self, samples: &[i16], out: &mut BytesMut) {
        encode_pcm16le(samples, out);
    }
}

/// Raw PCM16LE without any framing.
pub struct PcmEncoder;

impl Encoder for PcmEncoder {
    fn mime_type(&self) -> &str {
        PCM_MIME_TYPE
    }

    fn header(&self, _format: SignalFormat) -> Result<Vec<u8>, CaptureError> {
        Ok(Vec::new())
    }

    fn encode(&self, samples: &[i16], out: &mut BytesMut) {
        encode_pcm16le(samples, out);
    }
}

fn encode_pcm16le(samples: &[i16], out: &mut BytesMut) {
    out.reserve(samples.len() * 2);
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
}

/// Process-wide table of encoders keyed by normalized MIME type.
pub struct EncoderRegistry {
    encoders: HashMap<String, Arc<dyn Encoder>>,
}

static REGISTRY: OnceCell<EncoderRegistry> = OnceCell::new();

impl EncoderRegistry {
    fn with_defaults() -> Result<Self, CaptureError> {
        let mut registry = Self {
            encoders: HashMap::new(),
        };
        let wav: Arc<dyn Encoder> = Arc::new(WavEncoder);
        let pcm: Arc<dyn Encoder> = Arc::new(PcmEncoder);
        registry.register(WAV_MIME_TYPE, wav.clone())?;
        registry.register("audio/wave", wav.clone())?;
        registry.register("audio/x-wav", wav)?;
        registry.register(PCM_MIME_TYPE, pcm.clone())?;
        registry.register("audio/pcm", pcm)?;

        // Probe every encoder once so a broken one fails registration
        // instead of the first recording.
        for encoder in registry.encoders.values() {
            encoder.header(SignalFormat::default())?;
        }
        Ok(registry)
    }

    fn register(&mut self, mime_type: &str, encoder: Arc<dyn Encoder>) -> Result<(), CaptureError> {
        let key = normalize_mime_type(mime_type);
        if key.is_empty() || !key.contains('/') {
            return Err(CaptureError::EncoderInitializationFailed(format!(
                "invalid MIME type {:?}",
                mime_type
            )));
        }
        if self.encoders.insert(key, encoder).is_some() {
            return Err(CaptureError::EncoderInitializationFailed(format!(
                "duplicate encoder for {:?}",
                mime_type
            )));
        }
        Ok(())
    }

    pub fn lookup(&self, mime_type: &str) -> Option<Arc<dyn Encoder>> {
        self.encoders.get(&normalize_mime_type(mime_type)).cloned()
    }

    pub fn mime_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.encoders.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

/// Register the built-in encoders. Runs at most once per process; later
/// calls return the same registry (or the same failure).
pub fn ensure_registered() -> Result<&'static EncoderRegistry, CaptureError> {
    REGISTRY.get_or_try_init(|| {
        log::debug!("Registering chunk encoders");
        EncoderRegistry::with_defaults()
    })
}

/// `audio/WAV; codecs=1` -> `audio/wav`
fn normalize_mime_type(mime_type: &str) -> String {
    mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

//! Artifact assembly and references
//!
//! `assemble` concatenates buffered fragments in order into one payload.
//! The `ArtifactStore` hands out opaque references to assembled artifacts,
//! resolvable until revoked.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

pub const DEFAULT_AUDIO_TYPE: &str = "audio/wav";
pub const DEFAULT_VIDEO_TYPE: &str = "video/mp4";

const REF_PREFIX: &str = "blob:session-recorder/";

/// An assembled recording.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    #[serde(skip)]
    pub data: Bytes,
    pub media_type: String,
    pub fragments: usize,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Concatenate `fragments` in order. Zero fragments give an empty artifact.
pub fn assemble(fragments: &[Bytes], media_type: &str) -> Artifact {
    let total: usize = fragments.iter().map(Bytes::len).sum();
    let data = match fragments {
        [] => Bytes::new(),
        [single] => single.clone(),
        _ => {
            let mut out = BytesMut::with_capacity(total);
            for fragment in fragments {
                out.extend_from_slice(fragment);
            }
            out.freeze()
        }
    };

    Artifact {
        data,
        media_type: media_type.to_string(),
        fragments: fragments.len(),
        created_at: Utc::now(),
    }
}

/// The explicit override, else the default for the requested capture.
pub fn resolve_media_type(override_type: Option<&str>, video_requested: bool) -> String {
    match override_type.map(str::trim).filter(|t| !t.is_empty()) {
        Some(t) => t.to_string(),
        None if video_requested => DEFAULT_VIDEO_TYPE.to_string(),
        None => DEFAULT_AUDIO_TYPE.to_string(),
    }
}

/// Opaque, addressable handle on an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    fn new() -> Self {
        Self(format!("{}{}", REF_PREFIX, Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registry of live artifact references. Cloning shares the registry.
#[derive(Debug, Clone, Default)]
pub struct ArtifactStore {
    entries: Arc<Mutex<HashMap<ArtifactRef, Artifact>>>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_ref(&self, artifact: Artifact) -> ArtifactRef {
        let reference = ArtifactRef::new();
        log::debug!(
            "Artifact {} created: {} bytes of {} from {} fragments",
            reference,
            artifact.len(),
            artifact.media_type,
            artifact.fragments
        );
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(reference.clone(), artifact);
        reference
    }

    pub fn resolve(&self, reference: &ArtifactRef) -> Option<Artifact> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(reference)
            .cloned()
    }

    /// Point a live reference at a new artifact. Returns false if the
    /// reference was already released.
    pub fn replace(&self, reference: &ArtifactRef, artifact: Artifact) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get_mut(reference) {
            Some(slot) => {
                log::debug!("Artifact {} now holds {} bytes", reference, artifact.len());
                *slot = artifact;
                true
            }
            None => false,
        }
    }

    /// Release a reference. Returns false if it was already released.
    pub fn revoke(&self, reference: &ArtifactRef) -> bool {
        let removed = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(reference)
            .is_some();
        if removed {
            log::debug!("Artifact {} revoked", reference);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

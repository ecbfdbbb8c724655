//! Core identity and envelope types shared across the pipeline.
//!
//! Every streamed entity is identified by a [`StreamKey`] and versioned by an
//! opaque [`ContentHash`] supplied by the backend's manifests. Payloads never
//! travel bare: they are wrapped in a [`SyncedData`] envelope tagging them
//! with their originating key and hash.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The kind of model a stream entity refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ModelKind {
    Instance,
    Object,
    Mesh,
    Material,
    Texture,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModelKind::Instance => "instance",
            ModelKind::Object => "object",
            ModelKind::Mesh => "mesh",
            ModelKind::Material => "material",
            ModelKind::Texture => "texture",
        };
        f.write_str(name)
    }
}

/// Stable identity of a streamed entity within a source.
///
/// Identity is (source, kind, id); the content behind a key is versioned
/// separately by [`ContentHash`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamKey {
    pub source: String,
    pub kind: ModelKind,
    pub id: String,
}

impl StreamKey {
    pub fn new(source: impl Into<String>, kind: ModelKind, id: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            kind,
            id: id.into(),
        }
    }

    /// Key for a different kind within the same source.
    pub fn sibling(&self, kind: ModelKind, id: impl Into<String>) -> Self {
        Self::new(self.source.clone(), kind, id)
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.source, self.kind, self.id)
    }
}

/// Opaque content hash supplied by manifests.
///
/// The pipeline only ever compares hashes for equality; it never computes
/// them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContentHash {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Per-entity stream events. `Begin`/`End` framing is carried separately by
/// the runtime, not as an event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamEvent {
    Added,
    Changed,
    Removed,
}

impl fmt::Display for StreamEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamEvent::Added => "added",
            StreamEvent::Changed => "changed",
            StreamEvent::Removed => "removed",
        };
        f.write_str(name)
    }
}

/// Envelope wrapping a payload with its originating key and hash.
#[derive(Debug, Clone)]
pub struct SyncedData<T> {
    pub key: StreamKey,
    pub hash: ContentHash,
    pub data: T,
}

impl<T> SyncedData<T> {
    pub fn new(key: StreamKey, hash: ContentHash, data: T) -> Self {
        Self { key, hash, data }
    }

    /// Keep the envelope, replace the payload.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> SyncedData<U> {
        SyncedData {
            key: self.key,
            hash: self.hash,
            data: f(self.data),
        }
    }
}

/// TRS transform. Rotation is a quaternion (x, y, z, w).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: [f32; 3],
    pub rotation: [f32; 4],
    pub scale: [f32; 3],
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: [0.0; 3],
            rotation: [0.0, 0.0, 0.0, 1.0],
            scale: [1.0; 3],
        }
    }
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl Aabb {
    pub fn new(min: [f32; 3], max: [f32; 3]) -> Self {
        Self { min, max }
    }

    /// Grow to include a point.
    pub fn encapsulate(&mut self, p: [f32; 3]) {
        for i in 0..3 {
            self.min[i] = self.min[i].min(p[i]);
            self.max[i] = self.max[i].max(p[i]);
        }
    }
}

/// Free-form string metadata attached to objects and instances.
///
/// Ordered map so serialized graphs and assertions are deterministic.
pub type Metadata = BTreeMap<String, String>;

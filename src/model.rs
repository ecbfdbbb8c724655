//! Source-side model representations and manifests.
//!
//! These are the shapes a [`SyncModelProvider`](crate::provider::SyncModelProvider)
//! hands back: raw geometry, textures, materials, object trees and instances,
//! plus the per-source manifests that drive diffing.

use crate::types::{Aabb, ContentHash, Metadata, ModelKind, StreamKey, Transform};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raw triangle mesh as delivered by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshData {
    pub name: String,
    pub positions: Vec<[f32; 3]>,
    pub indices: Vec<u32>,
    #[serde(default)]
    pub normals: Vec<[f32; 3]>,
    #[serde(default)]
    pub uvs: Vec<[f32; 2]>,
}

/// Raw RGBA8 texture as delivered by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextureData {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// Material definition referencing textures by id within the same source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialData {
    pub name: String,
    pub tint: [f32; 4],
    #[serde(default)]
    pub albedo_map: Option<String>,
    #[serde(default)]
    pub normal_map: Option<String>,
    #[serde(default)]
    pub emission_map: Option<String>,
}

impl Default for MaterialData {
    fn default() -> Self {
        Self {
            name: String::new(),
            tint: [1.0; 4],
            albedo_map: None,
            normal_map: None,
            emission_map: None,
        }
    }
}

/// A node in an object tree: optional mesh, materials, children.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectData {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub mesh_id: Option<String>,
    #[serde(default)]
    pub material_ids: Vec<String>,
    #[serde(default)]
    pub transform: Transform,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub children: Vec<ObjectData>,
}

/// A placement of an object in the scene.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectInstance {
    pub id: String,
    pub name: String,
    pub object_id: String,
    #[serde(default)]
    pub transform: Transform,
    #[serde(default)]
    pub metadata: Metadata,
}

/// A fetched model, one variant per [`ModelKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncModel {
    Instance(ObjectInstance),
    Object(ObjectData),
    Mesh(MeshData),
    Material(MaterialData),
    Texture(TextureData),
}

impl SyncModel {
    pub fn kind(&self) -> ModelKind {
        match self {
            SyncModel::Instance(_) => ModelKind::Instance,
            SyncModel::Object(_) => ModelKind::Object,
            SyncModel::Mesh(_) => ModelKind::Mesh,
            SyncModel::Material(_) => ModelKind::Material,
            SyncModel::Texture(_) => ModelKind::Texture,
        }
    }

    /// The entity id carried inside the model.
    pub fn id(&self) -> &str {
        match self {
            SyncModel::Instance(m) => &m.id,
            SyncModel::Object(m) => &m.id,
            SyncModel::Mesh(m) => &m.name,
            SyncModel::Material(m) => &m.name,
            SyncModel::Texture(m) => &m.name,
        }
    }
}

/// One manifest row: what exists and at which content version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub key: StreamKey,
    pub hash: ContentHash,
    #[serde(default)]
    pub bounds: Option<Aabb>,
}

/// Snapshot of one source's content at fetch time.
///
/// Entry order is the backend's; diffing emits per-entity events in this
/// order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncManifest {
    pub source: String,
    pub fetched_at: DateTime<Utc>,
    pub entries: Vec<ManifestEntry>,
}

impl SyncManifest {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            fetched_at: Utc::now(),
            entries: Vec::new(),
        }
    }

    /// Append or update an entry, keeping first-seen order for updates.
    pub fn append(&mut self, kind: ModelKind, id: impl Into<String>, hash: impl Into<ContentHash>) {
        let key = StreamKey::new(self.source.clone(), kind, id);
        let hash = hash.into();
        if let Some(entry) = self.entries.iter_mut().find(|e| e.key == key) {
            entry.hash = hash;
        } else {
            self.entries.push(ManifestEntry {
                key,
                hash,
                bounds: None,
            });
        }
    }

    /// Drop an entry if present.
    pub fn remove(&mut self, kind: ModelKind, id: &str) {
        self.entries
            .retain(|e| !(e.key.kind == kind && e.key.id == id));
    }

    pub fn hash_of(&self, kind: ModelKind, id: &str) -> Option<&ContentHash> {
        self.entries
            .iter()
            .find(|e| e.key.kind == kind && e.key.id == id)
            .map(|e| &e.hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

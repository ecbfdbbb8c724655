//! The single payload type routed between nodes.
//!
//! One enum covers every port payload; [`Payload::kind`] ties values back to
//! the static [`PayloadKind`] declared on ports. Bulky source data is held
//! behind `Arc` so fan-out clones stay cheap.

use crate::model::{MaterialData, MeshData, ObjectData, ObjectInstance, TextureData};
use crate::pipeline::artifact::{MaterialArtifact, MeshArtifact, SceneObject, TextureArtifact};
use crate::pipeline::port::PayloadKind;
use crate::types::{Aabb, ContentHash};
use std::sync::Arc;

/// Manifest entry reference; key and hash travel in the envelope.
#[derive(Debug, Clone, Default)]
pub struct AssetRef {
    pub bounds: Option<Aabb>,
}

/// An instance together with its resolved object tree.
#[derive(Debug, Clone)]
pub struct InstanceBundle {
    pub instance: ObjectInstance,
    pub object: Arc<ObjectData>,
    /// Hash of the object's content, used to key template caches.
    pub object_hash: ContentHash,
}

#[derive(Debug, Clone)]
pub enum Payload {
    Asset(AssetRef),
    Instance(ObjectInstance),
    InstanceBundle(InstanceBundle),
    MeshSource(Arc<MeshData>),
    MaterialSource(Arc<MaterialData>),
    TextureSource(Arc<TextureData>),
    Mesh(Arc<MeshArtifact>),
    Material(Arc<MaterialArtifact>),
    Texture(Arc<TextureArtifact>),
    SceneObject(SceneObject),
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Asset(_) => PayloadKind::Asset,
            Payload::Instance(_) => PayloadKind::Instance,
            Payload::InstanceBundle(_) => PayloadKind::InstanceBundle,
            Payload::MeshSource(_) => PayloadKind::MeshSource,
            Payload::MaterialSource(_) => PayloadKind::MaterialSource,
            Payload::TextureSource(_) => PayloadKind::TextureSource,
            Payload::Mesh(_) => PayloadKind::Mesh,
            Payload::Material(_) => PayloadKind::Material,
            Payload::Texture(_) => PayloadKind::Texture,
            Payload::SceneObject(_) => PayloadKind::SceneObject,
        }
    }

    pub fn as_asset(&self) -> Option<&AssetRef> {
        match self {
            Payload::Asset(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_instance(&self) -> Option<&ObjectInstance> {
        match self {
            Payload::Instance(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_instance_bundle(&self) -> Option<&InstanceBundle> {
        match self {
            Payload::InstanceBundle(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_mesh_source(&self) -> Option<&Arc<MeshData>> {
        match self {
            Payload::MeshSource(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_material_source(&self) -> Option<&Arc<MaterialData>> {
        match self {
            Payload::MaterialSource(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_texture_source(&self) -> Option<&Arc<TextureData>> {
        match self {
            Payload::TextureSource(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_mesh(&self) -> Option<&Arc<MeshArtifact>> {
        match self {
            Payload::Mesh(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_material(&self) -> Option<&Arc<MaterialArtifact>> {
        match self {
            Payload::Material(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_texture(&self) -> Option<&Arc<TextureArtifact>> {
        match self {
            Payload::Texture(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_scene_object(&self) -> Option<&SceneObject> {
        match self {
            Payload::SceneObject(v) => Some(v),
            _ => None,
        }
    }
}

//! Converted artifacts and the conversion routines that produce them.
//!
//! Artifacts are immutable once built and shared via `Arc`: a converter
//! builds one per unique (key, hash) and every downstream consumer holds a
//! reference. Per-instance state never lives on an artifact; it lives on
//! the [`SceneObject`] overlay.

use crate::error::{Error, Result};
use crate::model::{MaterialData, MeshData, ObjectData, TextureData};
use crate::types::{Aabb, Metadata, StreamKey, Transform};
use std::sync::Arc;

/// Converted mesh: summary data a host binds against.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshArtifact {
    pub name: String,
    pub vertex_count: u32,
    pub triangle_count: u32,
    pub bounds: Aabb,
}

/// Converted texture.
#[derive(Debug, Clone, PartialEq)]
pub struct TextureArtifact {
    pub name: String,
    pub width: u32,
    pub height: u32,
}

/// Converted material with texture references resolved to artifacts.
#[derive(Debug, Clone)]
pub struct MaterialArtifact {
    pub name: String,
    pub tint: [f32; 4],
    pub albedo: Option<Arc<TextureArtifact>>,
    pub normal: Option<Arc<TextureArtifact>>,
    pub emission: Option<Arc<TextureArtifact>>,
}

/// One node of an immutable scene template tree.
#[derive(Debug, Clone)]
pub struct TemplatePart {
    pub name: String,
    pub transform: Transform,
    pub mesh: Option<Arc<MeshArtifact>>,
    pub materials: Vec<Arc<MaterialArtifact>>,
    pub metadata: Metadata,
    pub children: Vec<TemplatePart>,
}

/// Immutable, shareable scene structure built from one object tree.
///
/// Templates are built once per unique (object key, hash) and shared between
/// every instance of that object.
#[derive(Debug, Clone)]
pub struct SceneTemplate {
    pub object_id: String,
    pub name: String,
    pub root: TemplatePart,
}

/// Per-instance overlay over a shared template.
///
/// Instantiation copies only this declared state; the template itself is
/// never mutated, so instances cannot leak changes into each other.
#[derive(Debug, Clone)]
pub struct SceneObject {
    pub template: Arc<SceneTemplate>,
    pub name: String,
    pub transform: Transform,
    pub metadata: Metadata,
}

/// Validate and convert raw mesh data.
pub fn convert_mesh(key: &StreamKey, data: &MeshData) -> Result<MeshArtifact> {
    if data.positions.is_empty() {
        return Err(Error::conversion(key, "mesh has no vertices"));
    }
    if data.indices.len() % 3 != 0 {
        return Err(Error::conversion(key, "index count is not a triangle list"));
    }
    let vertex_count = data.positions.len() as u32;
    if let Some(&bad) = data.indices.iter().find(|&&i| i >= vertex_count) {
        return Err(Error::conversion(
            key,
            format!("index {bad} out of range ({vertex_count} vertices)"),
        ));
    }

    let mut bounds = Aabb::new(data.positions[0], data.positions[0]);
    for &p in &data.positions[1..] {
        bounds.encapsulate(p);
    }

    Ok(MeshArtifact {
        name: data.name.clone(),
        vertex_count,
        triangle_count: (data.indices.len() / 3) as u32,
        bounds,
    })
}

/// Validate and convert raw RGBA8 texture data.
pub fn convert_texture(key: &StreamKey, data: &TextureData) -> Result<TextureArtifact> {
    if data.width == 0 || data.height == 0 {
        return Err(Error::conversion(key, "zero-sized texture"));
    }
    let expected = data.width as usize * data.height as usize * 4;
    if data.pixels.len() != expected {
        return Err(Error::conversion(
            key,
            format!(
                "pixel buffer is {} bytes, expected {expected}",
                data.pixels.len()
            ),
        ));
    }
    Ok(TextureArtifact {
        name: data.name.clone(),
        width: data.width,
        height: data.height,
    })
}

/// Convert material data, resolving texture references through `lookup`.
///
/// A missing texture degrades to a map-less material rather than failing the
/// whole conversion; the caller is expected to log it.
pub fn convert_material(
    data: &MaterialData,
    mut lookup: impl FnMut(&str) -> Option<Arc<TextureArtifact>>,
) -> MaterialArtifact {
    MaterialArtifact {
        name: data.name.clone(),
        tint: data.tint,
        albedo: data.albedo_map.as_deref().and_then(&mut lookup),
        normal: data.normal_map.as_deref().and_then(&mut lookup),
        emission: data.emission_map.as_deref().and_then(&mut lookup),
    }
}

/// Build an immutable template from an object tree, resolving meshes and
/// materials through the supplied lookups.
pub fn build_template(
    key: &StreamKey,
    object: &ObjectData,
    mesh: &mut impl FnMut(&str) -> Option<Arc<MeshArtifact>>,
    material: &mut impl FnMut(&str) -> Option<Arc<MaterialArtifact>>,
) -> Result<SceneTemplate> {
    let root = build_part(key, object, mesh, material)?;
    Ok(SceneTemplate {
        object_id: object.id.clone(),
        name: object.name.clone(),
        root,
    })
}

fn build_part(
    key: &StreamKey,
    object: &ObjectData,
    mesh: &mut impl FnMut(&str) -> Option<Arc<MeshArtifact>>,
    material: &mut impl FnMut(&str) -> Option<Arc<MaterialArtifact>>,
) -> Result<TemplatePart> {
    let resolved_mesh = match &object.mesh_id {
        Some(id) => Some(
            mesh(id).ok_or_else(|| Error::conversion(key, format!("mesh '{id}' not converted")))?,
        ),
        None => None,
    };
    let mut materials = Vec::with_capacity(object.material_ids.len());
    for id in &object.material_ids {
        materials.push(material(id).ok_or_else(|| {
            Error::conversion(key, format!("material '{id}' not converted"))
        })?);
    }
    let mut children = Vec::with_capacity(object.children.len());
    for child in &object.children {
        children.push(build_part(key, child, mesh, material)?);
    }
    Ok(TemplatePart {
        name: object.name.clone(),
        transform: object.transform.clone(),
        mesh: resolved_mesh,
        materials,
        metadata: object.metadata.clone(),
        children,
    })
}

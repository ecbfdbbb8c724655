//! Mesh, texture and material converters.
//!
//! Each converter owns a refcounted [`RefCountCache`] keyed by stream
//! identity with a single live hash per key: `Added` converts on first sight
//! and shares thereafter, `Changed` swaps the artifact atomically, the last
//! `Removed` evicts and propagates. The caches double as shared state for
//! parameter slots (the instance converter resolves against them).

use crate::error::{Error, Result};
use crate::model::MaterialData;
use crate::pipeline::artifact::{
    convert_material, convert_mesh, convert_texture, MaterialArtifact, MeshArtifact,
    TextureArtifact,
};
use crate::pipeline::cache::{self, CacheHandle, RefCountCache, Released};
use crate::pipeline::node::{
    NodeContext, NodeDescriptor, Processor, SharedState, ThreadAffinity,
};
use crate::pipeline::payload::Payload;
use crate::pipeline::port::{ParamDescriptor, ParamKind, PortDescriptor, PayloadKind};
use crate::types::{ModelKind, StreamEvent, StreamKey, SyncedData};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, MutexGuard};
use tracing::{debug, warn};

static MESH_PORTS: &[PortDescriptor] = &[
    PortDescriptor::input("meshes", PayloadKind::MeshSource),
    PortDescriptor::output("meshes", PayloadKind::Mesh),
];

pub static MESH_DESCRIPTOR: NodeDescriptor = NodeDescriptor {
    type_name: "MeshConverter",
    ports: MESH_PORTS,
    params: &[],
    provides: &[ParamKind::MeshCache],
    affinity: ThreadAffinity::Caller,
    is_root: false,
};

static TEXTURE_PORTS: &[PortDescriptor] = &[
    PortDescriptor::input("textures", PayloadKind::TextureSource),
    PortDescriptor::output("textures", PayloadKind::Texture),
];

pub static TEXTURE_DESCRIPTOR: NodeDescriptor = NodeDescriptor {
    type_name: "TextureConverter",
    ports: TEXTURE_PORTS,
    params: &[],
    provides: &[ParamKind::TextureCache],
    affinity: ThreadAffinity::Caller,
    is_root: false,
};

static MATERIAL_PORTS: &[PortDescriptor] = &[
    PortDescriptor::input("materials", PayloadKind::MaterialSource),
    PortDescriptor::output("materials", PayloadKind::Material),
    // Texture artifact updates, so changed textures reach live materials.
    PortDescriptor::optional_input("textures", PayloadKind::Texture),
];

static MATERIAL_PARAMS: &[ParamDescriptor] =
    &[ParamDescriptor::new("textures", ParamKind::TextureCache)];

pub static MATERIAL_DESCRIPTOR: NodeDescriptor = NodeDescriptor {
    type_name: "MaterialConverter",
    ports: MATERIAL_PORTS,
    params: MATERIAL_PARAMS,
    provides: &[ParamKind::MaterialCache],
    affinity: ThreadAffinity::Caller,
    is_root: false,
};

const OUT_PORT: u16 = 1;
const IN_MATERIALS: u16 = 0;
const IN_TEXTURES: u16 = 2;

fn lock<A>(cache: &CacheHandle<A>) -> MutexGuard<'_, RefCountCache<A>> {
    cache.lock().unwrap_or_else(|e| e.into_inner())
}

/// Shared cache handling for all three converters.
fn convert_event<A>(
    cache: &CacheHandle<A>,
    data: &SyncedData<Payload>,
    event: StreamEvent,
    build: impl FnOnce() -> Result<A>,
    wrap: impl FnOnce(Arc<A>) -> Payload,
    ctx: &mut NodeContext<'_>,
) -> Result<()> {
    let mut cache = lock(cache);
    match event {
        StreamEvent::Added => {
            let acquired = cache.acquire_with(&data.key, &data.hash, build)?;
            ctx.out.added(
                OUT_PORT,
                SyncedData::new(data.key.clone(), data.hash.clone(), wrap(acquired.artifact().clone())),
            );
        }
        StreamEvent::Changed => {
            if cache.refs(&data.key) == 0 {
                // Changed for an unknown key: treat as first sight.
                let acquired = cache.acquire_with(&data.key, &data.hash, build)?;
                ctx.out.added(
                    OUT_PORT,
                    SyncedData::new(
                        data.key.clone(),
                        data.hash.clone(),
                        wrap(acquired.artifact().clone()),
                    ),
                );
                return Ok(());
            }
            match cache.swap_with(&data.key, &data.hash, build)? {
                Some(artifact) => {
                    ctx.out.changed(
                        OUT_PORT,
                        SyncedData::new(data.key.clone(), data.hash.clone(), wrap(artifact)),
                    );
                }
                // Identical hash means identical content: absorb.
                None => debug!(key = %data.key, "unchanged content absorbed"),
            }
        }
        StreamEvent::Removed => match cache.release(&data.key) {
            Released::Evicted(artifact) => {
                ctx.out.removed(
                    OUT_PORT,
                    SyncedData::new(data.key.clone(), data.hash.clone(), wrap(artifact)),
                );
            }
            Released::StillHeld(refs) => {
                debug!(key = %data.key, refs, "reference released, artifact retained");
            }
            Released::Absent => {
                debug!(key = %data.key, "removal for unknown artifact ignored");
            }
        },
    }
    Ok(())
}

/// Converts raw meshes into [`MeshArtifact`]s.
pub struct MeshConverter {
    cache: CacheHandle<MeshArtifact>,
}

impl MeshConverter {
    pub fn new() -> Self {
        Self {
            cache: cache::shared(),
        }
    }
}

impl Default for MeshConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for MeshConverter {
    fn on_event(
        &mut self,
        _port: u16,
        data: &SyncedData<Payload>,
        event: StreamEvent,
        ctx: &mut NodeContext<'_>,
    ) -> Result<()> {
        let source = data
            .data
            .as_mesh_source()
            .cloned()
            .ok_or_else(|| Error::conversion(&data.key, "expected mesh source"))?;
        convert_event(
            &self.cache,
            data,
            event,
            || convert_mesh(&data.key, &source),
            Payload::Mesh,
            ctx,
        )
    }

    fn on_pipeline_shutdown(&mut self) {
        lock(&self.cache).clear();
    }

    fn shared_state(&self) -> Option<SharedState> {
        Some(SharedState::MeshCache(self.cache.clone()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Converts raw textures into [`TextureArtifact`]s.
pub struct TextureConverter {
    cache: CacheHandle<TextureArtifact>,
}

impl TextureConverter {
    pub fn new() -> Self {
        Self {
            cache: cache::shared(),
        }
    }
}

impl Default for TextureConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for TextureConverter {
    fn on_event(
        &mut self,
        _port: u16,
        data: &SyncedData<Payload>,
        event: StreamEvent,
        ctx: &mut NodeContext<'_>,
    ) -> Result<()> {
        let source = data
            .data
            .as_texture_source()
            .cloned()
            .ok_or_else(|| Error::conversion(&data.key, "expected texture source"))?;
        convert_event(
            &self.cache,
            data,
            event,
            || convert_texture(&data.key, &source),
            Payload::Texture,
            ctx,
        )
    }

    fn on_pipeline_shutdown(&mut self) {
        lock(&self.cache).clear();
    }

    fn shared_state(&self) -> Option<SharedState> {
        Some(SharedState::TextureCache(self.cache.clone()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Texture keys a material references, in the material's source.
fn texture_keys<'a>(
    key: &'a StreamKey,
    source: &'a MaterialData,
) -> impl Iterator<Item = StreamKey> + 'a {
    [&source.albedo_map, &source.normal_map, &source.emission_map]
        .into_iter()
        .flatten()
        .map(move |id| key.sibling(ModelKind::Texture, id.as_str()))
}

/// Converts raw materials, resolving texture references through the texture
/// converter's cache.
///
/// Sources are retained per live material so a swapped texture artifact can
/// reconvert the materials that reference it, in place, without a new
/// material hash.
pub struct MaterialConverter {
    cache: CacheHandle<MaterialArtifact>,
    textures: CacheHandle<TextureArtifact>,
    sources: HashMap<StreamKey, Arc<MaterialData>>,
}

impl MaterialConverter {
    pub fn new(textures: CacheHandle<TextureArtifact>) -> Self {
        Self {
            cache: cache::shared(),
            textures,
            sources: HashMap::new(),
        }
    }

    fn on_material_event(
        &mut self,
        data: &SyncedData<Payload>,
        event: StreamEvent,
        ctx: &mut NodeContext<'_>,
    ) -> Result<()> {
        let source = data
            .data
            .as_material_source()
            .cloned()
            .ok_or_else(|| Error::conversion(&data.key, "expected material source"))?;
        let textures = self.textures.clone();
        let key = data.key.clone();
        let build_source = source.clone();
        convert_event(
            &self.cache,
            data,
            event,
            move || {
                let textures = lock(&textures);
                Ok(convert_material(&build_source, |id| {
                    let texture_key = key.sibling(ModelKind::Texture, id);
                    let resolved = textures.get(&texture_key);
                    if resolved.is_none() {
                        warn!(material = %key, texture = id, "texture not in cache, map dropped");
                    }
                    resolved
                }))
            },
            Payload::Material,
            ctx,
        )?;
        match event {
            StreamEvent::Added | StreamEvent::Changed => {
                self.sources.insert(data.key.clone(), source);
            }
            StreamEvent::Removed => {
                if lock(&self.cache).refs(&data.key) == 0 {
                    self.sources.remove(&data.key);
                }
            }
        }
        Ok(())
    }

    fn on_texture_event(
        &mut self,
        data: &SyncedData<Payload>,
        event: StreamEvent,
        ctx: &mut NodeContext<'_>,
    ) -> Result<()> {
        // Added artifacts were resolved at conversion time; removals follow
        // their materials out through the normal stream.
        if event != StreamEvent::Changed {
            return Ok(());
        }
        let mut affected: Vec<StreamKey> = self
            .sources
            .iter()
            .filter(|(key, source)| texture_keys(key, source).any(|t| t == data.key))
            .map(|(key, _)| key.clone())
            .collect();
        affected.sort();
        for key in affected {
            self.reconvert(&key, ctx)?;
        }
        Ok(())
    }

    /// Rebuild one live material against the current texture cache and emit
    /// it as `Changed`.
    fn reconvert(&mut self, key: &StreamKey, ctx: &mut NodeContext<'_>) -> Result<()> {
        let Some(source) = self.sources.get(key).cloned() else {
            return Ok(());
        };
        let mut cache = lock(&self.cache);
        let textures = lock(&self.textures);
        let rebuilt = cache.rebuild_with(key, || {
            Ok(convert_material(&source, |id| {
                let texture_key = key.sibling(ModelKind::Texture, id);
                let resolved = textures.get(&texture_key);
                if resolved.is_none() {
                    warn!(material = %key, texture = id, "texture not in cache, map dropped");
                }
                resolved
            }))
        })?;
        let (Some(artifact), Some(hash)) = (rebuilt, cache.hash_of(key).cloned()) else {
            return Ok(());
        };
        debug!(material = %key, "material reconverted for changed texture");
        ctx.out.changed(
            OUT_PORT,
            SyncedData::new(key.clone(), hash, Payload::Material(artifact)),
        );
        Ok(())
    }
}

impl Processor for MaterialConverter {
    fn on_event(
        &mut self,
        port: u16,
        data: &SyncedData<Payload>,
        event: StreamEvent,
        ctx: &mut NodeContext<'_>,
    ) -> Result<()> {
        match port {
            IN_MATERIALS => self.on_material_event(data, event, ctx),
            IN_TEXTURES => self.on_texture_event(data, event, ctx),
            other => Err(Error::InvalidTopology(format!(
                "MaterialConverter has no input port {other}"
            ))),
        }
    }

    fn on_pipeline_shutdown(&mut self) {
        lock(&self.cache).clear();
        self.sources.clear();
    }

    fn shared_state(&self) -> Option<SharedState> {
        Some(SharedState::MaterialCache(self.cache.clone()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

//! Fetches model data for streamed instances and fans it out per kind.
//!
//! For every instance the provider resolves the object tree and its mesh,
//! material and texture dependencies, fetching each unique (key, hash) once.
//! Raw models go out on per-kind source ports (textures before the
//! materials that reference them), followed by the instance bundle itself.

use crate::error::{Error, Result};
use crate::model::{ObjectData, SyncModel};
use crate::pipeline::node::{NodeContext, NodeDescriptor, Processor, ThreadAffinity};
use crate::pipeline::nodes::streamer::HashIndexHandle;
use crate::pipeline::payload::{InstanceBundle, Payload};
use crate::pipeline::port::{ParamDescriptor, ParamKind, PortDescriptor, PayloadKind};
use crate::provider::SyncModelProvider;
use crate::types::{ContentHash, ModelKind, StreamEvent, StreamKey, SyncedData};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

static PORTS: &[PortDescriptor] = &[
    PortDescriptor::input("assets", PayloadKind::Asset),
    PortDescriptor::input("instances", PayloadKind::Instance),
    PortDescriptor::output("meshes", PayloadKind::MeshSource),
    PortDescriptor::output("materials", PayloadKind::MaterialSource),
    PortDescriptor::output("textures", PayloadKind::TextureSource),
    PortDescriptor::output("bundles", PayloadKind::InstanceBundle),
];

static PARAMS: &[ParamDescriptor] = &[ParamDescriptor::new("hashes", ParamKind::HashIndex)];

pub static DESCRIPTOR: NodeDescriptor = NodeDescriptor {
    type_name: "DataProvider",
    ports: PORTS,
    params: PARAMS,
    provides: &[],
    affinity: ThreadAffinity::Caller,
    is_root: false,
};

pub(crate) const IN_ASSETS: u16 = 0;
pub(crate) const IN_INSTANCES: u16 = 1;
const OUT_MESHES: u16 = 2;
const OUT_MATERIALS: u16 = 3;
const OUT_TEXTURES: u16 = 4;
const OUT_BUNDLES: u16 = 5;

enum Streamed {
    Object(Arc<ObjectData>),
    Mesh(Arc<crate::model::MeshData>),
    Material(Arc<crate::model::MaterialData>),
    Texture(Arc<crate::model::TextureData>),
}

impl Streamed {
    fn payload(&self) -> Option<Payload> {
        match self {
            // Objects travel inside bundles, never on their own port.
            Streamed::Object(_) => None,
            Streamed::Mesh(m) => Some(Payload::MeshSource(m.clone())),
            Streamed::Material(m) => Some(Payload::MaterialSource(m.clone())),
            Streamed::Texture(t) => Some(Payload::TextureSource(t.clone())),
        }
    }

    fn port(&self) -> Option<u16> {
        match self {
            Streamed::Object(_) => None,
            Streamed::Mesh(_) => Some(OUT_MESHES),
            Streamed::Material(_) => Some(OUT_MATERIALS),
            Streamed::Texture(_) => Some(OUT_TEXTURES),
        }
    }
}

struct MemoEntry {
    hash: ContentHash,
    model: Streamed,
}

/// Pulls model content on demand and deduplicates fetches per (key, hash).
pub struct DataProvider {
    provider: Arc<dyn SyncModelProvider>,
    hashes: HashIndexHandle,
    /// Everything fetched so far, keyed by identity with its live hash.
    streamed: HashMap<StreamKey, MemoEntry>,
    /// Live instance bundles for Added/Changed decisions and Removed payloads.
    instances: HashMap<StreamKey, InstanceBundle>,
}

impl DataProvider {
    pub fn new(provider: Arc<dyn SyncModelProvider>, hashes: HashIndexHandle) -> Self {
        Self {
            provider,
            hashes,
            streamed: HashMap::new(),
            instances: HashMap::new(),
        }
    }

    fn hash_of(&self, key: &StreamKey) -> Result<ContentHash> {
        self.hashes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .hash_of(key)
            .ok_or_else(|| Error::conversion(key, "no manifest entry for dependency"))
    }

    fn fetch(&self, key: &StreamKey, hash: &ContentHash, ctx: &NodeContext<'_>) -> Result<Streamed> {
        let model = self.provider.fetch_model(key, hash, ctx.cancel)?;
        if model.kind() != key.kind {
            return Err(Error::conversion(
                key,
                format!("model kind {} does not match its key", model.kind()),
            ));
        }
        match model {
            SyncModel::Object(o) => Ok(Streamed::Object(Arc::new(o))),
            SyncModel::Mesh(m) => Ok(Streamed::Mesh(Arc::new(m))),
            SyncModel::Material(m) => Ok(Streamed::Material(Arc::new(m))),
            SyncModel::Texture(t) => Ok(Streamed::Texture(Arc::new(t))),
            SyncModel::Instance(_) => Err(Error::conversion(key, "instances are not dependencies")),
        }
    }

    /// Fetch a dependency unless its current hash is already streamed.
    /// Emits Added on first sight, Changed after a hash swap.
    fn ensure_streamed(&mut self, key: &StreamKey, ctx: &mut NodeContext<'_>) -> Result<()> {
        let hash = self.hash_of(key)?;
        let known = match self.streamed.get(key) {
            Some(entry) if entry.hash == hash => return Ok(()),
            Some(_) => true,
            None => false,
        };

        let model = self.fetch(key, &hash, ctx)?;

        // Textures referenced by a material must be live before the material
        // goes downstream.
        if let Streamed::Material(material) = &model {
            let maps = [
                material.albedo_map.clone(),
                material.normal_map.clone(),
                material.emission_map.clone(),
            ];
            for map in maps.into_iter().flatten() {
                let texture_key = key.sibling(ModelKind::Texture, map);
                self.ensure_streamed(&texture_key, ctx)?;
            }
        }

        if let (Some(port), Some(payload)) = (model.port(), model.payload()) {
            let event = if known {
                StreamEvent::Changed
            } else {
                StreamEvent::Added
            };
            ctx.out
                .send(port, SyncedData::new(key.clone(), hash.clone(), payload), event);
        }
        self.streamed.insert(key.clone(), MemoEntry { hash, model });
        Ok(())
    }

    /// Walk an object tree and stream all of its dependencies.
    fn stream_dependencies(
        &mut self,
        source_key: &StreamKey,
        object: &ObjectData,
        ctx: &mut NodeContext<'_>,
    ) -> Result<()> {
        if let Some(mesh_id) = &object.mesh_id {
            let key = source_key.sibling(ModelKind::Mesh, mesh_id.clone());
            self.ensure_streamed(&key, ctx)?;
        }
        for material_id in &object.material_ids {
            let key = source_key.sibling(ModelKind::Material, material_id.clone());
            self.ensure_streamed(&key, ctx)?;
        }
        for child in &object.children {
            self.stream_dependencies(source_key, child, ctx)?;
        }
        Ok(())
    }

    fn object_for(
        &mut self,
        instance_key: &StreamKey,
        object_id: &str,
        ctx: &mut NodeContext<'_>,
    ) -> Result<(Arc<ObjectData>, ContentHash)> {
        let object_key = instance_key.sibling(ModelKind::Object, object_id);
        let hash = self.hash_of(&object_key)?;
        let cached = match self.streamed.get(&object_key) {
            Some(entry) if entry.hash == hash => match &entry.model {
                Streamed::Object(o) => Some(o.clone()),
                _ => None,
            },
            _ => None,
        };
        let object = match cached {
            Some(object) => object,
            None => {
                let model = self.fetch(&object_key, &hash, ctx)?;
                let object = match &model {
                    Streamed::Object(o) => o.clone(),
                    _ => return Err(Error::conversion(&object_key, "expected an object model")),
                };
                self.streamed.insert(
                    object_key.clone(),
                    MemoEntry {
                        hash: hash.clone(),
                        model,
                    },
                );
                object
            }
        };
        Ok((object, hash))
    }

    fn on_instance_event(
        &mut self,
        data: &SyncedData<Payload>,
        event: StreamEvent,
        ctx: &mut NodeContext<'_>,
    ) -> Result<()> {
        match event {
            StreamEvent::Added | StreamEvent::Changed => {
                let Some(instance) = data.data.as_instance() else {
                    return Err(Error::conversion(&data.key, "expected an instance payload"));
                };
                let (object, object_hash) =
                    self.object_for(&data.key, &instance.object_id, ctx)?;
                self.stream_dependencies(&data.key, &object, ctx)?;

                let bundle = InstanceBundle {
                    instance: instance.clone(),
                    object,
                    object_hash,
                };
                // Local state decides Added vs Changed, so a rebuild arriving
                // as Added after Removed stays an Added downstream.
                let event = if self.instances.contains_key(&data.key) {
                    StreamEvent::Changed
                } else {
                    StreamEvent::Added
                };
                self.instances.insert(data.key.clone(), bundle.clone());
                ctx.out.send(
                    OUT_BUNDLES,
                    SyncedData::new(
                        data.key.clone(),
                        data.hash.clone(),
                        Payload::InstanceBundle(bundle),
                    ),
                    event,
                );
                Ok(())
            }
            StreamEvent::Removed => {
                let Some(bundle) = self.instances.remove(&data.key) else {
                    debug!(key = %data.key, "removal for unknown bundle ignored");
                    return Ok(());
                };
                ctx.out.removed(
                    OUT_BUNDLES,
                    SyncedData::new(
                        data.key.clone(),
                        data.hash.clone(),
                        Payload::InstanceBundle(bundle),
                    ),
                );
                Ok(())
            }
        }
    }

    fn on_asset_event(
        &mut self,
        data: &SyncedData<Payload>,
        event: StreamEvent,
        ctx: &mut NodeContext<'_>,
    ) -> Result<()> {
        match data.key.kind {
            // Instance assets are handled upstream.
            ModelKind::Instance => Ok(()),
            // Objects travel inside bundles and have no port of their own,
            // but the memo must forget a removed object so a re-added one is
            // fetched fresh.
            ModelKind::Object => {
                if event == StreamEvent::Removed {
                    self.streamed.remove(&data.key);
                }
                Ok(())
            }
            ModelKind::Mesh | ModelKind::Material | ModelKind::Texture => match event {
                StreamEvent::Added => Ok(()),
                StreamEvent::Changed => {
                    if self.streamed.contains_key(&data.key) {
                        self.ensure_streamed(&data.key, ctx)?;
                    }
                    Ok(())
                }
                StreamEvent::Removed => {
                    let Some(entry) = self.streamed.remove(&data.key) else {
                        return Ok(());
                    };
                    if let (Some(port), Some(payload)) = (entry.model.port(), entry.model.payload())
                    {
                        ctx.out.removed(
                            port,
                            SyncedData::new(data.key.clone(), entry.hash, payload),
                        );
                    }
                    Ok(())
                }
            },
        }
    }
}

impl Processor for DataProvider {
    fn on_event(
        &mut self,
        port: u16,
        data: &SyncedData<Payload>,
        event: StreamEvent,
        ctx: &mut NodeContext<'_>,
    ) -> Result<()> {
        match port {
            IN_ASSETS => self.on_asset_event(data, event, ctx),
            IN_INSTANCES => self.on_instance_event(data, event, ctx),
            other => Err(Error::InvalidTopology(format!(
                "DataProvider has no input port {other}"
            ))),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MaterialData, MeshData, ObjectInstance, TextureData};
    use crate::pipeline::node::{Emission, Emitter};
    use crate::pipeline::nodes::streamer::ManifestIndex;
    use crate::provider::{CancelToken, MemorySyncProvider};
    use std::sync::Mutex;

    fn mesh(id: &str) -> SyncModel {
        SyncModel::Mesh(MeshData {
            name: id.into(),
            positions: vec![[0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            indices: vec![0, 1, 2],
            ..Default::default()
        })
    }

    fn texture(id: &str) -> SyncModel {
        SyncModel::Texture(TextureData {
            name: id.into(),
            width: 1,
            height: 1,
            pixels: vec![0; 4],
        })
    }

    fn material(id: &str, albedo: Option<&str>) -> SyncModel {
        SyncModel::Material(MaterialData {
            name: id.into(),
            albedo_map: albedo.map(str::to_owned),
            ..Default::default()
        })
    }

    fn object(id: &str, mesh_id: &str, material_id: &str) -> SyncModel {
        SyncModel::Object(ObjectData {
            id: id.into(),
            name: id.into(),
            mesh_id: Some(mesh_id.into()),
            material_ids: vec![material_id.into()],
            ..Default::default()
        })
    }

    struct Fixture {
        provider: Arc<MemorySyncProvider>,
        node: DataProvider,
    }

    fn fixture() -> Fixture {
        let provider = Arc::new(MemorySyncProvider::new());
        provider.put("src", texture("t1"), "th1");
        provider.put("src", material("mat1", Some("t1")), "mah1");
        provider.put("src", mesh("m1"), "meh1");
        provider.put("src", object("o1", "m1", "mat1"), "oh1");

        let mut index = ManifestIndex::default();
        for (kind, id, hash) in [
            (ModelKind::Texture, "t1", "th1"),
            (ModelKind::Material, "mat1", "mah1"),
            (ModelKind::Mesh, "m1", "meh1"),
            (ModelKind::Object, "o1", "oh1"),
        ] {
            index.insert(StreamKey::new("src", kind, id), ContentHash::from(hash));
        }
        let hashes: HashIndexHandle = Arc::new(Mutex::new(index));
        let node = DataProvider::new(provider.clone(), hashes);
        Fixture { provider, node }
    }

    fn instance_event(id: &str, object_id: &str) -> SyncedData<Payload> {
        SyncedData::new(
            StreamKey::new("src", ModelKind::Instance, id),
            ContentHash::from("ih1"),
            Payload::Instance(ObjectInstance {
                id: id.into(),
                name: id.into(),
                object_id: object_id.into(),
                ..Default::default()
            }),
        )
    }

    fn deliver(
        node: &mut DataProvider,
        port: u16,
        data: &SyncedData<Payload>,
        event: StreamEvent,
    ) -> Vec<(u16, StreamEvent, StreamKey)> {
        let mut emitter = Emitter::new();
        let cancel = CancelToken::new();
        let mut ctx = NodeContext {
            out: &mut emitter,
            cancel: &cancel,
        };
        node.on_event(port, data, event, &mut ctx).unwrap();
        emitter
            .take()
            .into_iter()
            .filter_map(|e| match e {
                Emission::Event { port, data, event } => Some((port, event, data.key)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_instance_streams_dependencies_then_bundle() {
        let mut fx = fixture();
        let events = deliver(
            &mut fx.node,
            IN_INSTANCES,
            &instance_event("i1", "o1"),
            StreamEvent::Added,
        );

        let ports: Vec<u16> = events.iter().map(|(p, _, _)| *p).collect();
        // Texture precedes the material that references it; bundle is last.
        assert_eq!(ports, vec![OUT_MESHES, OUT_TEXTURES, OUT_MATERIALS, OUT_BUNDLES]);
        assert!(events.iter().all(|(_, e, _)| *e == StreamEvent::Added));
    }

    #[test]
    fn test_second_instance_reuses_streamed_models() {
        let mut fx = fixture();
        deliver(
            &mut fx.node,
            IN_INSTANCES,
            &instance_event("i1", "o1"),
            StreamEvent::Added,
        );
        let events = deliver(
            &mut fx.node,
            IN_INSTANCES,
            &instance_event("i2", "o1"),
            StreamEvent::Added,
        );

        // One fetch per unique hash: only the new bundle goes out.
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, OUT_BUNDLES);
        assert_eq!(events[0].1, StreamEvent::Added);
    }

    #[test]
    fn test_changed_mesh_asset_restreams() {
        let mut fx = fixture();
        deliver(
            &mut fx.node,
            IN_INSTANCES,
            &instance_event("i1", "o1"),
            StreamEvent::Added,
        );

        // New mesh content appears under a new hash.
        fx.provider.put("src", mesh("m1"), "meh2");
        let key = StreamKey::new("src", ModelKind::Mesh, "m1");
        fx.node
            .hashes
            .lock()
            .unwrap()
            .insert(key.clone(), ContentHash::from("meh2"));

        let asset = SyncedData::new(
            key.clone(),
            ContentHash::from("meh2"),
            Payload::Asset(Default::default()),
        );
        let events = deliver(&mut fx.node, IN_ASSETS, &asset, StreamEvent::Changed);
        assert_eq!(events, vec![(OUT_MESHES, StreamEvent::Changed, key)]);
    }

    #[test]
    fn test_changed_asset_never_streamed_is_ignored() {
        let mut fx = fixture();
        let key = StreamKey::new("src", ModelKind::Mesh, "m1");
        let asset = SyncedData::new(
            key,
            ContentHash::from("meh1"),
            Payload::Asset(Default::default()),
        );
        let events = deliver(&mut fx.node, IN_ASSETS, &asset, StreamEvent::Changed);
        assert!(events.is_empty());
    }

    #[test]
    fn test_removed_asset_propagates_and_is_idempotent() {
        let mut fx = fixture();
        deliver(
            &mut fx.node,
            IN_INSTANCES,
            &instance_event("i1", "o1"),
            StreamEvent::Added,
        );

        let key = StreamKey::new("src", ModelKind::Mesh, "m1");
        let asset = SyncedData::new(
            key.clone(),
            ContentHash::from("meh1"),
            Payload::Asset(Default::default()),
        );
        let events = deliver(&mut fx.node, IN_ASSETS, &asset, StreamEvent::Removed);
        assert_eq!(events, vec![(OUT_MESHES, StreamEvent::Removed, key)]);

        let again = deliver(&mut fx.node, IN_ASSETS, &asset, StreamEvent::Removed);
        assert!(again.is_empty());
    }

    #[test]
    fn test_removed_instance_emits_bundle_removed() {
        let mut fx = fixture();
        deliver(
            &mut fx.node,
            IN_INSTANCES,
            &instance_event("i1", "o1"),
            StreamEvent::Added,
        );
        let events = deliver(
            &mut fx.node,
            IN_INSTANCES,
            &instance_event("i1", "o1"),
            StreamEvent::Removed,
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, OUT_BUNDLES);
        assert_eq!(events[0].1, StreamEvent::Removed);
    }

    #[test]
    fn test_removed_object_asset_clears_memo() {
        let mut fx = fixture();
        deliver(
            &mut fx.node,
            IN_INSTANCES,
            &instance_event("i1", "o1"),
            StreamEvent::Added,
        );
        let object_key = StreamKey::new("src", ModelKind::Object, "o1");
        assert!(fx.node.streamed.contains_key(&object_key));

        let asset = SyncedData::new(
            object_key.clone(),
            ContentHash::from("oh1"),
            Payload::Asset(Default::default()),
        );
        let events = deliver(&mut fx.node, IN_ASSETS, &asset, StreamEvent::Removed);
        // Objects have no port, so nothing goes out; the memo is gone.
        assert!(events.is_empty());
        assert!(!fx.node.streamed.contains_key(&object_key));
    }

    #[test]
    fn test_missing_manifest_entry_is_an_error() {
        let mut fx = fixture();
        let mut emitter = Emitter::new();
        let cancel = CancelToken::new();
        let mut ctx = NodeContext {
            out: &mut emitter,
            cancel: &cancel,
        };
        let event = instance_event("i1", "missing-object");
        let err = fx
            .node
            .on_event(IN_INSTANCES, &event, StreamEvent::Added, &mut ctx)
            .unwrap_err();
        assert!(matches!(err, Error::Conversion { .. }));
    }
}

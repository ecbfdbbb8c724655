//! Instance conversion: shared templates plus per-instance overlays.
//!
//! Every unique (object key, hash) is built into one immutable
//! [`SceneTemplate`] held in a refcounted cache; each instance gets a
//! lightweight [`SceneObject`] overlay pointing at the shared template.
//! Instance state lives only on the overlay, so no instance can mutate
//! another through the template.

use crate::error::{Error, Result};
use crate::model::ObjectData;
use crate::pipeline::artifact::{
    build_template, MaterialArtifact, MeshArtifact, SceneObject, SceneTemplate,
};
use crate::pipeline::cache::{CacheHandle, RefCountCache, Released};
use crate::pipeline::node::{
    NodeContext, NodeDescriptor, Processor, ThreadAffinity,
};
use crate::pipeline::payload::{InstanceBundle, Payload};
use crate::pipeline::port::{ParamDescriptor, ParamKind, PayloadKind, PortDescriptor};
use crate::types::{ContentHash, Metadata, ModelKind, StreamEvent, StreamKey, SyncedData};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, MutexGuard};
use tracing::debug;

static PORTS: &[PortDescriptor] = &[
    PortDescriptor::input("instances", PayloadKind::InstanceBundle),
    PortDescriptor::output("objects", PayloadKind::SceneObject),
    // Artifact updates, so changed meshes and materials reach templates
    // whose object content never moved.
    PortDescriptor::optional_input("meshes", PayloadKind::Mesh),
    PortDescriptor::optional_input("materials", PayloadKind::Material),
];

static PARAMS: &[ParamDescriptor] = &[
    ParamDescriptor::new("meshes", ParamKind::MeshCache),
    ParamDescriptor::new("materials", ParamKind::MaterialCache),
];

pub static DESCRIPTOR: NodeDescriptor = NodeDescriptor {
    type_name: "InstanceConverter",
    ports: PORTS,
    params: PARAMS,
    provides: &[],
    // Hosts typically instantiate scene objects on their own thread.
    affinity: ThreadAffinity::Host,
    is_root: false,
};

const IN_BUNDLES: u16 = 0;
const OUT_OBJECTS: u16 = 1;
const IN_MESHES: u16 = 2;
const IN_MATERIALS: u16 = 3;

fn lock<A>(cache: &CacheHandle<A>) -> MutexGuard<'_, RefCountCache<A>> {
    cache.lock().unwrap_or_else(|e| e.into_inner())
}

fn dependency_keys(object_key: &StreamKey, object: &ObjectData, out: &mut HashSet<StreamKey>) {
    if let Some(id) = &object.mesh_id {
        out.insert(object_key.sibling(ModelKind::Mesh, id.as_str()));
    }
    for id in &object.material_ids {
        out.insert(object_key.sibling(ModelKind::Material, id.as_str()));
    }
    for child in &object.children {
        dependency_keys(object_key, child, out);
    }
}

struct LiveInstance {
    object_key: StreamKey,
    hash: ContentHash,
    scene: SceneObject,
}

/// What a live template was built from, kept so it can be rebuilt when one
/// of its artifacts is swapped under an unchanged object hash.
struct TemplateSource {
    object: Arc<ObjectData>,
    dependencies: HashSet<StreamKey>,
}

pub struct InstanceConverter {
    meshes: CacheHandle<MeshArtifact>,
    materials: CacheHandle<MaterialArtifact>,
    templates: RefCountCache<SceneTemplate>,
    sources: HashMap<StreamKey, TemplateSource>,
    instances: HashMap<StreamKey, LiveInstance>,
}

impl InstanceConverter {
    pub fn new(
        meshes: CacheHandle<MeshArtifact>,
        materials: CacheHandle<MaterialArtifact>,
    ) -> Self {
        Self {
            meshes,
            materials,
            templates: RefCountCache::new(),
            sources: HashMap::new(),
            instances: HashMap::new(),
        }
    }

    /// Refcount of the template for an object key (0 when absent).
    pub fn template_refs(&self, key: &StreamKey) -> u32 {
        self.templates.refs(key)
    }

    pub fn template(&self, key: &StreamKey) -> Option<Arc<SceneTemplate>> {
        self.templates.get(key)
    }

    /// Acquire a reference to the shared template, building it only when
    /// this (object key, hash) has not been built yet.
    fn acquire_template(
        &mut self,
        object_key: &StreamKey,
        bundle: &InstanceBundle,
    ) -> Result<Arc<SceneTemplate>> {
        let Self {
            meshes,
            materials,
            templates,
            ..
        } = self;
        let acquired = templates.acquire_with(object_key, &bundle.object_hash, || {
            let meshes = lock(meshes);
            let materials = lock(materials);
            build_template(
                object_key,
                &bundle.object,
                &mut |id| meshes.get(&object_key.sibling(ModelKind::Mesh, id)),
                &mut |id| materials.get(&object_key.sibling(ModelKind::Material, id)),
            )
        })?;
        Ok(acquired.artifact().clone())
    }

    /// Rebuild the shared template in place if the object hash moved.
    fn swap_template(&mut self, object_key: &StreamKey, bundle: &InstanceBundle) -> Result<()> {
        let Self {
            meshes,
            materials,
            templates,
            ..
        } = self;
        templates.swap_with(object_key, &bundle.object_hash, || {
            let meshes = lock(meshes);
            let materials = lock(materials);
            build_template(
                object_key,
                &bundle.object,
                &mut |id| meshes.get(&object_key.sibling(ModelKind::Mesh, id)),
                &mut |id| materials.get(&object_key.sibling(ModelKind::Material, id)),
            )
        })?;
        Ok(())
    }

    fn record_source(&mut self, object_key: &StreamKey, bundle: &InstanceBundle) {
        let mut dependencies = HashSet::new();
        dependency_keys(object_key, &bundle.object, &mut dependencies);
        self.sources.insert(
            object_key.clone(),
            TemplateSource {
                object: bundle.object.clone(),
                dependencies,
            },
        );
    }

    /// Rebuild a live template against the current artifact caches without
    /// moving its hash or refcount.
    fn rebuild_template(&mut self, object_key: &StreamKey) -> Result<()> {
        let Self {
            meshes,
            materials,
            templates,
            sources,
            ..
        } = self;
        let Some(source) = sources.get(object_key) else {
            return Ok(());
        };
        let object = source.object.clone();
        templates.rebuild_with(object_key, || {
            let meshes = lock(meshes);
            let materials = lock(materials);
            build_template(
                object_key,
                &object,
                &mut |id| meshes.get(&object_key.sibling(ModelKind::Mesh, id)),
                &mut |id| materials.get(&object_key.sibling(ModelKind::Material, id)),
            )
        })?;
        Ok(())
    }

    fn overlay(template: Arc<SceneTemplate>, bundle: &InstanceBundle) -> SceneObject {
        // Object metadata forms the base; the instance overrides it.
        let mut metadata: Metadata = bundle.object.metadata.clone();
        metadata.extend(bundle.instance.metadata.clone());
        SceneObject {
            template,
            name: bundle.instance.name.clone(),
            transform: bundle.instance.transform.clone(),
            metadata,
        }
    }

    fn add(
        &mut self,
        data: &SyncedData<Payload>,
        bundle: &InstanceBundle,
        ctx: &mut NodeContext<'_>,
    ) -> Result<()> {
        let object_key = data.key.sibling(ModelKind::Object, &bundle.instance.object_id);
        let template = self.acquire_template(&object_key, bundle)?;
        self.record_source(&object_key, bundle);
        let scene = Self::overlay(template, bundle);
        self.instances.insert(
            data.key.clone(),
            LiveInstance {
                object_key,
                hash: data.hash.clone(),
                scene: scene.clone(),
            },
        );
        ctx.out.added(
            OUT_OBJECTS,
            SyncedData::new(data.key.clone(), data.hash.clone(), Payload::SceneObject(scene)),
        );
        Ok(())
    }

    fn change(
        &mut self,
        data: &SyncedData<Payload>,
        bundle: &InstanceBundle,
        ctx: &mut NodeContext<'_>,
    ) -> Result<()> {
        let object_key = data.key.sibling(ModelKind::Object, &bundle.instance.object_id);
        let Some(live) = self.instances.get(&data.key) else {
            // Changed for an instance never seen: treat as first sight.
            return self.add(data, bundle, ctx);
        };
        if live.object_key != object_key {
            // The instance points at a different object now. Upstream emits
            // this as Removed + Added, so release the stale reference and
            // rebuild.
            self.remove(data, ctx);
            return self.add(data, bundle, ctx);
        }

        self.swap_template(&object_key, bundle)?;
        self.record_source(&object_key, bundle);
        let Some(template) = self.templates.get(&object_key) else {
            return self.add(data, bundle, ctx);
        };
        let scene = Self::overlay(template, bundle);
        if let Some(live) = self.instances.get_mut(&data.key) {
            live.hash = data.hash.clone();
            live.scene = scene.clone();
        }
        ctx.out.changed(
            OUT_OBJECTS,
            SyncedData::new(data.key.clone(), data.hash.clone(), Payload::SceneObject(scene)),
        );
        Ok(())
    }

    fn remove(&mut self, data: &SyncedData<Payload>, ctx: &mut NodeContext<'_>) {
        let Some(live) = self.instances.remove(&data.key) else {
            debug!(key = %data.key, "removal for unknown instance ignored");
            return;
        };
        match self.templates.release(&live.object_key) {
            Released::Evicted(_) => {
                self.sources.remove(&live.object_key);
                debug!(object = %live.object_key, "template evicted");
            }
            Released::StillHeld(refs) => {
                debug!(object = %live.object_key, refs, "template retained");
            }
            Released::Absent => {}
        }
        ctx.out.removed(
            OUT_OBJECTS,
            SyncedData::new(
                data.key.clone(),
                data.hash.clone(),
                Payload::SceneObject(live.scene),
            ),
        );
    }

    fn on_bundle_event(
        &mut self,
        data: &SyncedData<Payload>,
        event: StreamEvent,
        ctx: &mut NodeContext<'_>,
    ) -> Result<()> {
        match event {
            StreamEvent::Added | StreamEvent::Changed => {
                let bundle = data
                    .data
                    .as_instance_bundle()
                    .cloned()
                    .ok_or_else(|| Error::conversion(&data.key, "expected instance bundle"))?;
                if event == StreamEvent::Added {
                    self.add(data, &bundle, ctx)
                } else {
                    self.change(data, &bundle, ctx)
                }
            }
            StreamEvent::Removed => {
                self.remove(data, ctx);
                Ok(())
            }
        }
    }

    /// A mesh or material artifact was swapped upstream while the objects
    /// built from it kept their hashes. Rebuild the affected templates and
    /// re-announce their live instances.
    fn on_artifact_event(
        &mut self,
        data: &SyncedData<Payload>,
        event: StreamEvent,
        ctx: &mut NodeContext<'_>,
    ) -> Result<()> {
        if event != StreamEvent::Changed {
            // Added and Removed artifacts only matter once a bundle names
            // them, and that bundle arrives on the instances port.
            return Ok(());
        }
        let mut affected: Vec<StreamKey> = self
            .sources
            .iter()
            .filter(|(_, source)| source.dependencies.contains(&data.key))
            .map(|(key, _)| key.clone())
            .collect();
        if affected.is_empty() {
            return Ok(());
        }
        affected.sort();
        for object_key in &affected {
            self.rebuild_template(object_key)?;
            debug!(object = %object_key, artifact = %data.key, "template rebuilt for changed artifact");
        }

        let mut live_keys: Vec<StreamKey> = self
            .instances
            .iter()
            .filter(|(_, live)| affected.binary_search(&live.object_key).is_ok())
            .map(|(key, _)| key.clone())
            .collect();
        live_keys.sort();
        for key in live_keys {
            let Some(live) = self.instances.get_mut(&key) else {
                continue;
            };
            let Some(template) = self.templates.get(&live.object_key) else {
                continue;
            };
            live.scene.template = template;
            ctx.out.changed(
                OUT_OBJECTS,
                SyncedData::new(key, live.hash.clone(), Payload::SceneObject(live.scene.clone())),
            );
        }
        Ok(())
    }
}

impl Processor for InstanceConverter {
    fn on_event(
        &mut self,
        port: u16,
        data: &SyncedData<Payload>,
        event: StreamEvent,
        ctx: &mut NodeContext<'_>,
    ) -> Result<()> {
        match port {
            IN_BUNDLES => self.on_bundle_event(data, event, ctx),
            IN_MESHES | IN_MATERIALS => self.on_artifact_event(data, event, ctx),
            other => Err(Error::InvalidTopology(format!(
                "InstanceConverter has no input port {other}"
            ))),
        }
    }

    fn on_pipeline_shutdown(&mut self) {
        self.instances.clear();
        self.sources.clear();
        self.templates.clear();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MeshData, ObjectData, ObjectInstance};
    use crate::pipeline::artifact::convert_mesh;
    use crate::pipeline::cache;
    use crate::pipeline::node::{Emission, Emitter};
    use crate::provider::CancelToken;
    use crate::types::{ContentHash, Transform};

    fn caches() -> (CacheHandle<MeshArtifact>, CacheHandle<MaterialArtifact>) {
        let meshes: CacheHandle<MeshArtifact> = cache::shared();
        let mesh_key = StreamKey::new("src", ModelKind::Mesh, "m1");
        let data = MeshData {
            name: "m1".into(),
            positions: vec![[0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            indices: vec![0, 1, 2],
            ..Default::default()
        };
        let artifact = convert_mesh(&mesh_key, &data).unwrap();
        lock(&meshes)
            .acquire_with(&mesh_key, &ContentHash::from("mh1"), || Ok(artifact))
            .unwrap();
        (meshes, cache::shared())
    }

    fn bundle(object_hash: &str) -> InstanceBundle {
        InstanceBundle {
            instance: ObjectInstance {
                id: "i1".into(),
                name: "chair 1".into(),
                object_id: "o1".into(),
                transform: Transform::default(),
                metadata: Metadata::new(),
            },
            object: Arc::new(ObjectData {
                id: "o1".into(),
                name: "chair".into(),
                mesh_id: Some("m1".into()),
                ..Default::default()
            }),
            object_hash: ContentHash::from(object_hash),
        }
    }

    fn instance_data(id: &str, hash: &str, object_hash: &str) -> SyncedData<Payload> {
        let mut b = bundle(object_hash);
        b.instance.id = id.into();
        SyncedData::new(
            StreamKey::new("src", ModelKind::Instance, id),
            ContentHash::from(hash),
            Payload::InstanceBundle(b),
        )
    }

    fn deliver(
        node: &mut InstanceConverter,
        data: &SyncedData<Payload>,
        event: StreamEvent,
    ) -> Result<Vec<(StreamEvent, SceneObject)>> {
        deliver_on(node, IN_BUNDLES, data, event)
    }

    fn deliver_on(
        node: &mut InstanceConverter,
        port: u16,
        data: &SyncedData<Payload>,
        event: StreamEvent,
    ) -> Result<Vec<(StreamEvent, SceneObject)>> {
        let mut emitter = Emitter::new();
        let cancel = CancelToken::new();
        let mut ctx = NodeContext {
            out: &mut emitter,
            cancel: &cancel,
        };
        node.on_event(port, data, event, &mut ctx)?;
        Ok(emitter
            .take()
            .into_iter()
            .filter_map(|e| match e {
                Emission::Event { data, event, .. } => {
                    data.data.as_scene_object().cloned().map(|s| (event, s))
                }
                _ => None,
            })
            .collect())
    }

    fn object_key() -> StreamKey {
        StreamKey::new("src", ModelKind::Object, "o1")
    }

    #[test]
    fn test_two_instances_share_one_template() {
        let (meshes, materials) = caches();
        let mut node = InstanceConverter::new(meshes, materials);

        let a = deliver(&mut node, &instance_data("i1", "ih1", "oh1"), StreamEvent::Added).unwrap();
        let b = deliver(&mut node, &instance_data("i2", "ih2", "oh1"), StreamEvent::Added).unwrap();

        assert_eq!(node.template_refs(&object_key()), 2);
        assert!(Arc::ptr_eq(&a[0].1.template, &b[0].1.template));
        assert_eq!(a[0].1.name, "chair 1");
    }

    #[test]
    fn test_last_removed_evicts_template() {
        let (meshes, materials) = caches();
        let mut node = InstanceConverter::new(meshes, materials);
        let first = instance_data("i1", "ih1", "oh1");
        let second = instance_data("i2", "ih2", "oh1");
        deliver(&mut node, &first, StreamEvent::Added).unwrap();
        deliver(&mut node, &second, StreamEvent::Added).unwrap();

        let removed = deliver(&mut node, &first, StreamEvent::Removed).unwrap();
        assert_eq!(removed.len(), 1);
        assert!(matches!(removed[0].0, StreamEvent::Removed));
        assert_eq!(node.template_refs(&object_key()), 1);

        deliver(&mut node, &second, StreamEvent::Removed).unwrap();
        assert_eq!(node.template_refs(&object_key()), 0);
        assert!(node.template(&object_key()).is_none());
    }

    #[test]
    fn test_double_removed_is_a_no_op() {
        let (meshes, materials) = caches();
        let mut node = InstanceConverter::new(meshes, materials);
        let data = instance_data("i1", "ih1", "oh1");
        deliver(&mut node, &data, StreamEvent::Added).unwrap();
        deliver(&mut node, &data, StreamEvent::Removed).unwrap();

        let again = deliver(&mut node, &data, StreamEvent::Removed).unwrap();
        assert!(again.is_empty());
        assert_eq!(node.template_refs(&object_key()), 0);
    }

    #[test]
    fn test_changed_object_hash_swaps_template_for_all_instances() {
        let (meshes, materials) = caches();
        let mut node = InstanceConverter::new(meshes, materials);
        deliver(&mut node, &instance_data("i1", "ih1", "oh1"), StreamEvent::Added).unwrap();
        deliver(&mut node, &instance_data("i2", "ih2", "oh1"), StreamEvent::Added).unwrap();
        let old = node.template(&object_key()).unwrap();

        let changed =
            deliver(&mut node, &instance_data("i1", "ih1", "oh2"), StreamEvent::Changed).unwrap();
        assert_eq!(changed.len(), 1);
        assert!(matches!(changed[0].0, StreamEvent::Changed));

        let new = node.template(&object_key()).unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        // Refcount is untouched by the swap.
        assert_eq!(node.template_refs(&object_key()), 2);
    }

    #[test]
    fn test_changed_mesh_artifact_rebuilds_live_templates() {
        let (meshes, materials) = caches();
        let mut node = InstanceConverter::new(meshes.clone(), materials);
        deliver(&mut node, &instance_data("i1", "ih1", "oh1"), StreamEvent::Added).unwrap();
        deliver(&mut node, &instance_data("i2", "ih2", "oh1"), StreamEvent::Added).unwrap();

        // The source republished the mesh under a new hash; upstream swapped
        // the cached artifact and announced it, while the object hash stayed
        // put.
        let mesh_key = StreamKey::new("src", ModelKind::Mesh, "m1");
        let quad = MeshData {
            name: "m1".into(),
            positions: vec![[0.0; 3], [1.0, 0.0, 0.0], [1.0, 1.0, 0.0], [0.0, 1.0, 0.0]],
            indices: vec![0, 1, 2, 0, 2, 3],
            ..Default::default()
        };
        let rebuilt = lock(&meshes)
            .swap_with(&mesh_key, &ContentHash::from("mh2"), || {
                convert_mesh(&mesh_key, &quad)
            })
            .unwrap()
            .unwrap();
        let announce = SyncedData::new(
            mesh_key,
            ContentHash::from("mh2"),
            Payload::Mesh(rebuilt),
        );
        let emitted = deliver_on(&mut node, IN_MESHES, &announce, StreamEvent::Changed).unwrap();

        // Both instances are re-announced with their own hashes, pointing at
        // the rebuilt template.
        assert_eq!(emitted.len(), 2);
        assert!(emitted.iter().all(|(e, _)| matches!(e, StreamEvent::Changed)));
        for (_, scene) in &emitted {
            assert_eq!(scene.template.root.mesh.as_ref().unwrap().vertex_count, 4);
        }
        assert_eq!(node.template_refs(&object_key()), 2);
        assert_eq!(
            node.template(&object_key()).unwrap().root.mesh.as_ref().unwrap().vertex_count,
            4
        );
    }

    #[test]
    fn test_unrelated_artifact_change_emits_nothing() {
        let (meshes, materials) = caches();
        let mut node = InstanceConverter::new(meshes, materials);
        deliver(&mut node, &instance_data("i1", "ih1", "oh1"), StreamEvent::Added).unwrap();

        let other = MeshData {
            name: "m9".into(),
            positions: vec![[0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            indices: vec![0, 1, 2],
            ..Default::default()
        };
        let other_key = StreamKey::new("src", ModelKind::Mesh, "m9");
        let artifact = Arc::new(convert_mesh(&other_key, &other).unwrap());
        let announce = SyncedData::new(other_key, ContentHash::from("mh9"), Payload::Mesh(artifact));

        let emitted = deliver_on(&mut node, IN_MESHES, &announce, StreamEvent::Changed).unwrap();
        assert!(emitted.is_empty());
    }

    #[test]
    fn test_instance_transform_stays_on_overlay() {
        let (meshes, materials) = caches();
        let mut node = InstanceConverter::new(meshes, materials);

        let mut data = instance_data("i1", "ih1", "oh1");
        if let Payload::InstanceBundle(b) = &mut data.data {
            b.instance.transform.position = [5.0, 0.0, 0.0];
        }
        let emitted = deliver(&mut node, &data, StreamEvent::Added).unwrap();
        let scene = &emitted[0].1;
        assert_eq!(scene.transform.position, [5.0, 0.0, 0.0]);
        assert_eq!(scene.template.root.transform, Transform::default());
    }
}

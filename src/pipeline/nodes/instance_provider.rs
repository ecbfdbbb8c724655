//! Resolves instance-kind assets into instance events.

use crate::error::{Error, Result};
use crate::model::{ObjectInstance, SyncModel};
use crate::pipeline::node::{NodeContext, NodeDescriptor, Processor, ThreadAffinity};
use crate::pipeline::payload::Payload;
use crate::pipeline::port::{PortDescriptor, PayloadKind};
use crate::provider::SyncModelProvider;
use crate::types::{ContentHash, ModelKind, StreamEvent, StreamKey, SyncedData};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

static PORTS: &[PortDescriptor] = &[
    PortDescriptor::input("assets", PayloadKind::Asset),
    PortDescriptor::output("instances", PayloadKind::Instance),
];

pub static DESCRIPTOR: NodeDescriptor = NodeDescriptor {
    type_name: "InstanceProvider",
    ports: PORTS,
    params: &[],
    provides: &[],
    affinity: ThreadAffinity::Caller,
    is_root: false,
};

const OUT_INSTANCES: u16 = 1;

struct CachedInstance {
    instance: ObjectInstance,
    hash: ContentHash,
}

/// Turns manifest-level instance assets into resolved instance events and
/// rebuilds instances when their object definition changes.
pub struct InstanceProvider {
    provider: Arc<dyn SyncModelProvider>,
    cache: HashMap<StreamKey, CachedInstance>,
    /// Object key → keys of instances placing that object.
    by_object: HashMap<StreamKey, HashSet<StreamKey>>,
}

impl InstanceProvider {
    pub fn new(provider: Arc<dyn SyncModelProvider>) -> Self {
        Self {
            provider,
            cache: HashMap::new(),
            by_object: HashMap::new(),
        }
    }

    fn object_key(instance_key: &StreamKey, object_id: &str) -> StreamKey {
        instance_key.sibling(ModelKind::Object, object_id)
    }

    fn fetch_instance(
        &self,
        key: &StreamKey,
        hash: &ContentHash,
        ctx: &NodeContext<'_>,
    ) -> Result<ObjectInstance> {
        match self.provider.fetch_model(key, hash, ctx.cancel)? {
            SyncModel::Instance(instance) => Ok(instance),
            other => Err(Error::conversion(
                key,
                format!("expected an instance model, got {}", other.kind()),
            )),
        }
    }

    fn emit(
        ctx: &mut NodeContext<'_>,
        key: &StreamKey,
        hash: &ContentHash,
        instance: ObjectInstance,
        event: StreamEvent,
    ) {
        ctx.out.send(
            OUT_INSTANCES,
            SyncedData::new(key.clone(), hash.clone(), Payload::Instance(instance)),
            event,
        );
    }

    /// Insert or update a fetched instance, emitting the right events.
    ///
    /// `force_readd` re-emits an unchanged instance as Removed+Added, used
    /// when its object definition went dirty.
    fn upsert(
        &mut self,
        key: &StreamKey,
        hash: &ContentHash,
        instance: ObjectInstance,
        force_readd: bool,
        ctx: &mut NodeContext<'_>,
    ) {
        match self.cache.remove(key) {
            None => {
                Self::emit(ctx, key, hash, instance.clone(), StreamEvent::Added);
            }
            Some(previous) => {
                if previous.instance.object_id != instance.object_id {
                    // Re-pointed at another object: downstream must rebuild.
                    let old_object = Self::object_key(key, &previous.instance.object_id);
                    if let Some(set) = self.by_object.get_mut(&old_object) {
                        set.remove(key);
                    }
                    Self::emit(
                        ctx,
                        key,
                        &previous.hash,
                        previous.instance,
                        StreamEvent::Removed,
                    );
                    Self::emit(ctx, key, hash, instance.clone(), StreamEvent::Added);
                } else if force_readd {
                    Self::emit(
                        ctx,
                        key,
                        &previous.hash,
                        previous.instance,
                        StreamEvent::Removed,
                    );
                    Self::emit(ctx, key, hash, instance.clone(), StreamEvent::Added);
                } else {
                    Self::emit(ctx, key, hash, instance.clone(), StreamEvent::Changed);
                }
            }
        }

        self.by_object
            .entry(Self::object_key(key, &instance.object_id))
            .or_default()
            .insert(key.clone());
        self.cache.insert(
            key.clone(),
            CachedInstance {
                instance,
                hash: hash.clone(),
            },
        );
    }

    fn remove(&mut self, key: &StreamKey, ctx: &mut NodeContext<'_>) {
        let Some(cached) = self.cache.remove(key) else {
            debug!(%key, "removal for unknown instance ignored");
            return;
        };
        let object_key = Self::object_key(key, &cached.instance.object_id);
        if let Some(set) = self.by_object.get_mut(&object_key) {
            set.remove(key);
            if set.is_empty() {
                self.by_object.remove(&object_key);
            }
        }
        Self::emit(ctx, key, &cached.hash, cached.instance, StreamEvent::Removed);
    }

    /// An object definition changed: rebuild every instance placing it.
    fn rebuild_instances_of(&mut self, object_key: &StreamKey, ctx: &mut NodeContext<'_>) {
        let Some(keys) = self.by_object.get(object_key) else {
            return;
        };
        let mut keys: Vec<StreamKey> = keys.iter().cloned().collect();
        keys.sort();
        for key in keys {
            let Some((hash, instance)) = self
                .cache
                .get(&key)
                .map(|c| (c.hash.clone(), c.instance.clone()))
            else {
                continue;
            };
            self.upsert(&key, &hash, instance, true, ctx);
        }
    }
}

impl Processor for InstanceProvider {
    fn on_event(
        &mut self,
        _port: u16,
        data: &SyncedData<Payload>,
        event: StreamEvent,
        ctx: &mut NodeContext<'_>,
    ) -> Result<()> {
        match event {
            StreamEvent::Added | StreamEvent::Changed => match data.key.kind {
                ModelKind::Instance => {
                    let instance = self.fetch_instance(&data.key, &data.hash, ctx)?;
                    self.upsert(&data.key, &data.hash, instance, false, ctx);
                    Ok(())
                }
                ModelKind::Object if event == StreamEvent::Changed => {
                    self.rebuild_instances_of(&data.key, ctx);
                    Ok(())
                }
                _ => Ok(()),
            },
            StreamEvent::Removed => {
                if data.key.kind == ModelKind::Instance {
                    self.remove(&data.key, ctx);
                }
                Ok(())
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

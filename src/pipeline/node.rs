//! Node descriptors and the processor trait.
//!
//! A [`NodeKind`] is the serializable identity of a node in a graph asset;
//! its [`NodeDescriptor`] statically declares ports, parameter slots, what
//! shared state it can provide to others, and its thread affinity. When the
//! runtime initializes a graph, each node kind creates a [`Processor`], the
//! live object that receives stream events.

use crate::error::{Error, Result};
use crate::pipeline::artifact::{MaterialArtifact, MeshArtifact, TextureArtifact};
use crate::pipeline::cache::CacheHandle;
use crate::pipeline::id::NodeId;
use crate::pipeline::nodes;
use crate::pipeline::nodes::metadata_filter::MetadataFilterSettings;
use crate::pipeline::nodes::streamer::HashIndexHandle;
use crate::pipeline::payload::Payload;
use crate::pipeline::port::{ParamDescriptor, ParamKind, PortDescriptor, PortDirection};
use crate::provider::{CancelToken, SyncModelProvider};
use crate::types::{StreamEvent, SyncedData};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// Which thread a node's processor calls must run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadAffinity {
    /// Runs on whichever thread drives the traversal.
    Caller,
    /// Calls are marshaled to the host's executor when one is registered.
    Host,
}

/// Static description of a node kind.
#[derive(Debug, Clone, Copy)]
pub struct NodeDescriptor {
    pub type_name: &'static str,
    pub ports: &'static [PortDescriptor],
    pub params: &'static [ParamDescriptor],
    /// Shared-state kinds this node can serve to parameter slots.
    pub provides: &'static [ParamKind],
    pub affinity: ThreadAffinity,
    /// Root nodes originate traversal passes instead of consuming inputs.
    pub is_root: bool,
}

impl NodeDescriptor {
    pub fn port(&self, index: u16) -> Option<&'static PortDescriptor> {
        self.ports.get(index as usize)
    }

    /// Look up a port index by name and direction.
    pub fn find_port(&self, name: &str, direction: PortDirection) -> Option<u16> {
        self.ports
            .iter()
            .position(|p| p.name == name && p.direction == direction)
            .map(|i| i as u16)
    }

    pub fn param(&self, name: &str) -> Option<&'static ParamDescriptor> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn input_indices(&self) -> impl Iterator<Item = u16> + '_ {
        self.ports
            .iter()
            .enumerate()
            .filter(|(_, p)| p.direction == PortDirection::Input)
            .map(|(i, _)| i as u16)
    }

    pub fn output_indices(&self) -> impl Iterator<Item = u16> + '_ {
        self.ports
            .iter()
            .enumerate()
            .filter(|(_, p)| p.direction == PortDirection::Output)
            .map(|(i, _)| i as u16)
    }
}

/// The built-in node kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    ProjectStreamer,
    InstanceProvider,
    DataProvider,
    MeshConverter,
    MaterialConverter,
    TextureConverter,
    InstanceConverter,
    MetadataFilter,
    SceneSink,
}

impl NodeKind {
    pub fn descriptor(&self) -> &'static NodeDescriptor {
        match self {
            NodeKind::ProjectStreamer => &nodes::streamer::DESCRIPTOR,
            NodeKind::InstanceProvider => &nodes::instance_provider::DESCRIPTOR,
            NodeKind::DataProvider => &nodes::data_provider::DESCRIPTOR,
            NodeKind::MeshConverter => &nodes::converters::MESH_DESCRIPTOR,
            NodeKind::MaterialConverter => &nodes::converters::MATERIAL_DESCRIPTOR,
            NodeKind::TextureConverter => &nodes::converters::TEXTURE_DESCRIPTOR,
            NodeKind::InstanceConverter => &nodes::instance_converter::DESCRIPTOR,
            NodeKind::MetadataFilter => &nodes::metadata_filter::DESCRIPTOR,
            NodeKind::SceneSink => &nodes::scene_sink::DESCRIPTOR,
        }
    }

    /// Instantiate this node's processor.
    pub(crate) fn create(
        &self,
        settings: &NodeSettings,
        ctx: &CreateContext<'_>,
    ) -> Result<Box<dyn Processor>> {
        let processor: Box<dyn Processor> = match self {
            NodeKind::ProjectStreamer => {
                Box::new(nodes::streamer::ProjectStreamer::new(ctx.provider.clone()))
            }
            NodeKind::InstanceProvider => Box::new(nodes::instance_provider::InstanceProvider::new(
                ctx.provider.clone(),
            )),
            NodeKind::DataProvider => Box::new(nodes::data_provider::DataProvider::new(
                ctx.provider.clone(),
                ctx.hash_index("hashes")?,
            )),
            NodeKind::MeshConverter => Box::new(nodes::converters::MeshConverter::new()),
            NodeKind::MaterialConverter => Box::new(nodes::converters::MaterialConverter::new(
                ctx.texture_cache("textures")?,
            )),
            NodeKind::TextureConverter => Box::new(nodes::converters::TextureConverter::new()),
            NodeKind::InstanceConverter => {
                Box::new(nodes::instance_converter::InstanceConverter::new(
                    ctx.mesh_cache("meshes")?,
                    ctx.material_cache("materials")?,
                ))
            }
            NodeKind::MetadataFilter => Box::new(nodes::metadata_filter::MetadataFilter::new(
                settings.metadata_filter().cloned().unwrap_or_default(),
            )),
            NodeKind::SceneSink => Box::new(nodes::scene_sink::SceneSink::new()),
        };
        Ok(processor)
    }
}

/// Per-node settings persisted with the graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum NodeSettings {
    #[default]
    None,
    MetadataFilter(MetadataFilterSettings),
}

impl NodeSettings {
    pub fn metadata_filter(&self) -> Option<&MetadataFilterSettings> {
        match self {
            NodeSettings::MetadataFilter(s) => Some(s),
            _ => None,
        }
    }
}

/// Shared state a processor exposes to parameter slots of sibling nodes.
#[derive(Clone)]
pub enum SharedState {
    HashIndex(HashIndexHandle),
    MeshCache(CacheHandle<MeshArtifact>),
    MaterialCache(CacheHandle<MaterialArtifact>),
    TextureCache(CacheHandle<TextureArtifact>),
}

impl SharedState {
    pub fn kind(&self) -> ParamKind {
        match self {
            SharedState::HashIndex(_) => ParamKind::HashIndex,
            SharedState::MeshCache(_) => ParamKind::MeshCache,
            SharedState::MaterialCache(_) => ParamKind::MaterialCache,
            SharedState::TextureCache(_) => ParamKind::TextureCache,
        }
    }
}

/// Everything a node kind needs to build its processor.
pub(crate) struct CreateContext<'a> {
    pub node: NodeId,
    pub provider: Arc<dyn SyncModelProvider>,
    /// Resolved parameter slots, keyed by slot name.
    pub params: &'a HashMap<&'static str, SharedState>,
}

impl CreateContext<'_> {
    fn unresolved(&self, slot: &'static str) -> Error {
        Error::UnresolvedDependency {
            node: self.node.0,
            slot: slot.to_owned(),
        }
    }

    pub fn hash_index(&self, slot: &'static str) -> Result<HashIndexHandle> {
        match self.params.get(slot) {
            Some(SharedState::HashIndex(h)) => Ok(h.clone()),
            _ => Err(self.unresolved(slot)),
        }
    }

    pub fn mesh_cache(&self, slot: &'static str) -> Result<CacheHandle<MeshArtifact>> {
        match self.params.get(slot) {
            Some(SharedState::MeshCache(h)) => Ok(h.clone()),
            _ => Err(self.unresolved(slot)),
        }
    }

    pub fn material_cache(&self, slot: &'static str) -> Result<CacheHandle<MaterialArtifact>> {
        match self.params.get(slot) {
            Some(SharedState::MaterialCache(h)) => Ok(h.clone()),
            _ => Err(self.unresolved(slot)),
        }
    }

    pub fn texture_cache(&self, slot: &'static str) -> Result<CacheHandle<TextureArtifact>> {
        match self.params.get(slot) {
            Some(SharedState::TextureCache(h)) => Ok(h.clone()),
            _ => Err(self.unresolved(slot)),
        }
    }
}

/// One emission from a processor, addressed by output port index.
#[derive(Debug, Clone)]
pub enum Emission {
    Begin {
        port: u16,
    },
    End {
        port: u16,
    },
    Event {
        port: u16,
        data: SyncedData<Payload>,
        event: StreamEvent,
    },
}

/// Collects a processor's emissions for the runtime to route.
#[derive(Debug, Default)]
pub struct Emitter {
    emissions: Vec<Emission>,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, port: u16) {
        self.emissions.push(Emission::Begin { port });
    }

    pub fn end(&mut self, port: u16) {
        self.emissions.push(Emission::End { port });
    }

    pub fn send(&mut self, port: u16, data: SyncedData<Payload>, event: StreamEvent) {
        self.emissions.push(Emission::Event { port, data, event });
    }

    pub fn added(&mut self, port: u16, data: SyncedData<Payload>) {
        self.send(port, data, StreamEvent::Added);
    }

    pub fn changed(&mut self, port: u16, data: SyncedData<Payload>) {
        self.send(port, data, StreamEvent::Changed);
    }

    pub fn removed(&mut self, port: u16, data: SyncedData<Payload>) {
        self.send(port, data, StreamEvent::Removed);
    }

    pub fn is_empty(&self) -> bool {
        self.emissions.is_empty()
    }

    pub fn take(&mut self) -> Vec<Emission> {
        std::mem::take(&mut self.emissions)
    }
}

/// Call-site context handed to every processor hook.
pub struct NodeContext<'a> {
    pub out: &'a mut Emitter,
    pub cancel: &'a CancelToken,
}

/// A live node instance.
///
/// Hooks run on the traversal thread unless the node declared
/// [`ThreadAffinity::Host`]. Errors from `on_event` are isolated per event;
/// errors from `on_pipeline_initialized` abort the run.
pub trait Processor: Send {
    fn on_pipeline_initialized(&mut self) -> Result<()> {
        Ok(())
    }

    fn on_pipeline_shutdown(&mut self) {}

    /// Originate a traversal pass. Only root nodes implement this.
    fn refresh(&mut self, _ctx: &mut NodeContext<'_>) -> Result<()> {
        Err(Error::InvalidState {
            expected: "root node",
            actual: "non-root node",
        })
    }

    /// First `Begin` of the pass arrived on `port`.
    fn on_begin(&mut self, _port: u16, _ctx: &mut NodeContext<'_>) {}

    /// A stream event arrived on an input port.
    fn on_event(
        &mut self,
        port: u16,
        data: &SyncedData<Payload>,
        event: StreamEvent,
        ctx: &mut NodeContext<'_>,
    ) -> Result<()>;

    /// All begun inputs delivered `End`.
    fn on_end(&mut self, _port: u16, _ctx: &mut NodeContext<'_>) {}

    /// Shared state served to parameter slots, if any.
    fn shared_state(&self) -> Option<SharedState> {
        None
    }

    /// Typed access for hosts and tests.
    fn as_any(&self) -> &dyn Any;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_port_lookup() {
        let desc = NodeKind::DataProvider.descriptor();
        let assets = desc.find_port("assets", PortDirection::Input);
        assert!(assets.is_some());
        assert!(desc.find_port("assets", PortDirection::Output).is_none());
        assert!(desc.find_port("nope", PortDirection::Input).is_none());
    }

    #[test]
    fn test_every_kind_has_consistent_descriptor() {
        let kinds = [
            NodeKind::ProjectStreamer,
            NodeKind::InstanceProvider,
            NodeKind::DataProvider,
            NodeKind::MeshConverter,
            NodeKind::MaterialConverter,
            NodeKind::TextureConverter,
            NodeKind::InstanceConverter,
            NodeKind::MetadataFilter,
            NodeKind::SceneSink,
        ];
        for kind in kinds {
            let desc = kind.descriptor();
            assert!(!desc.type_name.is_empty());
            // Roots have no inputs; non-roots have at least one.
            if desc.is_root {
                assert_eq!(desc.input_indices().count(), 0, "{}", desc.type_name);
            } else {
                assert!(desc.input_indices().count() > 0, "{}", desc.type_name);
            }
        }
    }

    #[test]
    fn test_emitter_collects_in_order() {
        let mut emitter = Emitter::new();
        emitter.begin(0);
        emitter.end(0);
        let taken = emitter.take();
        assert_eq!(taken.len(), 2);
        assert!(matches!(taken[0], Emission::Begin { port: 0 }));
        assert!(matches!(taken[1], Emission::End { port: 0 }));
        assert!(emitter.is_empty());
    }

    #[test]
    fn test_node_settings_round_trip() {
        let settings = NodeSettings::MetadataFilter(MetadataFilterSettings {
            key: "category".into(),
            value: Some("wall".into()),
            invert: false,
        });
        let json = serde_json::to_string(&settings).unwrap();
        let back: NodeSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(settings, back);
    }
}

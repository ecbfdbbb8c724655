//! Metadata-based scene object filtering.

use crate::error::Result;
use crate::pipeline::node::{
    NodeContext, NodeDescriptor, Processor, ThreadAffinity,
};
use crate::pipeline::payload::Payload;
use crate::pipeline::port::{PayloadKind, PortDescriptor};
use crate::types::{StreamEvent, StreamKey, SyncedData};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashSet;

static PORTS: &[PortDescriptor] = &[
    PortDescriptor::input("objects", PayloadKind::SceneObject),
    PortDescriptor::output("objects", PayloadKind::SceneObject),
];

pub static DESCRIPTOR: NodeDescriptor = NodeDescriptor {
    type_name: "MetadataFilter",
    ports: PORTS,
    params: &[],
    provides: &[],
    affinity: ThreadAffinity::Caller,
    is_root: false,
};

const OUT_OBJECTS: u16 = 1;

/// Filter criteria persisted with the graph.
///
/// An object passes when its metadata contains `key`, and, if `value` is
/// set, maps it to that exact value. `invert` flips the verdict.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataFilterSettings {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub invert: bool,
}

impl MetadataFilterSettings {
    fn matches(&self, payload: &Payload) -> bool {
        let verdict = payload.as_scene_object().is_some_and(|scene| {
            match scene.metadata.get(&self.key) {
                Some(found) => self.value.as_ref().map_or(true, |want| want == found),
                None => false,
            }
        });
        verdict != self.invert
    }
}

/// Forwards scene objects whose metadata matches the configured criteria.
///
/// An object whose verdict flips on `Changed` crosses the filter boundary as
/// `Added` or `Removed`, so downstream never sees a `Changed` for an object
/// it was never given.
pub struct MetadataFilter {
    settings: MetadataFilterSettings,
    passed: HashSet<StreamKey>,
}

impl MetadataFilter {
    pub fn new(settings: MetadataFilterSettings) -> Self {
        Self {
            settings,
            passed: HashSet::new(),
        }
    }
}

impl Processor for MetadataFilter {
    fn on_event(
        &mut self,
        _port: u16,
        data: &SyncedData<Payload>,
        event: StreamEvent,
        ctx: &mut NodeContext<'_>,
    ) -> Result<()> {
        let matches = self.settings.matches(&data.data);
        let was_passed = self.passed.contains(&data.key);
        match event {
            StreamEvent::Added if matches => {
                self.passed.insert(data.key.clone());
                ctx.out.added(OUT_OBJECTS, data.clone());
            }
            StreamEvent::Added => {}
            StreamEvent::Changed => match (was_passed, matches) {
                (true, true) => ctx.out.changed(OUT_OBJECTS, data.clone()),
                (true, false) => {
                    self.passed.remove(&data.key);
                    ctx.out.removed(OUT_OBJECTS, data.clone());
                }
                (false, true) => {
                    self.passed.insert(data.key.clone());
                    ctx.out.added(OUT_OBJECTS, data.clone());
                }
                (false, false) => {}
            },
            StreamEvent::Removed if was_passed => {
                self.passed.remove(&data.key);
                ctx.out.removed(OUT_OBJECTS, data.clone());
            }
            StreamEvent::Removed => {}
        }
        Ok(())
    }

    fn on_pipeline_shutdown(&mut self) {
        self.passed.clear();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

//! Terminal sink collecting the converted scene.
//!
//! The sink is the host's view onto the stream: it records every scene
//! object event together with the pass framing so a host (or a test) can
//! read back exactly what arrived and in what order. Hosts reach it through
//! [`PipelineRuntime::with_processor`](crate::pipeline::runtime::PipelineRuntime::with_processor).

use crate::error::Result;
use crate::pipeline::artifact::SceneObject;
use crate::pipeline::node::{
    NodeContext, NodeDescriptor, Processor, ThreadAffinity,
};
use crate::pipeline::payload::Payload;
use crate::pipeline::port::{PayloadKind, PortDescriptor};
use crate::types::{StreamEvent, StreamKey, SyncedData};
use std::any::Any;
use tracing::trace;

static PORTS: &[PortDescriptor] =
    &[PortDescriptor::input("objects", PayloadKind::SceneObject)];

pub static DESCRIPTOR: NodeDescriptor = NodeDescriptor {
    type_name: "SceneSink",
    ports: PORTS,
    params: &[],
    provides: &[],
    affinity: ThreadAffinity::Caller,
    is_root: false,
};

/// One recorded scene object event.
#[derive(Debug, Clone)]
pub struct SinkRecord {
    pub event: StreamEvent,
    pub key: StreamKey,
    pub object: SceneObject,
}

#[derive(Default)]
pub struct SceneSink {
    records: Vec<SinkRecord>,
    begins: u32,
    ends: u32,
}

impl SceneSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[SinkRecord] {
        &self.records
    }

    pub fn begins(&self) -> u32 {
        self.begins
    }

    pub fn ends(&self) -> u32 {
        self.ends
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.begins = 0;
        self.ends = 0;
    }
}

impl Processor for SceneSink {
    fn on_begin(&mut self, _port: u16, _ctx: &mut NodeContext<'_>) {
        self.begins += 1;
    }

    fn on_event(
        &mut self,
        _port: u16,
        data: &SyncedData<Payload>,
        event: StreamEvent,
        _ctx: &mut NodeContext<'_>,
    ) -> Result<()> {
        let object = data
            .data
            .as_scene_object()
            .cloned()
            .ok_or_else(|| crate::error::Error::conversion(&data.key, "expected scene object"))?;
        trace!(key = %data.key, %event, "scene object recorded");
        self.records.push(SinkRecord {
            event,
            key: data.key.clone(),
            object,
        });
        Ok(())
    }

    fn on_end(&mut self, _port: u16, _ctx: &mut NodeContext<'_>) {
        self.ends += 1;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

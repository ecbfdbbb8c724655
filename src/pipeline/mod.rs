//! The streaming pipeline: graph description, caches, runtime.
//!
//! Data flows through the standard topology as:
//!
//! ```text
//!                       +-> InstanceProvider -+
//!  ProjectStreamer -----+                     +-> DataProvider
//!   (manifest diff)     +---------------------+       |
//!                                 meshes / materials / textures / bundles
//!                                      |        |         |        |
//!                                MeshConv  MaterialConv  TexConv   |
//!                                      \        |         /        v
//!                                       (shared caches)    InstanceConverter
//!                                                                  |
//!                                                                  v
//!                                                              SceneSink
//! ```
//!
//! The converters also feed artifact updates forward: TexConv announces
//! changed textures to MaterialConv, and MeshConv / MaterialConv announce
//! changed artifacts to the InstanceConverter, so content swapped under an
//! unchanged owner hash still reaches live scenes.
//!
//! Graphs are described by [`PipelineGraph`], validated statically against
//! each node kind's descriptor, and instantiated by [`PipelineRuntime`].

pub mod artifact;
pub mod builder;
pub mod cache;
pub mod graph;
pub mod host;
pub mod id;
pub mod node;
pub mod nodes;
pub mod payload;
pub mod port;
pub mod runtime;

pub use builder::{standard_graph, StandardNodes};
pub use graph::{Connection, NodeSpec, ParamBinding, PipelineGraph};
pub use host::{host_channel, HostBridge, HostExecutor};
pub use id::{NodeId, PortRef};
pub use node::{NodeContext, NodeDescriptor, NodeKind, NodeSettings, Processor, ThreadAffinity};
pub use payload::Payload;
pub use port::{ParamKind, PayloadKind, PortDescriptor, PortDirection};
pub use runtime::{PipelineRuntime, RuntimeState};

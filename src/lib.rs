//! Streaming synchronization pipeline for remote 3D model data.
//!
//! The crate turns versioned backend manifests into an incrementally
//! maintained scene: a root streamer diffs manifests by content hash and
//! emits `Added` / `Changed` / `Removed` events, provider nodes pull model
//! data on demand, converters build shared immutable artifacts through
//! refcounted caches, and an instance converter assembles per-instance scene
//! objects over shared templates.
//!
//! ```no_run
//! use std::sync::Arc;
//! use syncstream::pipeline::{standard_graph, PipelineRuntime};
//! use syncstream::provider::MemorySyncProvider;
//! use syncstream::CancelToken;
//!
//! # fn main() -> syncstream::Result<()> {
//! let provider = Arc::new(MemorySyncProvider::new());
//! let (graph, _nodes) = standard_graph()?;
//! let mut runtime = PipelineRuntime::initialize(&graph, provider)?;
//! runtime.run()?;
//! runtime.refresh(&CancelToken::new())?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod provider;
pub mod types;

pub use error::{Error, Result};
pub use provider::{CancelToken, MemorySyncProvider, SyncModelProvider};
pub use types::{ContentHash, ModelKind, StreamEvent, StreamKey, SyncedData};

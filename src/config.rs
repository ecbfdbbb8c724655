//! Graph asset persistence.
//!
//! Graphs save as versioned, pretty-printed JSON so they diff cleanly in
//! version control. Loading rejects files written by a newer format version
//! instead of misreading them.

use crate::error::{Error, Result};
use crate::pipeline::graph::PipelineGraph;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

/// Format version written by this crate.
pub const CURRENT_VERSION: u32 = 1;

/// On-disk wrapper around a pipeline graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineFile {
    pub version: u32,
    pub graph: PipelineGraph,
}

impl PipelineFile {
    pub fn new(graph: PipelineGraph) -> Self {
        Self {
            version: CURRENT_VERSION,
            graph,
        }
    }
}

/// Serialize a graph to a file.
pub fn save(graph: &PipelineGraph, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let file = PipelineFile::new(graph.clone());
    let json = serde_json::to_string_pretty(&file)?;
    fs::write(path, json)?;
    info!(path = %path.display(), "graph saved");
    Ok(())
}

/// Deserialize and validate a graph from a file.
pub fn load(path: impl AsRef<Path>) -> Result<PipelineGraph> {
    let path = path.as_ref();
    let json = fs::read_to_string(path)?;
    let file: PipelineFile = serde_json::from_str(&json)?;
    if file.version > CURRENT_VERSION {
        return Err(Error::InvalidTopology(format!(
            "graph file version {} is newer than supported version {CURRENT_VERSION}",
            file.version
        )));
    }
    file.graph.validate()?;
    info!(path = %path.display(), version = file.version, "graph loaded");
    Ok(file.graph)
}

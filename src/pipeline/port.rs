//! Static port and parameter descriptors.
//!
//! Every node kind declares its ports and parameter slots as `'static`
//! slices. All wiring legality (direction, payload kind, single driver per
//! input) is checked against these descriptors when the graph is built or
//! validated; nothing is discovered at runtime.

use serde::{Deserialize, Serialize};

/// What travels over a port. Connections require an exact match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PayloadKind {
    /// Manifest entry reference (bounds only; key/hash are in the envelope).
    Asset,
    /// An object instance placement.
    Instance,
    /// Instance bundled with its resolved object tree.
    InstanceBundle,
    /// Raw mesh data awaiting conversion.
    MeshSource,
    /// Raw material data awaiting conversion.
    MaterialSource,
    /// Raw texture data awaiting conversion.
    TextureSource,
    /// Converted mesh artifact.
    Mesh,
    /// Converted material artifact.
    Material,
    /// Converted texture artifact.
    Texture,
    /// Converted, shareable scene object overlay.
    SceneObject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

/// Compile-time description of one port.
#[derive(Debug, Clone, Copy)]
pub struct PortDescriptor {
    pub name: &'static str,
    pub direction: PortDirection,
    pub payload: PayloadKind,
    /// Required inputs must be driven by exactly one connection for the
    /// graph to validate. Meaningless on outputs.
    pub required: bool,
}

impl PortDescriptor {
    pub const fn input(name: &'static str, payload: PayloadKind) -> Self {
        Self {
            name,
            direction: PortDirection::Input,
            payload,
            required: true,
        }
    }

    /// An input the graph may leave unconnected.
    pub const fn optional_input(name: &'static str, payload: PayloadKind) -> Self {
        Self {
            name,
            direction: PortDirection::Input,
            payload,
            required: false,
        }
    }

    pub const fn output(name: &'static str, payload: PayloadKind) -> Self {
        Self {
            name,
            direction: PortDirection::Output,
            payload,
            required: false,
        }
    }
}

/// What a parameter slot expects its target node to provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamKind {
    /// Manifest hash lookup (the streamer provides this).
    HashIndex,
    MeshCache,
    MaterialCache,
    TextureCache,
}

/// Compile-time description of one parameter slot.
#[derive(Debug, Clone, Copy)]
pub struct ParamDescriptor {
    pub name: &'static str,
    pub kind: ParamKind,
}

impl ParamDescriptor {
    pub const fn new(name: &'static str, kind: ParamKind) -> Self {
        Self { name, kind }
    }
}

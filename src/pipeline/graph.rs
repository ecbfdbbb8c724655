//! The pipeline graph asset.
//!
//! A [`PipelineGraph`] is pure description: node kinds with settings,
//! connections between typed ports, and parameter bindings. It is built
//! programmatically, validated, and persisted; the runtime turns it into
//! live processors.

use crate::error::{Error, Result};
use crate::pipeline::id::{NodeId, PortRef};
use crate::pipeline::node::{NodeKind, NodeSettings};
use crate::pipeline::port::{PortDescriptor, PortDirection};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

/// One node in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    pub kind: NodeKind,
    #[serde(default)]
    pub settings: NodeSettings,
}

/// A directed connection from an output port to an input port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub from: PortRef,
    pub to: PortRef,
}

/// Binds a node's parameter slot to the node providing the shared state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamBinding {
    pub node: NodeId,
    pub slot: String,
    pub target: NodeId,
}

/// Serializable pipeline description.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineGraph {
    nodes: Vec<NodeSpec>,
    connections: Vec<Connection>,
    params: Vec<ParamBinding>,
}

impl PipelineGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> &[NodeSpec] {
        &self.nodes
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn params(&self) -> &[ParamBinding] {
        &self.params
    }

    /// Add a node with default settings.
    pub fn add_node(&mut self, kind: NodeKind) -> NodeId {
        self.add_node_with(kind, NodeSettings::None)
    }

    /// Add a node with explicit settings.
    pub fn add_node_with(&mut self, kind: NodeKind, settings: NodeSettings) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(NodeSpec { id, kind, settings });
        debug!(node = %id, kind = ?kind, "node added");
        id
    }

    pub fn spec(&self, id: NodeId) -> Result<&NodeSpec> {
        self.nodes
            .get(id.index())
            .ok_or_else(|| Error::InvalidTopology(format!("unknown node {id}")))
    }

    /// Resolve an output port by name.
    pub fn output(&self, node: NodeId, name: &str) -> Result<PortRef> {
        self.port(node, name, PortDirection::Output)
    }

    /// Resolve an input port by name.
    pub fn input(&self, node: NodeId, name: &str) -> Result<PortRef> {
        self.port(node, name, PortDirection::Input)
    }

    fn port(&self, node: NodeId, name: &str, direction: PortDirection) -> Result<PortRef> {
        let spec = self.spec(node)?;
        let desc = spec.kind.descriptor();
        let port = desc.find_port(name, direction).ok_or_else(|| {
            Error::InvalidTopology(format!(
                "node {node} ({}) has no {direction:?} port '{name}'",
                desc.type_name
            ))
        })?;
        Ok(PortRef::new(node, port))
    }

    fn port_descriptor(&self, port: PortRef) -> Result<&'static PortDescriptor> {
        let spec = self.spec(port.node)?;
        spec.kind.descriptor().port(port.port).ok_or_else(|| {
            Error::InvalidTopology(format!("node {} has no port index {}", port.node, port.port))
        })
    }

    /// Wire an output into an input.
    pub fn connect(&mut self, from: PortRef, to: PortRef) -> Result<()> {
        let connection = Connection { from, to };
        self.check_connection(&connection)?;
        if self.connections.iter().any(|c| c.to == to) {
            return Err(Error::InvalidTopology(format!(
                "input {to} is already driven"
            )));
        }
        self.connections.push(connection);
        Ok(())
    }

    fn check_connection(&self, connection: &Connection) -> Result<()> {
        let from = self.port_descriptor(connection.from)?;
        let to = self.port_descriptor(connection.to)?;
        if from.direction != PortDirection::Output {
            return Err(Error::InvalidTopology(format!(
                "{} ('{}') is not an output",
                connection.from, from.name
            )));
        }
        if to.direction != PortDirection::Input {
            return Err(Error::InvalidTopology(format!(
                "{} ('{}') is not an input",
                connection.to, to.name
            )));
        }
        if from.payload != to.payload {
            return Err(Error::InvalidTopology(format!(
                "payload mismatch: '{}' carries {:?} but '{}' expects {:?}",
                from.name, from.payload, to.name, to.payload
            )));
        }
        Ok(())
    }

    /// Bind a parameter slot to a providing node. Rebinding replaces.
    pub fn bind_param(&mut self, node: NodeId, slot: &str, target: NodeId) -> Result<()> {
        self.check_param(node, slot, target)?;
        if let Some(existing) = self
            .params
            .iter_mut()
            .find(|p| p.node == node && p.slot == slot)
        {
            existing.target = target;
        } else {
            self.params.push(ParamBinding {
                node,
                slot: slot.to_owned(),
                target,
            });
        }
        Ok(())
    }

    fn check_param(&self, node: NodeId, slot: &str, target: NodeId) -> Result<()> {
        let spec = self.spec(node)?;
        let desc = spec.kind.descriptor();
        let param = desc.param(slot).ok_or_else(|| {
            Error::InvalidTopology(format!(
                "node {node} ({}) has no parameter slot '{slot}'",
                desc.type_name
            ))
        })?;
        let target_desc = self.spec(target)?.kind.descriptor();
        if !target_desc.provides.contains(&param.kind) {
            return Err(Error::InvalidTopology(format!(
                "node {target} ({}) does not provide {:?} for slot '{slot}'",
                target_desc.type_name, param.kind
            )));
        }
        Ok(())
    }

    /// Structural validation.
    ///
    /// Accepts exactly when every required input is driven by one connection,
    /// no input is driven twice, at most one root exists, every recorded
    /// connection and binding is legal (graphs may arrive from disk), and the
    /// dependency graph is acyclic.
    pub fn validate(&self) -> Result<()> {
        for connection in &self.connections {
            self.check_connection(connection)?;
        }
        for binding in &self.params {
            self.check_param(binding.node, &binding.slot, binding.target)?;
        }

        for spec in &self.nodes {
            let desc = spec.kind.descriptor();
            for input in desc.input_indices() {
                let port = PortRef::new(spec.id, input);
                let drivers = self.connections.iter().filter(|c| c.to == port).count();
                if drivers > 1 {
                    return Err(Error::InvalidTopology(format!(
                        "input {port} has {drivers} drivers"
                    )));
                }
                let required = desc.port(input).map(|p| p.required).unwrap_or(false);
                if required && drivers == 0 {
                    return Err(Error::InvalidTopology(format!(
                        "required input '{}' of node {} ({}) is not connected",
                        desc.port(input).map(|p| p.name).unwrap_or("?"),
                        spec.id,
                        desc.type_name
                    )));
                }
            }
        }

        let roots = self
            .nodes
            .iter()
            .filter(|s| s.kind.descriptor().is_root)
            .count();
        if roots > 1 {
            return Err(Error::InvalidTopology(format!(
                "{roots} root nodes; at most one is allowed"
            )));
        }

        self.initialization_order().map(|_| ())
    }

    /// Topological order over connection and parameter edges.
    ///
    /// Parameter targets precede their dependents, so processors can be
    /// created in this order and resolve their slots. Fails with
    /// [`Error::CyclicGraph`] when no such order exists.
    pub fn initialization_order(&self) -> Result<Vec<NodeId>> {
        let n = self.nodes.len();
        let mut in_degree = vec![0usize; n];
        let mut edges: Vec<Vec<usize>> = vec![Vec::new(); n];

        // Self-edges are a cycle outright.
        if self.connections.iter().any(|c| c.from.node == c.to.node)
            || self.params.iter().any(|p| p.target == p.node)
        {
            return Err(Error::CyclicGraph);
        }

        fn add_edge(edges: &mut [Vec<usize>], in_degree: &mut [usize], from: NodeId, to: NodeId) {
            edges[from.index()].push(to.index());
            in_degree[to.index()] += 1;
        }
        for connection in &self.connections {
            add_edge(
                &mut edges,
                &mut in_degree,
                connection.from.node,
                connection.to.node,
            );
        }
        for binding in &self.params {
            add_edge(&mut edges, &mut in_degree, binding.target, binding.node);
        }

        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(index) = queue.pop_front() {
            order.push(NodeId(index as u32));
            for &next in &edges[index] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() != n {
            return Err(Error::CyclicGraph);
        }
        Ok(order)
    }
}

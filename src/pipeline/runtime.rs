//! The pipeline runtime: processor creation, traversal, framing.
//!
//! A runtime is built from a validated [`PipelineGraph`] and a provider.
//! One thread drives traversal: the root originates a pass and every
//! resulting event is dispatched FIFO through the wired connections.
//! `Begin`/`End` framing propagates automatically: a node's first incoming
//! `Begin` opens its outputs, and its outputs close when every driven input
//! has delivered `End`, so each node sees exactly one bracket per pass.
//!
//! Processor errors during event handling are isolated: the event is logged
//! and dropped, the pass continues.

use crate::error::{Error, Result};
use crate::pipeline::graph::PipelineGraph;
use crate::pipeline::host::{HostBridge, NodeCall};
use crate::pipeline::id::NodeId;
use crate::pipeline::node::{
    CreateContext, Emission, Emitter, NodeContext, NodeKind, Processor, SharedState,
    ThreadAffinity,
};
use crate::provider::{CancelToken, SyncModelProvider};
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Runtime lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Uninitialized,
    Initialized,
    Running,
    ShuttingDown,
    Terminated,
}

impl RuntimeState {
    fn name(self) -> &'static str {
        match self {
            RuntimeState::Uninitialized => "uninitialized",
            RuntimeState::Initialized => "initialized",
            RuntimeState::Running => "running",
            RuntimeState::ShuttingDown => "shutting down",
            RuntimeState::Terminated => "terminated",
        }
    }
}

struct LiveNode {
    kind: NodeKind,
    affinity: ThreadAffinity,
    processor: Arc<Mutex<Box<dyn Processor>>>,
}

/// A live pipeline built from a graph.
pub struct PipelineRuntime {
    state: RuntimeState,
    nodes: Vec<LiveNode>,
    /// Creation order; shutdown walks it in reverse.
    order: Vec<NodeId>,
    routes: HashMap<(usize, u16), Vec<(usize, u16)>>,
    /// Driven input count per node; a pass closes after that many `End`s.
    driven: Vec<u32>,
    root: Option<usize>,
    host: Option<HostBridge>,
}

impl std::fmt::Debug for PipelineRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRuntime")
            .field("state", &self.state)
            .field("order", &self.order)
            .field("driven", &self.driven)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl PipelineRuntime {
    /// Validate the graph and create every processor in dependency order.
    ///
    /// Parameter slots are resolved against the shared state of already
    /// created targets; a target that serves nothing (or the wrong kind)
    /// fails with [`Error::UnresolvedDependency`].
    pub fn initialize(
        graph: &PipelineGraph,
        provider: Arc<dyn SyncModelProvider>,
    ) -> Result<Self> {
        graph.validate()?;
        let order = graph.initialization_order()?;

        let mut slots: Vec<Option<LiveNode>> = Vec::new();
        slots.resize_with(graph.nodes().len(), || None);

        for &id in &order {
            let spec = graph.spec(id)?;
            let desc = spec.kind.descriptor();

            let mut params: HashMap<&'static str, SharedState> = HashMap::new();
            for binding in graph.params().iter().filter(|b| b.node == id) {
                let Some(param) = desc.param(&binding.slot) else {
                    return Err(Error::UnresolvedDependency {
                        node: id.0,
                        slot: binding.slot.clone(),
                    });
                };
                let shared = slots
                    .get(binding.target.index())
                    .and_then(|s| s.as_ref())
                    .and_then(|live| {
                        live.processor
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .shared_state()
                    });
                match shared {
                    Some(state) if state.kind() == param.kind => {
                        params.insert(param.name, state);
                    }
                    _ => {
                        return Err(Error::UnresolvedDependency {
                            node: id.0,
                            slot: binding.slot.clone(),
                        });
                    }
                }
            }

            let ctx = CreateContext {
                node: id,
                provider: provider.clone(),
                params: &params,
            };
            let processor = spec.kind.create(&spec.settings, &ctx)?;
            debug!(node = %id, kind = desc.type_name, "processor created");
            slots[id.index()] = Some(LiveNode {
                kind: spec.kind,
                affinity: desc.affinity,
                processor: Arc::new(Mutex::new(processor)),
            });
        }

        let mut nodes = Vec::with_capacity(slots.len());
        for (index, slot) in slots.into_iter().enumerate() {
            nodes.push(slot.ok_or_else(|| {
                Error::InvalidTopology(format!("node {index} was never created"))
            })?);
        }

        let mut routes: HashMap<(usize, u16), Vec<(usize, u16)>> = HashMap::new();
        let mut driven = vec![0u32; nodes.len()];
        for connection in graph.connections() {
            routes
                .entry((connection.from.node.index(), connection.from.port))
                .or_default()
                .push((connection.to.node.index(), connection.to.port));
            driven[connection.to.node.index()] += 1;
        }

        let root = nodes
            .iter()
            .position(|n| n.kind.descriptor().is_root);

        info!(nodes = nodes.len(), "pipeline initialized");
        Ok(Self {
            state: RuntimeState::Initialized,
            nodes,
            order,
            routes,
            driven,
            root,
            host: None,
        })
    }

    /// Register the bridge that host-affine nodes are marshaled through.
    /// Without one their calls run inline on the traversal thread.
    pub fn set_host(&mut self, bridge: HostBridge) {
        self.host = Some(bridge);
    }

    pub fn state(&self) -> RuntimeState {
        self.state
    }

    fn expect_state(&self, expected: RuntimeState) -> Result<()> {
        if self.state != expected {
            return Err(Error::InvalidState {
                expected: expected.name(),
                actual: self.state.name(),
            });
        }
        Ok(())
    }

    /// Notify every processor and start accepting refreshes.
    ///
    /// An initialization error from any processor is fatal to the run.
    pub fn run(&mut self) -> Result<()> {
        self.expect_state(RuntimeState::Initialized)?;
        for &id in &self.order {
            self.nodes[id.index()]
                .processor
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .on_pipeline_initialized()?;
        }
        self.state = RuntimeState::Running;
        info!("pipeline running");
        Ok(())
    }

    /// Run one traversal pass from the root node.
    pub fn refresh(&mut self, cancel: &CancelToken) -> Result<()> {
        self.expect_state(RuntimeState::Running)?;
        let root = self.root.ok_or(Error::InvalidState {
            expected: "a root node in the graph",
            actual: "no root node",
        })?;

        let mut queue: VecDeque<(usize, NodeCall)> = VecDeque::new();
        let mut begun = vec![false; self.nodes.len()];
        let mut ends = vec![0u32; self.nodes.len()];

        // The root originates the pass on the traversal thread.
        let emissions = {
            let mut processor = self.nodes[root]
                .processor
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let mut emitter = Emitter::new();
            let mut ctx = NodeContext {
                out: &mut emitter,
                cancel,
            };
            processor.refresh(&mut ctx)?;
            emitter.take()
        };
        for emission in emissions {
            self.route(root, emission, &mut queue);
        }

        while let Some((index, call)) = queue.pop_front() {
            cancel.check()?;
            match call {
                NodeCall::Begin(port) => {
                    // Only the first Begin of the pass opens the node; the
                    // rest of its driven inputs repeat the bracket.
                    if begun[index] {
                        continue;
                    }
                    begun[index] = true;
                    // Open downstream before anything the hook emits.
                    self.forward_framing(index, &mut queue, true);
                    match self.invoke(index, NodeCall::Begin(port), cancel) {
                        Ok(emissions) => {
                            for emission in emissions {
                                self.route(index, emission, &mut queue);
                            }
                        }
                        Err(err) => warn!(node = index, error = %err, "begin hook failed"),
                    }
                }
                NodeCall::End(port) => {
                    // Close only after every driven input has ended; queue
                    // order guarantees all events on an edge precede its End.
                    ends[index] += 1;
                    if ends[index] != self.driven[index] {
                        continue;
                    }
                    match self.invoke(index, NodeCall::End(port), cancel) {
                        Ok(emissions) => {
                            for emission in emissions {
                                self.route(index, emission, &mut queue);
                            }
                        }
                        Err(err) => warn!(node = index, error = %err, "end hook failed"),
                    }
                    self.forward_framing(index, &mut queue, false);
                }
                NodeCall::Event(port, data, event) => {
                    let key = data.key.clone();
                    match self.invoke(index, NodeCall::Event(port, data, event), cancel) {
                        Ok(emissions) => {
                            for emission in emissions {
                                self.route(index, emission, &mut queue);
                            }
                        }
                        // Isolated: the event is dropped, the pass goes on.
                        Err(Error::Cancelled) => return Err(Error::Cancelled),
                        Err(err) => {
                            warn!(node = index, key = %key, error = %err, "event dropped");
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Enqueue `Begin` (or `End`) on every connected output of a node.
    fn forward_framing(&self, index: usize, queue: &mut VecDeque<(usize, NodeCall)>, begin: bool) {
        let desc = self.nodes[index].kind.descriptor();
        for port in desc.output_indices() {
            let Some(targets) = self.routes.get(&(index, port)) else {
                continue;
            };
            for &(target, tport) in targets {
                let call = if begin {
                    NodeCall::Begin(tport)
                } else {
                    NodeCall::End(tport)
                };
                queue.push_back((target, call));
            }
        }
    }

    /// Fan an emission out to every connected input.
    fn route(&self, from: usize, emission: Emission, queue: &mut VecDeque<(usize, NodeCall)>) {
        match emission {
            Emission::Begin { port } | Emission::End { port } => {
                let is_begin = matches!(emission, Emission::Begin { .. });
                if let Some(targets) = self.routes.get(&(from, port)) {
                    for &(target, tport) in targets {
                        let call = if is_begin {
                            NodeCall::Begin(tport)
                        } else {
                            NodeCall::End(tport)
                        };
                        queue.push_back((target, call));
                    }
                }
            }
            Emission::Event { port, data, event } => {
                if let Some(targets) = self.routes.get(&(from, port)) {
                    for &(target, tport) in targets {
                        queue.push_back((target, NodeCall::Event(tport, data.clone(), event)));
                    }
                }
            }
        }
    }

    /// Run one hook, marshaling to the host when the node requires it.
    fn invoke(&self, index: usize, call: NodeCall, cancel: &CancelToken) -> Result<Vec<Emission>> {
        let node = &self.nodes[index];
        if node.affinity == ThreadAffinity::Host {
            if let Some(bridge) = &self.host {
                return bridge.dispatch(&node.processor, call, cancel);
            }
        }
        let mut processor = node.processor.lock().unwrap_or_else(|e| e.into_inner());
        let mut emitter = Emitter::new();
        let mut ctx = NodeContext {
            out: &mut emitter,
            cancel,
        };
        let result = match call {
            NodeCall::Begin(port) => {
                processor.on_begin(port, &mut ctx);
                Ok(())
            }
            NodeCall::End(port) => {
                processor.on_end(port, &mut ctx);
                Ok(())
            }
            NodeCall::Event(port, data, event) => processor.on_event(port, &data, event, &mut ctx),
        };
        result.map(|()| emitter.take())
    }

    /// Tear the pipeline down in reverse creation order.
    pub fn shutdown(&mut self) -> Result<()> {
        if !matches!(
            self.state,
            RuntimeState::Initialized | RuntimeState::Running
        ) {
            return Err(Error::InvalidState {
                expected: "initialized or running",
                actual: self.state.name(),
            });
        }
        self.state = RuntimeState::ShuttingDown;
        for &id in self.order.iter().rev() {
            self.nodes[id.index()]
                .processor
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .on_pipeline_shutdown();
        }
        self.state = RuntimeState::Terminated;
        info!("pipeline terminated");
        Ok(())
    }

    /// Read access to a processor, downcast to its concrete type.
    pub fn with_processor<T: Any, R>(&self, id: NodeId, f: impl FnOnce(&T) -> R) -> Option<R> {
        let node = self.nodes.get(id.index())?;
        let processor = node.processor.lock().unwrap_or_else(|e| e.into_inner());
        processor.as_any().downcast_ref::<T>().map(f)
    }
}

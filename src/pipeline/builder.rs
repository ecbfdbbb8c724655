//! Canonical streaming graph construction.

use crate::error::Result;
use crate::pipeline::graph::PipelineGraph;
use crate::pipeline::id::NodeId;
use crate::pipeline::node::NodeKind;

/// Node ids of the standard graph, for hosts that need direct access.
#[derive(Debug, Clone, Copy)]
pub struct StandardNodes {
    pub streamer: NodeId,
    pub instance_provider: NodeId,
    pub data_provider: NodeId,
    pub mesh_converter: NodeId,
    pub material_converter: NodeId,
    pub texture_converter: NodeId,
    pub instance_converter: NodeId,
    pub scene_sink: NodeId,
}

/// Build the full streaming topology: streamer through converters to sink.
///
/// The returned graph validates as-is; hosts that want filtering splice a
/// `MetadataFilter` between the instance converter and the sink.
pub fn standard_graph() -> Result<(PipelineGraph, StandardNodes)> {
    let mut graph = PipelineGraph::new();
    let streamer = graph.add_node(NodeKind::ProjectStreamer);
    let instance_provider = graph.add_node(NodeKind::InstanceProvider);
    let data_provider = graph.add_node(NodeKind::DataProvider);
    let mesh_converter = graph.add_node(NodeKind::MeshConverter);
    let material_converter = graph.add_node(NodeKind::MaterialConverter);
    let texture_converter = graph.add_node(NodeKind::TextureConverter);
    let instance_converter = graph.add_node(NodeKind::InstanceConverter);
    let scene_sink = graph.add_node(NodeKind::SceneSink);

    graph.connect(
        graph.output(streamer, "assets")?,
        graph.input(instance_provider, "assets")?,
    )?;
    graph.connect(
        graph.output(streamer, "assets")?,
        graph.input(data_provider, "assets")?,
    )?;
    graph.connect(
        graph.output(instance_provider, "instances")?,
        graph.input(data_provider, "instances")?,
    )?;
    graph.connect(
        graph.output(data_provider, "meshes")?,
        graph.input(mesh_converter, "meshes")?,
    )?;
    graph.connect(
        graph.output(data_provider, "materials")?,
        graph.input(material_converter, "materials")?,
    )?;
    graph.connect(
        graph.output(data_provider, "textures")?,
        graph.input(texture_converter, "textures")?,
    )?;
    graph.connect(
        graph.output(data_provider, "bundles")?,
        graph.input(instance_converter, "instances")?,
    )?;
    graph.connect(
        graph.output(instance_converter, "objects")?,
        graph.input(scene_sink, "objects")?,
    )?;

    // Artifact update channel: a converter swapping a cached artifact under
    // an unchanged owner hash announces it downstream so dependents rebuild.
    graph.connect(
        graph.output(texture_converter, "textures")?,
        graph.input(material_converter, "textures")?,
    )?;
    graph.connect(
        graph.output(mesh_converter, "meshes")?,
        graph.input(instance_converter, "meshes")?,
    )?;
    graph.connect(
        graph.output(material_converter, "materials")?,
        graph.input(instance_converter, "materials")?,
    )?;

    graph.bind_param(data_provider, "hashes", streamer)?;
    graph.bind_param(material_converter, "textures", texture_converter)?;
    graph.bind_param(instance_converter, "meshes", mesh_converter)?;
    graph.bind_param(instance_converter, "materials", material_converter)?;

    Ok((
        graph,
        StandardNodes {
            streamer,
            instance_provider,
            data_provider,
            mesh_converter,
            material_converter,
            texture_converter,
            instance_converter,
            scene_sink,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_graph_validates() {
        let (graph, nodes) = standard_graph().unwrap();
        graph.validate().unwrap();

        let order = graph.initialization_order().unwrap();
        let pos = |id: NodeId| order.iter().position(|&n| n == id).unwrap();
        // Parameter targets precede their dependents.
        assert!(pos(nodes.streamer) < pos(nodes.data_provider));
        assert!(pos(nodes.texture_converter) < pos(nodes.material_converter));
        assert!(pos(nodes.mesh_converter) < pos(nodes.instance_converter));
        assert!(pos(nodes.material_converter) < pos(nodes.instance_converter));
    }
}

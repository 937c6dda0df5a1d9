use std::fmt::{Display, Formatter};

use anyhow::Result;
use petgraph::dot::Dot;
use petgraph::graph::{EdgeReference, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Graph;

use crate::core::queue::{QueueId, QueueType};
use crate::phases::CompiledFrame;

/// Trait that is implemented for compiled frames to help with debugging and visualizing the schedule.
pub trait GraphViz {
    /// Get the string representation of this graph in `dot` format.
    fn dot(&self) -> Result<String>;
}

#[derive(Debug, Clone)]
struct VizNode {
    name: String,
    queue: QueueId,
    queue_type: QueueType,
    barriers: usize,
}

#[derive(Debug, Clone)]
enum VizEdge {
    Dependency(Vec<String>),
    Sync(u64),
}

impl Display for VizNode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n{} ({})", self.name, self.queue, self.queue_type)?;
        if self.barriers > 0 {
            write!(f, "\n{} barriers", self.barriers)?;
        }
        Ok(())
    }
}

impl Display for VizEdge {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            VizEdge::Dependency(resources) => write!(f, "{}", resources.join(", ")),
            VizEdge::Sync(value) => write!(f, "wait +{value}"),
        }
    }
}

fn node_attributes(_: &Graph<VizNode, VizEdge>, (_, node): (NodeIndex, &VizNode)) -> String {
    let color = match node.queue_type {
        QueueType::Graphics => "lightblue",
        QueueType::Compute => "palegreen",
        QueueType::Copy => "lightsalmon",
    };
    format!("shape=box style=filled fillcolor={color}")
}

fn edge_attributes(_: &Graph<VizNode, VizEdge>, edge: EdgeReference<VizEdge>) -> String {
    match edge.weight() {
        VizEdge::Dependency(_) => String::new(),
        VizEdge::Sync(_) => "color=red style=bold".to_string(),
    }
}

impl GraphViz for CompiledFrame {
    fn dot(&self) -> Result<String> {
        let mut graph = Graph::<VizNode, VizEdge>::new();
        for pass in &self.info.passes {
            graph.add_node(VizNode {
                name: pass.name.clone(),
                queue: self.schedule.queue_of(pass.id),
                queue_type: self.schedule.queue_type_of(pass.id),
                barriers: self.barriers.before_pass(pass.id).len(),
            });
        }
        for (producer, consumer, edge) in self.dependencies.edges() {
            let resources = edge
                .resources
                .iter()
                .map(|resource| self.resource_name(*resource).to_string())
                .collect::<Vec<_>>();
            graph.add_edge(
                NodeIndex::new(producer.index()),
                NodeIndex::new(consumer.index()),
                VizEdge::Dependency(resources),
            );
        }
        for point in self.sync.points() {
            graph.add_edge(
                NodeIndex::new(point.producer.index()),
                NodeIndex::new(point.consumer.index()),
                VizEdge::Sync(point.value),
            );
        }
        Ok(format!(
            "{}",
            Dot::with_attr_getters(&graph, &[], &edge_attributes, &node_attributes)
        ))
    }
}

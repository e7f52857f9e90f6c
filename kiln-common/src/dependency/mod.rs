pub mod definition;
pub mod graph;

pub use definition::{Dependency, DependencyExt, DependencyTag, RequirementKind};
pub use graph::{
    build_graph, build_graph_for_roots, node_identity, BuildGraph, BuildNode, GraphOptions,
    NodeId,
};

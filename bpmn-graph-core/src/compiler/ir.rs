//! Reachability graph view over a `ProcessDefinition` (design §9: "the
//! executor advances one token per step and relies on the graph store for
//! traversal; no recursion over the definition graph" — but the *verifier*,
//! run once at deploy time, is allowed the convenience of a real graph
//! library for its one-shot structural checks).

use crate::types::ProcessDefinition;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

/// A thin `petgraph::DiGraph` mirroring a definition's nodes/flows, built
/// purely for the verifier's reachability checks.
pub struct ReachabilityGraph {
    pub graph: DiGraph<String, ()>,
    pub index_of: HashMap<String, NodeIndex>,
}

pub fn build(defn: &ProcessDefinition) -> ReachabilityGraph {
    let mut graph = DiGraph::new();
    let mut index_of = HashMap::new();
    for node in &defn.nodes {
        let idx = graph.add_node(node.id.clone());
        index_of.insert(node.id.clone(), idx);
    }
    for flow in &defn.flows {
        if let (Some(&from), Some(&to)) = (index_of.get(&flow.source), index_of.get(&flow.target))
        {
            graph.add_edge(from, to, ());
        }
    }
    ReachabilityGraph { graph, index_of }
}

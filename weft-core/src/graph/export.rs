//! Graph export
//!
//! Introspection surfaces for tooling: a human-readable description and a
//! structured JSON export of nodes, edges, and the subgraph tree. Neither
//! evaluates anything; they render the graph exactly as it stands, dirty
//! states included.

use std::fmt::Write as _;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use crate::graph::graph::GraphContext;
use crate::graph::subgraph::TreeElement;

/// What the structured export includes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExportOptions {
    /// Render cached values through their description capability. Off by
    /// default; value rendering can be arbitrarily expensive.
    pub include_values: bool,
}

#[derive(Serialize)]
struct ExportedEdge {
    source: u64,
    ordering_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<u32>,
}

#[derive(Serialize)]
struct ExportedNode {
    id: u64,
    #[serde(rename = "type")]
    body: &'static str,
    value_type: &'static str,
    dirty: crate::graph::node::DirtyState,
    comparison: &'static str,
    external: bool,
    indirect: bool,
    subgraph: u32,
    graph: u32,
    inputs: Vec<ExportedEdge>,
    outputs: Vec<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
}

#[derive(Serialize)]
struct ExportedSubgraph {
    id: u32,
    state: crate::graph::subgraph::SubgraphState,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent: Option<u32>,
    graph: u32,
    nodes: Vec<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tree: Option<TreeElement>,
}

/// Structured export of the whole context.
pub fn export(context: &Arc<GraphContext>, options: ExportOptions) -> serde_json::Value {
    let nodes: Vec<ExportedNode> = {
        let store = context.store.read();
        store
            .iter()
            .map(|(id, node)| {
                let descriptor = context.registry.get(node.type_id);
                let value = if options.include_values {
                    match (&node.value, descriptor.value_vtable.description) {
                        (Some(value), Some(describe)) => Some(describe(value.as_ref())),
                        _ => None,
                    }
                } else {
                    None
                };
                ExportedNode {
                    id: id.raw(),
                    body: descriptor.body_name,
                    value_type: descriptor.value_vtable.type_name,
                    dirty: node.dirty,
                    comparison: node.comparison_mode().name(),
                    external: node.flags.contains(crate::graph::node::NodeFlags::EXTERNAL),
                    indirect: node.flags.contains(crate::graph::node::NodeFlags::INDIRECT),
                    subgraph: node.subgraph.raw(),
                    graph: node.graph.raw(),
                    inputs: node
                        .inputs
                        .iter()
                        .map(|e| ExportedEdge {
                            source: e.source.raw(),
                            ordering_only: e
                                .options
                                .contains(crate::graph::node::InputOptions::ORDERING_ONLY),
                            offset: e.offset,
                        })
                        .collect(),
                    outputs: node.outputs.iter().map(|o| o.raw()).collect(),
                    value,
                }
            })
            .collect()
    };

    let subgraphs: Vec<ExportedSubgraph> = {
        let table = context.subgraphs.read();
        table
            .iter()
            .map(|(id, record)| ExportedSubgraph {
                id: id.raw(),
                state: record.state,
                parent: record.parent.map(|p| p.raw()),
                graph: record.graph.raw(),
                nodes: record.nodes.iter().map(|n| n.raw()).collect(),
                tree: record.tree.clone(),
            })
            .collect()
    };

    let graphs: Vec<serde_json::Value> = {
        let graphs = context.graphs.read();
        graphs
            .iter()
            .map(|inner| {
                json!({
                    "id": inner.id.raw(),
                    "counters": inner.counters.snapshot(),
                })
            })
            .collect()
    };

    json!({
        "graphs": graphs,
        "nodes": nodes,
        "subgraphs": subgraphs,
    })
}

/// Human-readable, line-per-node description of the context.
pub fn describe(context: &Arc<GraphContext>) -> String {
    let mut out = String::new();
    {
        let store = context.store.read();
        let _ = writeln!(out, "nodes ({} live):", store.live_count());
        for (id, node) in store.iter() {
            let descriptor = context.registry.get(node.type_id);
            let _ = writeln!(
                out,
                "  #{} {} -> {} [{:?}, {}] sg={} in={} out={}",
                id.raw(),
                descriptor.body_name,
                descriptor.value_vtable.type_name,
                node.dirty,
                node.comparison_mode().name(),
                node.subgraph.raw(),
                node.inputs.len(),
                node.outputs.len(),
            );
        }
    }
    {
        let table = context.subgraphs.read();
        let _ = writeln!(out, "subgraphs:");
        for (id, record) in table.iter() {
            let _ = writeln!(
                out,
                "  sg {} {:?} graph={} nodes={} children={}",
                id.raw(),
                record.state,
                record.graph.raw(),
                record.nodes.len(),
                record.children.len(),
            );
        }
    }
    out
}

//! The attribute graph
//!
//! Everything node-shaped lives here: the arena store, subgraph lifetimes,
//! the execution context stacks, the pull evaluator, and the graph handle
//! that ties them together.

pub mod context;
pub mod export;
pub mod node;
pub mod subgraph;

pub(crate) mod evaluator;
pub(crate) mod store;

#[allow(clippy::module_inception)]
pub(crate) mod graph;

pub use evaluator::SearchOptions;
pub use export::ExportOptions;
pub use graph::{CounterSnapshot, Graph, GraphContext, GraphCounters};
pub use node::{AttributeId, DirtyState, GraphId, InputOptions, NodeFlags};
pub use subgraph::{Subgraph, SubgraphId, SubgraphState, TreeElement, TreeValue};

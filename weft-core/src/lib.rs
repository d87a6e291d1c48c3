//! Weft Core
//!
//! This crate provides the incremental computation runtime for the Weft UI
//! framework. It implements:
//!
//! - A typed attribute graph with rule-based, pull-evaluated nodes
//! - Change-gated invalidation (dependents recompute only when an input's
//!   value actually changed)
//! - Subgraph-scoped lifetimes with synchronous, cascading teardown
//! - A comparison engine with per-type modes and synthesized layouts
//! - Reference variants: indirect (retargetable), weak, and optional
//!
//! # Architecture
//!
//! - `graph`: the node arena, subgraphs, the pull evaluator, and the
//!   [`Graph`] handle
//! - `rule`: the [`Rule`] trait and the context rules read inputs through
//! - `registry`: one interned descriptor per rule type
//! - `compare`: comparison modes, the type service, and layout synthesis
//! - `attribute`: typed handles over nodes
//!
//! # Example
//!
//! ```
//! use weft_core::Graph;
//!
//! let graph = Graph::new();
//! let subgraph = graph.create_subgraph();
//!
//! let (count, doubled) = subgraph
//!     .scope(|| {
//!         let count = graph.external(1i64);
//!         let input = count.clone();
//!         let doubled = graph.computed(move |cx| cx.get(&input) * 2);
//!         (count, doubled)
//!     })
//!     .unwrap();
//!
//! assert_eq!(doubled.value(), 2);
//! count.set(5);
//! assert_eq!(doubled.value(), 10);
//! ```

pub mod attribute;
pub mod compare;
pub mod error;
pub mod graph;
pub mod profile;
pub mod registry;
pub mod rule;

pub use attribute::{
    AnyAttribute, Attribute, IndirectAttribute, OptionalAttribute, WeakAttribute,
};
pub use compare::{ComparisonMode, TypeInfoBuilder};
pub use error::GraphError;
pub use graph::{
    AttributeId, CounterSnapshot, DirtyState, ExportOptions, Graph, GraphId, InputOptions,
    SearchOptions, Subgraph, SubgraphId, SubgraphState, TreeElement, TreeValue,
};
pub use registry::{AttributeType, AttributeTypeId};
pub use rule::{GraphValue, Rule, RuleContext, RuleFlags};

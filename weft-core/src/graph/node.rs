//! Graph Nodes
//!
//! This module defines the attribute records that live in the dependency
//! graph, and the opaque handles used to address them. Node-to-node
//! references are arena indices, never pointers, so subgraph teardown can
//! invalidate in bulk without dangling references.

use std::any::Any;

use serde::Serialize;
use smallvec::SmallVec;

use crate::compare::ComparisonMode;
use crate::graph::subgraph::SubgraphId;
use crate::registry::AttributeTypeId;

/// Opaque handle for an attribute: a slot index plus a generation.
///
/// The generation is bumped each time a slot is freed, so a stale handle
/// never resolves to a recycled node. Two sentinel ids are reserved:
/// [`AttributeId::NIL`] and [`AttributeId::ROOT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct AttributeId {
    index: u32,
    generation: u32,
}

impl AttributeId {
    /// The nil sentinel; never resolves to a node.
    pub const NIL: AttributeId = AttributeId {
        index: 0,
        generation: 0,
    };

    /// The implicit root sentinel; never resolves to a node.
    pub const ROOT: AttributeId = AttributeId {
        index: 1,
        generation: 0,
    };

    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub(crate) fn index(self) -> u32 {
        self.index
    }

    pub(crate) fn generation(self) -> u32 {
        self.generation
    }

    pub fn is_nil(self) -> bool {
        self == Self::NIL
    }

    /// Raw value, stable for the node's lifetime. For diagnostics only.
    pub fn raw(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }
}

/// Identifier for a graph sharing a context. See `Graph::with_shared_context`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct GraphId(pub(crate) u32);

impl GraphId {
    pub fn raw(self) -> u32 {
        self.0
    }
}

bitflags::bitflags! {
    /// Per-node behavior flags.
    ///
    /// The low bits carry behavior markers; bits 8..=9 encode the node's
    /// comparison mode so the whole policy fits one word in the arena.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeFlags: u16 {
        /// Constant value set from outside; never recomputed by a rule.
        const EXTERNAL = 1 << 0;
        /// The rule may only be evaluated on the context's main thread.
        const MAIN_THREAD = 1 << 1;
        /// The body has a destructor hook that must run on teardown.
        const HAS_DESTRUCTOR = 1 << 2;
        /// This node forwards a swappable source (indirect attribute).
        const INDIRECT = 1 << 3;

        const COMPARISON_MODE = 0b11 << 8;
    }
}

impl NodeFlags {
    pub fn with_comparison_mode(mut self, mode: ComparisonMode) -> Self {
        self.remove(Self::COMPARISON_MODE);
        self | Self::from_bits_retain(mode.to_bits() << 8)
    }

    pub fn comparison_mode(self) -> ComparisonMode {
        ComparisonMode::from_bits((self.bits() >> 8) & 0b11)
    }
}

/// Dirty state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DirtyState {
    /// The cached value is up-to-date.
    Clean,

    /// Some transitive input changed; whether this node's direct inputs
    /// actually produced different values has not been verified yet.
    MaybeDirty,

    /// A direct input changed value (or the node was never computed);
    /// the rule must run before the next read returns.
    Dirty,
}

bitflags::bitflags! {
    /// Options carried on a dependency edge.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InputOptions: u8 {
        /// The edge may reach a node owned by another graph sharing the
        /// same context.
        const CROSS_CONTEXT = 1 << 0;
        /// Ordering-only edge: never pulled during evaluation.
        const ORDERING_ONLY = 1 << 1;
    }
}

/// A directed dependency edge from a node to one of its inputs.
#[derive(Debug, Clone, Copy)]
pub struct InputEdge {
    pub source: AttributeId,
    pub options: InputOptions,
    /// Byte offset of the sub-field the dependent reads, when it reads a
    /// portion of the producer's value without a sub-node.
    pub offset: Option<u32>,
}

/// A node in the attribute graph.
///
/// The body is the interned type's rule instance (or the external marker);
/// it is temporarily taken out of the record while its update function runs,
/// which doubles as the reentrancy guard alongside `in_progress`.
pub struct NodeRecord {
    pub type_id: AttributeTypeId,
    pub body: Option<Box<dyn Any + Send + Sync>>,
    pub value: Option<Box<dyn Any + Send + Sync>>,
    pub dirty: DirtyState,
    pub in_progress: bool,
    pub flags: NodeFlags,
    pub inputs: SmallVec<[InputEdge; 4]>,
    pub outputs: SmallVec<[AttributeId; 4]>,
    pub subgraph: SubgraphId,
    pub graph: GraphId,
    /// Current source of an indirect node, kept for introspection.
    pub indirect_source: Option<AttributeId>,
}

impl NodeRecord {
    pub fn new(
        type_id: AttributeTypeId,
        body: Box<dyn Any + Send + Sync>,
        flags: NodeFlags,
        subgraph: SubgraphId,
        graph: GraphId,
    ) -> Self {
        Self {
            type_id,
            body: Some(body),
            value: None,
            dirty: if flags.contains(NodeFlags::EXTERNAL) {
                DirtyState::Clean
            } else {
                DirtyState::Dirty
            },
            in_progress: false,
            flags,
            inputs: SmallVec::new(),
            outputs: SmallVec::new(),
            subgraph,
            graph,
            indirect_source: None,
        }
    }

    pub fn comparison_mode(&self) -> ComparisonMode {
        self.flags.comparison_mode()
    }

    /// Input edges that evaluation actually pulls (ordering edges excluded).
    pub fn pull_inputs(&self) -> impl Iterator<Item = &InputEdge> {
        self.inputs
            .iter()
            .filter(|e| !e.options.contains(InputOptions::ORDERING_ONLY))
    }
}

impl std::fmt::Debug for NodeRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRecord")
            .field("type_id", &self.type_id)
            .field("dirty", &self.dirty)
            .field("flags", &self.flags)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .field("subgraph", &self.subgraph)
            .field("graph", &self.graph)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_ids_are_distinct() {
        assert_ne!(AttributeId::NIL, AttributeId::ROOT);
        assert!(AttributeId::NIL.is_nil());
        assert!(!AttributeId::ROOT.is_nil());
    }

    #[test]
    fn comparison_mode_lives_in_flag_bits() {
        let flags = NodeFlags::EXTERNAL.with_comparison_mode(ComparisonMode::Indirect);
        assert!(flags.contains(NodeFlags::EXTERNAL));
        assert_eq!(flags.comparison_mode(), ComparisonMode::Indirect);

        let swapped = flags.with_comparison_mode(ComparisonMode::Bitwise);
        assert_eq!(swapped.comparison_mode(), ComparisonMode::Bitwise);
        assert!(swapped.contains(NodeFlags::EXTERNAL));
    }

    #[test]
    fn ordering_edges_are_not_pulled() {
        let edge = |options| InputEdge {
            source: AttributeId::ROOT,
            options,
            offset: None,
        };
        let mut record = NodeRecord::new(
            AttributeTypeId(0),
            Box::new(()),
            NodeFlags::empty(),
            SubgraphId::from_raw(0),
            GraphId(0),
        );
        record.inputs.push(edge(InputOptions::empty()));
        record.inputs.push(edge(InputOptions::ORDERING_ONLY));

        assert_eq!(record.pull_inputs().count(), 1);
    }
}

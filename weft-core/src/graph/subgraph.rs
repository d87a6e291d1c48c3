//! Subgraphs
//!
//! A subgraph is the lifetime scope for attributes. Subgraphs form a tree;
//! invalidating one synchronously destroys every node it owns (running
//! destructor hooks where declared), recurses into child subgraphs, fires
//! observers, and leaves the subgraph in the terminal `Destroyed` state.
//!
//! The state machine is `Live -> Invalidating -> Destroyed`. Operations on a
//! destroyed subgraph are reported errors, never silent no-ops.

use std::sync::Arc;

use indexmap::IndexSet;
use serde::Serialize;
use tracing::{trace, warn};

use crate::error::GraphError;
use crate::graph::context::SubgraphScope;
use crate::graph::evaluator;
use crate::graph::graph::GraphContext;
use crate::graph::node::{AttributeId, GraphId, NodeFlags};

/// Identifier for a subgraph within one graph context.
///
/// Subgraph ids are not recycled; the record survives destruction so late
/// operations can be diagnosed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SubgraphId(u32);

impl SubgraphId {
    pub(crate) fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Lifecycle state of a subgraph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SubgraphState {
    Live,
    Invalidating,
    Destroyed,
}

/// A named value attached to a debug tree element.
#[derive(Debug, Clone, Serialize)]
pub struct TreeValue {
    pub name: String,
    pub value: String,
}

/// Nested element/value records attachable to a subgraph for tooling.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TreeElement {
    pub name: String,
    pub values: Vec<TreeValue>,
    pub children: Vec<TreeElement>,
}

impl TreeElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn value(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.push(TreeValue {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn child(mut self, child: TreeElement) -> Self {
        self.children.push(child);
        self
    }
}

pub(crate) struct SubgraphRecord {
    pub state: SubgraphState,
    pub parent: Option<SubgraphId>,
    pub children: Vec<SubgraphId>,
    pub nodes: IndexSet<AttributeId>,
    pub observers: Vec<Box<dyn FnOnce() + Send + Sync>>,
    pub tree: Option<TreeElement>,
    pub graph: GraphId,
}

/// Table of subgraph records for one graph context.
pub(crate) struct SubgraphTable {
    records: Vec<SubgraphRecord>,
}

impl SubgraphTable {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    pub fn create(&mut self, parent: Option<SubgraphId>, graph: GraphId) -> SubgraphId {
        let id = SubgraphId(self.records.len() as u32);
        self.records.push(SubgraphRecord {
            state: SubgraphState::Live,
            parent,
            children: Vec::new(),
            nodes: IndexSet::new(),
            observers: Vec::new(),
            tree: None,
            graph,
        });
        if let Some(parent) = parent {
            self.records[parent.0 as usize].children.push(id);
        }
        id
    }

    pub fn get(&self, id: SubgraphId) -> Option<&SubgraphRecord> {
        self.records.get(id.0 as usize)
    }

    pub fn get_mut(&mut self, id: SubgraphId) -> Option<&mut SubgraphRecord> {
        self.records.get_mut(id.0 as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SubgraphId, &SubgraphRecord)> {
        self.records
            .iter()
            .enumerate()
            .map(|(i, r)| (SubgraphId(i as u32), r))
    }
}

/// Handle to a subgraph.
///
/// Cloning the handle does not extend the subgraph's lifetime; destruction
/// is always explicit (or driven by graph teardown).
#[derive(Clone)]
pub struct Subgraph {
    id: SubgraphId,
    context: Arc<GraphContext>,
}

impl Subgraph {
    pub(crate) fn from_parts(id: SubgraphId, context: Arc<GraphContext>) -> Self {
        Self { id, context }
    }

    pub fn id(&self) -> SubgraphId {
        self.id
    }

    pub fn state(&self) -> SubgraphState {
        self.context
            .subgraphs
            .read()
            .get(self.id)
            .map(|r| r.state)
            .unwrap_or(SubgraphState::Destroyed)
    }

    pub fn is_live(&self) -> bool {
        self.state() == SubgraphState::Live
    }

    /// The graph this subgraph belongs to.
    pub fn graph_id(&self) -> GraphId {
        self.context
            .subgraphs
            .read()
            .get(self.id)
            .map(|r| r.graph)
            .expect("subgraph record missing")
    }

    fn check_live(&self) -> Result<(), GraphError> {
        match self.state() {
            SubgraphState::Live => Ok(()),
            SubgraphState::Invalidating => {
                warn!(subgraph = self.id.raw(), "operation on invalidating subgraph");
                Err(GraphError::SubgraphInvalidating(self.id))
            }
            SubgraphState::Destroyed => {
                warn!(subgraph = self.id.raw(), "operation on destroyed subgraph");
                Err(GraphError::SubgraphDestroyed(self.id))
            }
        }
    }

    /// Create a child subgraph owned by the same graph.
    pub fn create_child(&self) -> Result<Subgraph, GraphError> {
        self.check_live()?;
        let graph = self.graph_id();
        let child = self
            .context
            .subgraphs
            .write()
            .create(Some(self.id), graph);
        self.context.graph_inner(graph).counters.subgraph_created();
        Ok(Subgraph::from_parts(child, Arc::clone(&self.context)))
    }

    /// Run `f` with this subgraph established as the current subgraph.
    ///
    /// Scopes nest: a scope entered inside another temporarily switches the
    /// current subgraph and restores the previous one on exit, even on early
    /// return or panic.
    pub fn scope<R>(&self, f: impl FnOnce() -> R) -> Result<R, GraphError> {
        self.check_live()?;
        let _guard = SubgraphScope::enter(Arc::clone(&self.context), self.id);
        Ok(f())
    }

    /// Register a callback fired when this subgraph is invalidated.
    pub fn add_observer(
        &self,
        observer: impl FnOnce() + Send + Sync + 'static,
    ) -> Result<(), GraphError> {
        self.check_live()?;
        let mut table = self.context.subgraphs.write();
        match table.get_mut(self.id) {
            Some(record) if record.state == SubgraphState::Live => {
                record.observers.push(Box::new(observer));
                Ok(())
            }
            _ => Err(GraphError::SubgraphDestroyed(self.id)),
        }
    }

    /// Attach a debug tree for introspection tooling.
    pub fn set_tree(&self, tree: TreeElement) -> Result<(), GraphError> {
        self.check_live()?;
        if let Some(record) = self.context.subgraphs.write().get_mut(self.id) {
            record.tree = Some(tree);
        }
        Ok(())
    }

    pub fn tree(&self) -> Option<TreeElement> {
        self.context
            .subgraphs
            .read()
            .get(self.id)
            .and_then(|r| r.tree.clone())
    }

    /// Ids of the live nodes this subgraph currently owns.
    pub fn nodes(&self) -> Vec<AttributeId> {
        self.context
            .subgraphs
            .read()
            .get(self.id)
            .map(|r| r.nodes.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Invalidate this subgraph: destroy its nodes, recurse into children,
    /// fire observers, and transition to `Destroyed`.
    pub fn invalidate(&self) -> Result<(), GraphError> {
        invalidate_subgraph(&self.context, self.id)
    }
}

impl std::fmt::Debug for Subgraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subgraph")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Core invalidation cascade. Runs synchronously.
pub(crate) fn invalidate_subgraph(
    context: &Arc<GraphContext>,
    id: SubgraphId,
) -> Result<(), GraphError> {
    let (children, nodes, observers, graph) = {
        let mut table = context.subgraphs.write();
        let record = match table.get_mut(id) {
            Some(record) => record,
            None => return Err(GraphError::SubgraphDestroyed(id)),
        };
        match record.state {
            SubgraphState::Destroyed => {
                warn!(subgraph = id.raw(), "invalidate on destroyed subgraph");
                return Err(GraphError::SubgraphDestroyed(id));
            }
            SubgraphState::Invalidating => {
                return Err(GraphError::SubgraphInvalidating(id));
            }
            SubgraphState::Live => {}
        }
        record.state = SubgraphState::Invalidating;
        (
            record.children.clone(),
            std::mem::take(&mut record.nodes),
            std::mem::take(&mut record.observers),
            record.graph,
        )
    };

    trace!(subgraph = id.raw(), nodes = nodes.len(), "invalidating subgraph");

    // Destroy owned nodes. The freed records are dropped only after the
    // store lock is released: destructor hooks (the body's Drop) may read
    // the graph, weak reads included.
    let freed: Vec<(AttributeId, crate::graph::node::NodeRecord)> = {
        let mut store = context.store.write();
        nodes
            .iter()
            .filter_map(|node| {
                evaluator::detach_node(&mut store, *node);
                store.free(*node).map(|record| (*node, record))
            })
            .collect()
    };
    for (node, record) in freed {
        let owner = context.graph_inner(record.graph);
        owner.counters.node_destroyed();
        if record.flags.contains(NodeFlags::HAS_DESTRUCTOR) {
            trace!(node = node.raw(), ty = record.type_id.raw(), "running destructor hook");
        }
        drop(record);
    }

    // Child scopes die with their parent.
    for child in children {
        // A child already mid-teardown is fine; everything else cascades.
        let _ = invalidate_subgraph(context, child);
    }

    for observer in observers {
        observer();
    }
    context.graph_inner(graph).fire_invalidation(id);

    {
        let mut table = context.subgraphs.write();
        let parent = table.get(id).and_then(|r| r.parent);
        if let Some(parent) = parent {
            if let Some(parent_record) = table.get_mut(parent) {
                parent_record.children.retain(|c| *c != id);
            }
        }
        if let Some(record) = table.get_mut(id) {
            record.state = SubgraphState::Destroyed;
        }
    }
    context.graph_inner(graph).counters.subgraph_destroyed();
    Ok(())
}

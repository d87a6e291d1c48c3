//! Evaluator
//!
//! Pull-based memoized evaluation with change-gated propagation.
//!
//! # Algorithm
//!
//! Reading an attribute pulls it up to date:
//!
//! 1. A `Clean` node returns its cached value; the rule never re-runs.
//!
//! 2. A `MaybeDirty` node pulls each of its inputs first. Only if one of
//!    them actually changed value (promoting this node to `Dirty`) does the
//!    rule run; otherwise the node is marked clean without recomputing.
//!
//! 3. A `Dirty` node runs its interned update function against its body.
//!    The body re-reads its inputs (recursively evaluating them and
//!    re-registering edges) and publishes the result.
//!
//! After a recompute, the new value is compared against the cached one under
//! the node's comparison mode. Only on inequality are direct dependents
//! marked `Dirty` (and their transitive dependents `MaybeDirty`). This gate
//! is what keeps an unchanged intermediate value from cascading
//! recomputation through the whole graph.
//!
//! Cycles are programmer errors: each node carries an in-progress marker and
//! re-entry fails fast.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::trace;

use crate::compare::compare_values;
use crate::error::fatal;
use crate::graph::context::{AttributeScope, SubgraphScope};
use crate::graph::graph::GraphContext;
use crate::graph::node::{AttributeId, DirtyState, InputEdge, InputOptions, NodeFlags};
use crate::graph::store::NodeStore;
use crate::rule::GraphValue;

bitflags::bitflags! {
    /// Direction and scope options for [`breadth_first_search`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SearchOptions: u8 {
        /// Traverse input edges (towards dependencies).
        const SEARCH_INPUTS = 1 << 0;
        /// Traverse output edges (towards dependents).
        const SEARCH_OUTPUTS = 1 << 1;
        /// Visit nodes owned by other graphs sharing the context.
        const TRAVERSE_CONTEXTS = 1 << 2;
    }
}

/// Whether `id` currently resolves to a live node.
pub(crate) fn is_alive(context: &Arc<GraphContext>, id: AttributeId) -> bool {
    context.store.read().contains(id)
}

fn check_thread(context: &GraphContext, id: AttributeId, flags: NodeFlags) {
    if flags.contains(NodeFlags::MAIN_THREAD)
        && std::thread::current().id() != context.main_thread
    {
        fatal!(
            "attribute {:?} is main-thread-only and was touched off the main thread",
            id
        );
    }
}

/// Bring `id` up to date.
pub(crate) fn evaluate(context: &Arc<GraphContext>, id: AttributeId) {
    let (dirty, flags) = {
        let store = context.store.read();
        let Some(node) = store.get(id) else {
            fatal!("evaluation of dead attribute {:?}", id);
        };
        if node.in_progress {
            fatal!("cyclic dependency detected at attribute {:?}", id);
        }
        (node.dirty, node.flags)
    };
    check_thread(context, id, flags);

    match dirty {
        DirtyState::Clean => {}
        DirtyState::MaybeDirty => {
            // Pull inputs first; a changed input promotes this node to
            // Dirty through publish().
            let inputs: Vec<AttributeId> = {
                let store = context.store.read();
                store
                    .get(id)
                    .map(|node| node.pull_inputs().map(|e| e.source).collect())
                    .unwrap_or_default()
            };
            for input in inputs {
                evaluate(context, input);
            }

            let promoted = {
                let mut store = context.store.write();
                let Some(node) = store.get_mut(id) else {
                    fatal!("attribute {:?} freed while being evaluated", id);
                };
                if node.dirty == DirtyState::Dirty {
                    true
                } else {
                    // Early cutoff: no input actually changed.
                    node.dirty = DirtyState::Clean;
                    false
                }
            };
            if promoted {
                recompute(context, id);
            } else {
                trace!(node = id.raw(), "maybe-dirty resolved without recompute");
            }
        }
        DirtyState::Dirty => recompute(context, id),
    }
}

fn recompute(context: &Arc<GraphContext>, id: AttributeId) {
    let (mut body, type_id, subgraph, graph) = {
        let mut store = context.store.write();
        let Some(node) = store.get_mut(id) else {
            fatal!("recompute of dead attribute {:?}", id);
        };
        if node.in_progress {
            fatal!("cyclic dependency detected at attribute {:?}", id);
        }
        node.in_progress = true;
        let Some(body) = node.body.take() else {
            fatal!("attribute {:?} has no body", id);
        };
        (body, node.type_id, node.subgraph, node.graph)
    };

    let descriptor = context.registry.get(type_id);
    context.graph_inner(graph).counters.update();
    trace!(node = id.raw(), body = descriptor.body_name, "updating attribute");

    // The rule runs with this attribute current and its subgraph
    // established, so nested reads attribute their edges correctly and
    // nested node creation lands in the right scope.
    {
        let _attribute = AttributeScope::enter(id);
        let _subgraph = SubgraphScope::enter(Arc::clone(context), subgraph);
        (descriptor.update)(body.as_mut(), id, context);
    }

    let mut store = context.store.write();
    if let Some(node) = store.get_mut(id) {
        node.body = Some(body);
        node.in_progress = false;
        node.dirty = DirtyState::Clean;
    }
}

/// Publish a recomputed value for `id` (the "set output value" call).
///
/// Compares against the cached value under the node's mode; dependents are
/// only invalidated when the value actually changed.
pub(crate) fn publish<T: GraphValue>(context: &Arc<GraphContext>, id: AttributeId, value: T) {
    let descriptor = {
        let store = context.store.read();
        let Some(node) = store.get(id) else {
            fatal!("publish to dead attribute {:?}", id);
        };
        context.registry.get(node.type_id)
    };
    if descriptor.value_vtable.type_id != std::any::TypeId::of::<T>() {
        fatal!(
            "value type mismatch publishing to attribute {:?}: expected {}, got {}",
            id,
            descriptor.value_vtable.type_name,
            std::any::type_name::<T>()
        );
    }

    let new: Box<dyn std::any::Any + Send + Sync> = Box::new(value);
    let (changed, graph) = {
        let mut store = context.store.write();
        let Some(node) = store.get_mut(id) else {
            return;
        };
        let mode = node.comparison_mode();
        let changed = match &node.value {
            None => true,
            Some(old) => !compare_values(old.as_ref(), new.as_ref(), &descriptor.value_vtable, mode),
        };
        node.value = Some(new);
        let graph = node.graph;
        if changed {
            let outputs: SmallVec<[AttributeId; 4]> = node.outputs.clone();
            for output in outputs {
                mark_dirty(&mut store, output);
            }
        }
        (changed, graph)
    };
    if changed {
        context.graph_inner(graph).counters.change();
        trace!(node = id.raw(), "value changed, dependents invalidated");
    }
}

/// Write an external attribute's value.
///
/// A write that compares equal under the node's mode is a no-op for
/// propagation: the slot is refreshed but nothing is marked dirty and no
/// transaction is counted.
pub(crate) fn set_external<T: GraphValue>(context: &Arc<GraphContext>, id: AttributeId, value: T) {
    let (flags, type_id) = {
        let store = context.store.read();
        let Some(node) = store.get(id) else {
            fatal!("write to dead attribute {:?}", id);
        };
        (node.flags, node.type_id)
    };
    if !flags.contains(NodeFlags::EXTERNAL) {
        fatal!("attribute {:?} is rule-backed; only external attributes accept writes", id);
    }
    check_thread(context, id, flags);

    let descriptor = context.registry.get(type_id);
    if descriptor.value_vtable.type_id != std::any::TypeId::of::<T>() {
        fatal!(
            "value type mismatch writing attribute {:?}: expected {}, got {}",
            id,
            descriptor.value_vtable.type_name,
            std::any::type_name::<T>()
        );
    }

    let new: Box<dyn std::any::Any + Send + Sync> = Box::new(value);
    let (changed, graph) = {
        let mut store = context.store.write();
        let Some(node) = store.get_mut(id) else {
            fatal!("write to dead attribute {:?}", id);
        };
        let mode = node.comparison_mode();
        let changed = match &node.value {
            None => true,
            Some(old) => !compare_values(old.as_ref(), new.as_ref(), &descriptor.value_vtable, mode),
        };
        node.value = Some(new);
        let graph = node.graph;
        if changed {
            let outputs: SmallVec<[AttributeId; 4]> = node.outputs.clone();
            for output in outputs {
                mark_dirty(&mut store, output);
            }
        }
        (changed, graph)
    };

    if changed {
        let inner = context.graph_inner(graph);
        inner.counters.change();
        inner.counters.transaction();
        inner.fire_update();
    }
}

/// Evaluate and read a value, with fatal type checking.
pub(crate) fn read_value<T: GraphValue>(context: &Arc<GraphContext>, id: AttributeId) -> T {
    if !is_alive(context, id) {
        fatal!("read of dead attribute {:?}", id);
    }
    evaluate(context, id);
    let store = context.store.read();
    let Some(node) = store.get(id) else {
        fatal!("read of dead attribute {:?}", id);
    };
    let Some(value) = node.value.as_ref() else {
        fatal!("attribute {:?} has no value after evaluation", id);
    };
    match value.downcast_ref::<T>() {
        Some(value) => value.clone(),
        None => fatal!(
            "value type mismatch reading attribute {:?}: expected {}",
            id,
            std::any::type_name::<T>()
        ),
    }
}

/// Evaluate and read, yielding `None` for dead attributes (weak reads).
pub(crate) fn try_read_value<T: GraphValue>(
    context: &Arc<GraphContext>,
    id: AttributeId,
) -> Option<T> {
    if !is_alive(context, id) {
        return None;
    }
    evaluate(context, id);
    let store = context.store.read();
    let node = store.get(id)?;
    node.value.as_ref()?.downcast_ref::<T>().cloned()
}

/// Create (or refresh) a directed dependency edge from `node` to `source`.
pub(crate) fn add_input(
    context: &Arc<GraphContext>,
    node: AttributeId,
    source: AttributeId,
    options: InputOptions,
    offset: Option<u32>,
) {
    if node == source {
        fatal!("attribute {:?} cannot depend on itself", node);
    }
    let mut store = context.store.write();
    let source_graph = match store.get(source) {
        Some(record) => record.graph,
        None => fatal!("input edge to dead attribute {:?}", source),
    };
    let Some(record) = store.get_mut(node) else {
        fatal!("input edge from dead attribute {:?}", node);
    };
    if record.graph != source_graph && !options.contains(InputOptions::CROSS_CONTEXT) {
        fatal!(
            "edge from {:?} to {:?} crosses graph contexts without CROSS_CONTEXT",
            node,
            source
        );
    }
    if let Some(edge) = record
        .inputs
        .iter_mut()
        .find(|e| e.source == source && e.offset == offset)
    {
        edge.options |= options;
        return;
    }
    record.inputs.push(InputEdge {
        source,
        options,
        offset,
    });
    let source_record = store.get_mut(source).expect("source checked above");
    if !source_record.outputs.contains(&node) {
        source_record.outputs.push(node);
    }
}

/// Mark `id` dirty and its transitive dependents maybe-dirty.
pub(crate) fn mark_dirty(store: &mut NodeStore, id: AttributeId) {
    let outputs: SmallVec<[AttributeId; 4]> = match store.get_mut(id) {
        Some(node) => {
            if node.dirty == DirtyState::Dirty {
                return;
            }
            node.dirty = DirtyState::Dirty;
            node.outputs.clone()
        }
        None => return,
    };

    let mut queue: VecDeque<AttributeId> = outputs.into_iter().collect();
    while let Some(next) = queue.pop_front() {
        if let Some(node) = store.get_mut(next) {
            if node.dirty != DirtyState::Clean {
                continue;
            }
            node.dirty = DirtyState::MaybeDirty;
            queue.extend(node.outputs.iter().copied());
        }
    }
}

/// Remove all edges touching `id` and invalidate its former dependents.
/// Used during subgraph teardown, before the node is freed.
pub(crate) fn detach_node(store: &mut NodeStore, id: AttributeId) {
    let (inputs, outputs) = match store.get(id) {
        Some(node) => (
            node.inputs
                .iter()
                .map(|e| e.source)
                .collect::<Vec<AttributeId>>(),
            node.outputs.to_vec(),
        ),
        None => return,
    };
    for source in inputs {
        if let Some(record) = store.get_mut(source) {
            record.outputs.retain(|o| *o != id);
        }
    }
    for dependent in &outputs {
        if let Some(record) = store.get_mut(*dependent) {
            record.inputs.retain(|e| e.source != id);
        }
    }
    for dependent in outputs {
        mark_dirty(store, dependent);
    }
}

/// Breadth-first search over dependency edges.
///
/// Visits `start` first, then neighbors along the selected directions,
/// short-circuiting as soon as `predicate` returns true. With neither
/// direction option set, only the start node is tested. Nodes owned by
/// other graphs in a shared context are skipped unless
/// [`SearchOptions::TRAVERSE_CONTEXTS`] is set.
pub(crate) fn breadth_first_search(
    context: &Arc<GraphContext>,
    start: AttributeId,
    options: SearchOptions,
    mut predicate: impl FnMut(AttributeId) -> bool,
) -> bool {
    let start_graph = match context.store.read().get(start) {
        Some(node) => node.graph,
        None => return false,
    };

    let mut visited: HashSet<AttributeId> = HashSet::new();
    let mut queue: VecDeque<AttributeId> = VecDeque::new();
    queue.push_back(start);

    while let Some(id) = queue.pop_front() {
        if !visited.insert(id) {
            continue;
        }
        // Adjacency is snapshotted per node and the lock released before
        // the predicate runs, so predicates may themselves read the graph.
        let neighbors = {
            let store = context.store.read();
            let Some(node) = store.get(id) else {
                continue;
            };
            if node.graph != start_graph && !options.contains(SearchOptions::TRAVERSE_CONTEXTS) {
                continue;
            }
            let mut neighbors: Vec<AttributeId> = Vec::new();
            if options.contains(SearchOptions::SEARCH_INPUTS) {
                neighbors.extend(node.inputs.iter().map(|e| e.source));
            }
            if options.contains(SearchOptions::SEARCH_OUTPUTS) {
                neighbors.extend(node.outputs.iter().copied());
            }
            neighbors
        };
        if predicate(id) {
            return true;
        }
        queue.extend(neighbors);
    }
    false
}

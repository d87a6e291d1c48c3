//! Graph
//!
//! A [`Graph`] is the top-level handle: it creates subgraphs, creates
//! attributes inside the current subgraph scope, exposes counters, and hosts
//! the update/invalidation callbacks. Several `Graph` instances may share
//! one [`GraphContext`] (one node arena, one subgraph table, one type
//! registry); cross-graph visibility is opt-in per search or edge. That is
//! the only sanctioned form of structure sharing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::attribute::{Attribute, IndirectAttribute};
use crate::error::fatal;
use crate::graph::context::{self, DeadlineScope};
use crate::graph::evaluator::{self, SearchOptions};
use crate::graph::node::{AttributeId, GraphId, InputOptions, NodeRecord};
use crate::graph::store::NodeStore;
use crate::graph::subgraph::{self, Subgraph, SubgraphId, SubgraphState, SubgraphTable};
use crate::registry::Registry;
use crate::rule::{ClosureRule, ExternalBody, GraphValue, IndirectRule, Rule, RuleContext};

/// Monotonic counters exposed per graph.
#[derive(Default)]
pub struct GraphCounters {
    nodes_created: AtomicU64,
    nodes_live: AtomicU64,
    subgraphs_created: AtomicU64,
    subgraphs_live: AtomicU64,
    updates: AtomicU64,
    changes: AtomicU64,
    transactions: AtomicU64,
}

/// Point-in-time view of a graph's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub nodes_created: u64,
    pub nodes_live: u64,
    pub subgraphs_created: u64,
    pub subgraphs_live: u64,
    /// Rule invocations.
    pub updates: u64,
    /// Recomputations whose value actually changed.
    pub changes: u64,
    /// External writes that changed a value.
    pub transactions: u64,
}

impl GraphCounters {
    pub(crate) fn node_created(&self) {
        self.nodes_created.fetch_add(1, Ordering::Relaxed);
        self.nodes_live.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn node_destroyed(&self) {
        self.nodes_live.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn subgraph_created(&self) {
        self.subgraphs_created.fetch_add(1, Ordering::Relaxed);
        self.subgraphs_live.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn subgraph_destroyed(&self) {
        self.subgraphs_live.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn update(&self) {
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn change(&self) {
        self.changes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn transaction(&self) {
        self.transactions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            nodes_created: self.nodes_created.load(Ordering::Relaxed),
            nodes_live: self.nodes_live.load(Ordering::Relaxed),
            subgraphs_created: self.subgraphs_created.load(Ordering::Relaxed),
            subgraphs_live: self.subgraphs_live.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            changes: self.changes.load(Ordering::Relaxed),
            transactions: self.transactions.load(Ordering::Relaxed),
        }
    }
}

/// Per-graph state: counters plus host callbacks.
pub(crate) struct GraphInner {
    pub id: GraphId,
    pub counters: GraphCounters,
    update_callback: Mutex<Option<Box<dyn Fn() + Send>>>,
    invalidation_callback: Mutex<Option<Box<dyn Fn(SubgraphId) + Send>>>,
}

impl GraphInner {
    fn new(id: GraphId) -> Self {
        Self {
            id,
            counters: GraphCounters::default(),
            update_callback: Mutex::new(None),
            invalidation_callback: Mutex::new(None),
        }
    }

    pub(crate) fn fire_update(&self) {
        let callback = self.update_callback.lock();
        if let Some(callback) = callback.as_ref() {
            callback();
        }
    }

    pub(crate) fn fire_invalidation(&self, subgraph: SubgraphId) {
        let callback = self.invalidation_callback.lock();
        if let Some(callback) = callback.as_ref() {
            callback(subgraph);
        }
    }
}

/// Shared state behind one or more graphs.
pub struct GraphContext {
    pub(crate) store: RwLock<NodeStore>,
    pub(crate) subgraphs: RwLock<SubgraphTable>,
    pub(crate) registry: Registry,
    pub(crate) graphs: RwLock<Vec<Arc<GraphInner>>>,
    /// Thread the context was created on; `MAIN_THREAD` nodes are pinned
    /// to it.
    pub(crate) main_thread: ThreadId,
}

impl GraphContext {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            store: RwLock::new(NodeStore::new()),
            subgraphs: RwLock::new(SubgraphTable::new()),
            registry: Registry::new(),
            graphs: RwLock::new(Vec::new()),
            main_thread: std::thread::current().id(),
        })
    }

    fn register_graph(self: &Arc<Self>) -> Arc<GraphInner> {
        let mut graphs = self.graphs.write();
        let inner = Arc::new(GraphInner::new(GraphId(graphs.len() as u32)));
        graphs.push(Arc::clone(&inner));
        inner
    }

    pub(crate) fn graph_inner(&self, id: GraphId) -> Arc<GraphInner> {
        let graphs = self.graphs.read();
        Arc::clone(&graphs[id.0 as usize])
    }
}

/// Handle to one graph within a context.
pub struct Graph {
    context: Arc<GraphContext>,
    inner: Arc<GraphInner>,
}

impl Clone for Graph {
    fn clone(&self) -> Self {
        Self {
            context: Arc::clone(&self.context),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Graph {
    /// Create a graph with a fresh context.
    pub fn new() -> Self {
        let context = GraphContext::new();
        let inner = context.register_graph();
        Self { context, inner }
    }

    /// Create an independent graph sharing `other`'s context.
    ///
    /// Nodes created under either graph live in the same arena; searches and
    /// edges only reach across with explicit cross-context options.
    pub fn with_shared_context(other: &Graph) -> Self {
        let context = Arc::clone(&other.context);
        let inner = context.register_graph();
        Self { context, inner }
    }

    pub fn id(&self) -> GraphId {
        self.inner.id
    }

    pub(crate) fn context_arc(&self) -> Arc<GraphContext> {
        Arc::clone(&self.context)
    }

    /// Create a root subgraph owned by this graph.
    pub fn create_subgraph(&self) -> Subgraph {
        let id = self.context.subgraphs.write().create(None, self.inner.id);
        self.inner.counters.subgraph_created();
        Subgraph::from_parts(id, Arc::clone(&self.context))
    }

    fn create_node(
        &self,
        type_id: crate::registry::AttributeTypeId,
        body: Box<dyn std::any::Any + Send + Sync>,
    ) -> AttributeId {
        let Some((context, subgraph)) = context::current_subgraph() else {
            fatal!("attribute creation requires an established subgraph scope");
        };
        if !Arc::ptr_eq(&context, &self.context) {
            fatal!("current subgraph belongs to a different graph context");
        }

        let descriptor = self.context.registry.get(type_id);
        let (graph, state) = {
            let table = self.context.subgraphs.read();
            let record = table.get(subgraph).expect("current subgraph record missing");
            (record.graph, record.state)
        };
        if state != SubgraphState::Live {
            fatal!(
                "attribute creation in non-live subgraph {:?}",
                subgraph
            );
        }

        let record = NodeRecord::new(type_id, body, descriptor.flags, subgraph, graph);
        let id = self.context.store.write().allocate(record);
        if let Some(owner) = self.context.subgraphs.write().get_mut(subgraph) {
            owner.nodes.insert(id);
        }
        self.context.graph_inner(graph).counters.node_created();
        id
    }

    /// Create an external (constant) attribute holding `value`.
    pub fn external<T: GraphValue>(&self, value: T) -> Attribute<T> {
        let type_id = self.context.registry.intern_external::<T>();
        let id = self.create_node(type_id, Box::new(ExternalBody::<T>::new()));
        self.context
            .store
            .write()
            .get_mut(id)
            .expect("freshly allocated node")
            .value = Some(Box::new(value));
        Attribute::from_parts(id, Arc::clone(&self.context))
    }

    /// Create a rule-backed attribute.
    pub fn attribute<R: Rule>(&self, rule: R) -> Attribute<R::Value> {
        let type_id = self.context.registry.intern_rule::<R>();
        let id = self.create_node(type_id, Box::new(rule));
        Attribute::from_parts(id, Arc::clone(&self.context))
    }

    /// Create a rule-backed attribute from a closure.
    pub fn computed<T, F>(&self, compute: F) -> Attribute<T>
    where
        T: GraphValue,
        F: FnMut(&mut RuleContext<'_>) -> T + Send + Sync + 'static,
    {
        self.attribute(ClosureRule::new(compute))
    }

    /// Create an indirect attribute initially forwarding `source`.
    pub fn indirect<T: GraphValue>(&self, source: &Attribute<T>) -> IndirectAttribute<T> {
        let type_id = self.context.registry.intern_rule::<IndirectRule<T>>();
        let id = self.create_node(type_id, Box::new(IndirectRule::<T>::new()));
        {
            let mut store = self.context.store.write();
            let node = store.get_mut(id).expect("freshly allocated node");
            node.flags |= crate::graph::node::NodeFlags::INDIRECT;
            node.indirect_source = Some(source.id());
        }
        evaluator::add_input(&self.context, id, source.id(), InputOptions::empty(), None);
        IndirectAttribute::from_parts(
            Attribute::from_parts(id, Arc::clone(&self.context)),
            source.id(),
        )
    }

    /// This graph's counters.
    pub fn counters(&self) -> CounterSnapshot {
        self.inner.counters.snapshot()
    }

    /// Callback fired when an external write changes a value in this graph.
    pub fn set_update_callback(&self, callback: impl Fn() + Send + 'static) {
        *self.inner.update_callback.lock() = Some(Box::new(callback));
    }

    /// Callback fired when one of this graph's subgraphs is invalidated.
    pub fn set_invalidation_callback(&self, callback: impl Fn(SubgraphId) + Send + 'static) {
        *self.inner.invalidation_callback.lock() = Some(Box::new(callback));
    }

    /// Run `f` with an advisory evaluation deadline established.
    pub fn with_deadline<R>(&self, deadline: Instant, f: impl FnOnce() -> R) -> R {
        let _guard = DeadlineScope::enter(deadline);
        f()
    }

    /// The innermost advisory deadline on this thread, if any.
    pub fn deadline(&self) -> Option<Instant> {
        context::current_deadline()
    }

    /// Breadth-first search over dependency edges from `start`.
    pub fn breadth_first_search(
        &self,
        start: AttributeId,
        options: SearchOptions,
        predicate: impl FnMut(AttributeId) -> bool,
    ) -> bool {
        evaluator::breadth_first_search(&self.context, start, options, predicate)
    }

    /// Textual description of the graph state.
    pub fn describe(&self) -> String {
        crate::graph::export::describe(&self.context)
    }

    /// Structured (JSON) export of the graph state.
    pub fn export(&self, options: crate::graph::export::ExportOptions) -> serde_json::Value {
        crate::graph::export::export(&self.context, options)
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Graph {
    fn drop(&mut self) {
        // Last handle for this graph id: tear down its root subgraphs so
        // node destructor hooks run deterministically.
        if Arc::strong_count(&self.inner) > 2 {
            return;
        }
        // One reference is ours, one is the context's registry entry; any
        // further clone keeps the graph alive.
        let roots: Vec<SubgraphId> = {
            let table = self.context.subgraphs.read();
            table
                .iter()
                .filter(|(_, record)| {
                    record.graph == self.inner.id
                        && record.parent.is_none()
                        && record.state == SubgraphState::Live
                })
                .map(|(id, _)| id)
                .collect()
        };
        for root in roots {
            let _ = subgraph::invalidate_subgraph(&self.context, root);
        }
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counters = self.counters();
        f.debug_struct("Graph")
            .field("id", &self.inner.id)
            .field("nodes_live", &counters.nodes_live)
            .field("subgraphs_live", &counters.subgraphs_live)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_nodes_and_subgraphs() {
        let graph = Graph::new();
        let subgraph = graph.create_subgraph();

        subgraph
            .scope(|| {
                graph.external(1u32);
                graph.external(2u32);
            })
            .unwrap();

        let counters = graph.counters();
        assert_eq!(counters.nodes_created, 2);
        assert_eq!(counters.nodes_live, 2);
        assert_eq!(counters.subgraphs_created, 1);
        assert_eq!(counters.subgraphs_live, 1);

        subgraph.invalidate().unwrap();
        let counters = graph.counters();
        assert_eq!(counters.nodes_live, 0);
        assert_eq!(counters.subgraphs_live, 0);
        assert_eq!(counters.nodes_created, 2);
    }

    #[test]
    fn graph_is_shareable_across_threads() {
        let graph = Graph::new();
        let subgraph = graph.create_subgraph();

        let (a, b) = subgraph
            .scope(|| {
                let a = graph.external(1i64);
                let input = a.clone();
                let b = graph.computed(move |cx| cx.get(&input) * 2);
                (a, b)
            })
            .unwrap();
        assert_eq!(b.value(), 2);

        // Handles move to a worker; writes and reads work there.
        let worker = std::thread::spawn(move || {
            a.set(5);
            b.value()
        });
        assert_eq!(worker.join().unwrap(), 10);
    }

    #[test]
    fn shared_context_graphs_have_distinct_ids() {
        let first = Graph::new();
        let second = Graph::with_shared_context(&first);
        assert_ne!(first.id(), second.id());
    }

    #[test]
    #[should_panic(expected = "established subgraph")]
    fn attribute_creation_outside_scope_is_fatal() {
        let graph = Graph::new();
        graph.external(1u32);
    }

    #[test]
    fn deadline_is_scoped() {
        let graph = Graph::new();
        assert!(graph.deadline().is_none());
        let deadline = Instant::now() + std::time::Duration::from_millis(10);
        graph.with_deadline(deadline, || {
            assert_eq!(graph.deadline(), Some(deadline));
        });
        assert!(graph.deadline().is_none());
    }

    #[test]
    fn update_callback_fires_on_changing_write() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let graph = Graph::new();
        let subgraph = graph.create_subgraph();
        let fired = std::sync::Arc::new(AtomicUsize::new(0));
        let fired_clone = std::sync::Arc::clone(&fired);
        graph.set_update_callback(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        let a = subgraph.scope(|| graph.external(1u32)).unwrap();
        a.set(2);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Unchanged write: no update notification.
        a.set(2);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}

//! Execution Context
//!
//! The engine relies on implicit per-thread context: which subgraph new
//! nodes join, which attribute is currently being updated, and the advisory
//! evaluation deadline. Each is a thread-local stack with a scoped guard
//! that restores the previous value on drop, so nested scopes compose and
//! early exits (including panics) unwind correctly. None of it is untracked
//! global state.

use std::cell::RefCell;
use std::sync::Arc;
use std::time::Instant;

use crate::graph::graph::GraphContext;
use crate::graph::node::AttributeId;
use crate::graph::subgraph::SubgraphId;

thread_local! {
    static SUBGRAPH_STACK: RefCell<Vec<(Arc<GraphContext>, SubgraphId)>> =
        const { RefCell::new(Vec::new()) };
    static ATTRIBUTE_STACK: RefCell<Vec<AttributeId>> = const { RefCell::new(Vec::new()) };
    static DEADLINE_STACK: RefCell<Vec<Instant>> = const { RefCell::new(Vec::new()) };
}

/// Guard establishing the current subgraph for node creation.
pub struct SubgraphScope {
    subgraph: SubgraphId,
}

impl SubgraphScope {
    pub fn enter(context: Arc<GraphContext>, subgraph: SubgraphId) -> Self {
        SUBGRAPH_STACK.with(|stack| stack.borrow_mut().push((context, subgraph)));
        Self { subgraph }
    }
}

impl Drop for SubgraphScope {
    fn drop(&mut self) {
        SUBGRAPH_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();
            if let Some((_, subgraph)) = popped {
                debug_assert_eq!(
                    subgraph, self.subgraph,
                    "subgraph scope mismatch: expected {:?}, got {:?}",
                    self.subgraph, subgraph
                );
            }
        });
    }
}

/// The subgraph new nodes would currently join, if any.
pub fn current_subgraph() -> Option<(Arc<GraphContext>, SubgraphId)> {
    SUBGRAPH_STACK.with(|stack| {
        stack
            .borrow()
            .last()
            .map(|(context, subgraph)| (Arc::clone(context), *subgraph))
    })
}

/// Guard marking the attribute currently being updated.
pub struct AttributeScope {
    attribute: AttributeId,
}

impl AttributeScope {
    pub fn enter(attribute: AttributeId) -> Self {
        ATTRIBUTE_STACK.with(|stack| stack.borrow_mut().push(attribute));
        Self { attribute }
    }
}

impl Drop for AttributeScope {
    fn drop(&mut self) {
        ATTRIBUTE_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();
            if let Some(attribute) = popped {
                debug_assert_eq!(
                    attribute, self.attribute,
                    "attribute scope mismatch: expected {:?}, got {:?}",
                    self.attribute, attribute
                );
            }
        });
    }
}

/// The attribute currently being updated on this thread, if any.
pub fn current_attribute() -> Option<AttributeId> {
    ATTRIBUTE_STACK.with(|stack| stack.borrow().last().copied())
}

/// Guard threading an advisory evaluation deadline.
pub struct DeadlineScope {
    deadline: Instant,
}

impl DeadlineScope {
    pub fn enter(deadline: Instant) -> Self {
        DEADLINE_STACK.with(|stack| stack.borrow_mut().push(deadline));
        Self { deadline }
    }
}

impl Drop for DeadlineScope {
    fn drop(&mut self) {
        DEADLINE_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();
            if let Some(deadline) = popped {
                debug_assert_eq!(deadline, self.deadline, "deadline scope mismatch");
            }
        });
    }
}

/// The innermost advisory deadline, if one is established.
///
/// Purely cooperative: rules may consult it to cut long incremental passes
/// short; the engine never preempts.
pub fn current_deadline() -> Option<Instant> {
    DEADLINE_STACK.with(|stack| stack.borrow().last().copied())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use std::time::Duration;

    #[test]
    fn subgraph_scope_nests_and_restores() {
        let graph = Graph::new();
        let outer = graph.create_subgraph();
        let inner = graph.create_subgraph();

        assert!(current_subgraph().is_none());
        {
            let _outer = SubgraphScope::enter(graph.context_arc(), outer.id());
            assert_eq!(current_subgraph().unwrap().1, outer.id());
            {
                let _inner = SubgraphScope::enter(graph.context_arc(), inner.id());
                assert_eq!(current_subgraph().unwrap().1, inner.id());
            }
            assert_eq!(current_subgraph().unwrap().1, outer.id());
        }
        assert!(current_subgraph().is_none());
    }

    #[test]
    fn attribute_scope_tracks_innermost() {
        assert!(current_attribute().is_none());
        let _a = AttributeScope::enter(AttributeId::ROOT);
        assert_eq!(current_attribute(), Some(AttributeId::ROOT));
        {
            let _b = AttributeScope::enter(AttributeId::NIL);
            assert_eq!(current_attribute(), Some(AttributeId::NIL));
        }
        assert_eq!(current_attribute(), Some(AttributeId::ROOT));
    }

    #[test]
    fn deadline_scope_restores_on_early_return() {
        fn inner(deadline: Instant) -> Option<Instant> {
            let _scope = DeadlineScope::enter(deadline);
            // Early return still unwinds the guard.
            current_deadline()
        }

        assert!(current_deadline().is_none());
        let deadline = Instant::now() + Duration::from_millis(5);
        assert_eq!(inner(deadline), Some(deadline));
        assert!(current_deadline().is_none());
    }
}

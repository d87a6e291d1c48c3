//! Attribute handles
//!
//! Typed handles over graph nodes. An [`Attribute`] is the strong,
//! always-valid handle: reading one pulls it up to date and reading a dead
//! one is a programmer error. A [`WeakAttribute`] tolerates its target's
//! subgraph being torn down and reads as `None` afterwards. An
//! [`IndirectAttribute`] adds a retargetable source on top of a plain
//! attribute, and an [`OptionalAttribute`] is a slot that may hold no
//! attribute at all.
//!
//! Handles are ids plus a context reference; they do not keep the node
//! alive. Lifetime belongs to the owning subgraph.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{fatal, GraphError};
use crate::graph::evaluator;
use crate::graph::graph::GraphContext;
use crate::graph::node::{AttributeId, InputOptions};
use crate::rule::GraphValue;

/// Typed handle to a live attribute.
pub struct Attribute<T> {
    id: AttributeId,
    context: Arc<GraphContext>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Attribute<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            context: Arc::clone(&self.context),
            _marker: PhantomData,
        }
    }
}

impl<T: GraphValue> Attribute<T> {
    pub(crate) fn from_parts(id: AttributeId, context: Arc<GraphContext>) -> Self {
        Self {
            id,
            context,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> AttributeId {
        self.id
    }

    pub(crate) fn context_arc(&self) -> Arc<GraphContext> {
        Arc::clone(&self.context)
    }

    /// Read the current value, evaluating if needed.
    ///
    /// Outside a rule this is a plain pull; inside a rule, prefer
    /// `RuleContext::get`, which also records the dependency edge.
    pub fn value(&self) -> T {
        evaluator::read_value::<T>(&self.context, self.id)
    }

    /// Fallible read: reports instead of aborting when the node is gone.
    pub fn try_value(&self) -> Result<T, GraphError> {
        evaluator::try_read_value::<T>(&self.context, self.id)
            .ok_or(GraphError::DeadAttribute(self.id))
    }

    /// Write the value. Only valid for external attributes; a write that
    /// compares equal to the cached value propagates nothing.
    pub fn set(&self, value: T) {
        evaluator::set_external::<T>(&self.context, self.id, value);
    }

    /// Whether the underlying node is still live.
    pub fn is_alive(&self) -> bool {
        evaluator::is_alive(&self.context, self.id)
    }

    /// A weak handle that reads as `None` after teardown.
    pub fn downgrade(&self) -> WeakAttribute<T> {
        WeakAttribute {
            id: self.id,
            context: Arc::clone(&self.context),
            _marker: PhantomData,
        }
    }

    /// Erase the value type.
    pub fn erase(&self) -> AnyAttribute {
        AnyAttribute {
            id: self.id,
            context: Arc::clone(&self.context),
        }
    }
}

impl<T> std::fmt::Debug for Attribute<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Attribute").field(&self.id).finish()
    }
}

impl<T> PartialEq for Attribute<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.context, &other.context)
    }
}

impl<T> Eq for Attribute<T> {}

/// Untyped attribute handle, for heterogeneous collections and searches.
#[derive(Clone)]
pub struct AnyAttribute {
    id: AttributeId,
    context: Arc<GraphContext>,
}

impl AnyAttribute {
    pub fn id(&self) -> AttributeId {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        evaluator::is_alive(&self.context, self.id)
    }

    /// Recover the typed handle. Fatal if `T` is not the node's value type.
    pub fn downcast<T: GraphValue>(&self) -> Attribute<T> {
        {
            let store = self.context.store.read();
            let Some(node) = store.get(self.id) else {
                fatal!("downcast of dead attribute {:?}", self.id);
            };
            let descriptor = self.context.registry.get(node.type_id);
            if descriptor.value_vtable.type_id != std::any::TypeId::of::<T>() {
                fatal!(
                    "attribute {:?} holds {}, not {}",
                    self.id,
                    descriptor.value_vtable.type_name,
                    std::any::type_name::<T>()
                );
            }
        }
        Attribute::from_parts(self.id, Arc::clone(&self.context))
    }
}

impl std::fmt::Debug for AnyAttribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AnyAttribute").field(&self.id).finish()
    }
}

/// Weak handle: survives the target's teardown, reading as absent.
pub struct WeakAttribute<T> {
    id: AttributeId,
    context: Arc<GraphContext>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for WeakAttribute<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            context: Arc::clone(&self.context),
            _marker: PhantomData,
        }
    }
}

impl<T: GraphValue> WeakAttribute<T> {
    pub fn id(&self) -> AttributeId {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        evaluator::is_alive(&self.context, self.id)
    }

    /// Read the value, or `None` once the target's subgraph was invalidated.
    pub fn value(&self) -> Option<T> {
        evaluator::try_read_value::<T>(&self.context, self.id)
    }

    /// Recover a strong handle while the target is still live.
    pub fn upgrade(&self) -> Option<Attribute<T>> {
        if self.is_alive() {
            Some(Attribute::from_parts(self.id, Arc::clone(&self.context)))
        } else {
            None
        }
    }
}

impl<T> std::fmt::Debug for WeakAttribute<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("WeakAttribute").field(&self.id).finish()
    }
}

/// Retargetable forwarding attribute.
///
/// Reads forward to the current source. Retargeting marks the node dirty,
/// so dependents observe the new source's value on their next pull. The
/// source present at creation is remembered for [`Self::reset_source`].
pub struct IndirectAttribute<T> {
    attribute: Attribute<T>,
    original: AttributeId,
}

impl<T: GraphValue> IndirectAttribute<T> {
    pub(crate) fn from_parts(attribute: Attribute<T>, original: AttributeId) -> Self {
        Self {
            attribute,
            original,
        }
    }

    pub fn id(&self) -> AttributeId {
        self.attribute.id()
    }

    /// Read through the current source.
    pub fn value(&self) -> T {
        self.attribute.value()
    }

    /// The attribute currently forwarded to.
    pub fn source(&self) -> AttributeId {
        let context = self.attribute.context_arc();
        let store = context.store.read();
        match store.get(self.attribute.id()) {
            Some(node) => match node.indirect_source {
                Some(source) => source,
                None => fatal!("indirect attribute {:?} lost its source", self.attribute.id()),
            },
            None => fatal!("source query on dead attribute {:?}", self.attribute.id()),
        }
    }

    /// Retarget to `source`. Dependents see the change on their next read.
    pub fn set_source(&self, source: &Attribute<T>) {
        self.retarget(source.id());
    }

    /// Restore the source this attribute was created with.
    pub fn reset_source(&self) {
        self.retarget(self.original);
    }

    fn retarget(&self, source: AttributeId) {
        let context = self.attribute.context_arc();
        let id = self.attribute.id();
        if !evaluator::is_alive(&context, source) {
            fatal!("indirect attribute {:?} retargeted to dead attribute {:?}", id, source);
        }
        {
            let mut store = context.store.write();
            let Some(node) = store.get_mut(id) else {
                fatal!("retarget of dead attribute {:?}", id);
            };
            if node.indirect_source == Some(source) {
                return;
            }
            node.indirect_source = Some(source);
            // Drop the old pulled edge; ordering-only edges stay.
            let stale: Vec<AttributeId> = node
                .inputs
                .iter()
                .filter(|e| !e.options.contains(InputOptions::ORDERING_ONLY) && e.source != source)
                .map(|e| e.source)
                .collect();
            node.inputs
                .retain(|e| e.options.contains(InputOptions::ORDERING_ONLY) || e.source == source);
            for old in stale {
                if let Some(record) = store.get_mut(old) {
                    record.outputs.retain(|o| *o != id);
                }
            }
            evaluator::mark_dirty(&mut store, id);
        }
        evaluator::add_input(&context, id, source, InputOptions::empty(), None);
    }

    /// Add an ordering-only edge: evaluation of `before` is sequenced ahead
    /// of this attribute without its value being pulled.
    pub fn add_ordering_dependency(&self, before: AttributeId) {
        let context = self.attribute.context_arc();
        evaluator::add_input(
            &context,
            self.attribute.id(),
            before,
            InputOptions::ORDERING_ONLY,
            None,
        );
    }
}

impl<T> std::fmt::Debug for IndirectAttribute<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("IndirectAttribute")
            .field(&self.attribute.id)
            .finish()
    }
}

enum OptionalSlot<T> {
    Empty,
    Strong(Attribute<T>),
    Weak(WeakAttribute<T>),
}

/// A slot that may hold a strong handle, a weak handle, or nothing.
///
/// A weak-backed slot behaves like an empty one once its target's subgraph
/// is invalidated.
pub struct OptionalAttribute<T> {
    inner: OptionalSlot<T>,
}

impl<T: GraphValue> OptionalAttribute<T> {
    pub fn empty() -> Self {
        Self {
            inner: OptionalSlot::Empty,
        }
    }

    pub fn of(attribute: Attribute<T>) -> Self {
        Self {
            inner: OptionalSlot::Strong(attribute),
        }
    }

    pub fn weak(attribute: WeakAttribute<T>) -> Self {
        Self {
            inner: OptionalSlot::Weak(attribute),
        }
    }

    /// Whether a read would find nothing: no handle, or a dead weak target.
    pub fn is_empty(&self) -> bool {
        match &self.inner {
            OptionalSlot::Empty => true,
            OptionalSlot::Strong(_) => false,
            OptionalSlot::Weak(weak) => !weak.is_alive(),
        }
    }

    /// The strong handle, if the slot holds one.
    pub fn attribute(&self) -> Option<&Attribute<T>> {
        match &self.inner {
            OptionalSlot::Strong(attribute) => Some(attribute),
            _ => None,
        }
    }

    /// Read through the slot: `None` when empty or the weak target is gone.
    pub fn value(&self) -> Option<T> {
        match &self.inner {
            OptionalSlot::Empty => None,
            OptionalSlot::Strong(attribute) => Some(attribute.value()),
            OptionalSlot::Weak(weak) => weak.value(),
        }
    }

    pub fn set(&mut self, attribute: Attribute<T>) {
        self.inner = OptionalSlot::Strong(attribute);
    }

    pub fn set_weak(&mut self, attribute: WeakAttribute<T>) {
        self.inner = OptionalSlot::Weak(attribute);
    }

    pub fn clear(&mut self) {
        self.inner = OptionalSlot::Empty;
    }
}

impl<T: GraphValue> Default for OptionalAttribute<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: GraphValue> From<Option<Attribute<T>>> for OptionalAttribute<T> {
    fn from(inner: Option<Attribute<T>>) -> Self {
        match inner {
            Some(attribute) => Self::of(attribute),
            None => Self::empty(),
        }
    }
}

impl<T: GraphValue> From<WeakAttribute<T>> for OptionalAttribute<T> {
    fn from(weak: WeakAttribute<T>) -> Self {
        Self::weak(weak)
    }
}

impl<T> std::fmt::Debug for OptionalAttribute<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            OptionalSlot::Empty => f.write_str("OptionalAttribute(empty)"),
            OptionalSlot::Strong(attribute) => f
                .debug_tuple("OptionalAttribute")
                .field(&attribute.id)
                .finish(),
            OptionalSlot::Weak(weak) => f
                .debug_tuple("OptionalAttribute::weak")
                .field(&weak.id)
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;

    #[test]
    fn weak_reads_none_after_invalidation() {
        let graph = Graph::new();
        let subgraph = graph.create_subgraph();
        let a = subgraph.scope(|| graph.external(7u32)).unwrap();
        let weak = a.downgrade();

        assert_eq!(weak.value(), Some(7));
        assert!(weak.upgrade().is_some());

        subgraph.invalidate().unwrap();
        assert!(!weak.is_alive());
        assert_eq!(weak.value(), None);
        assert!(weak.upgrade().is_none());
        assert_eq!(a.try_value(), Err(GraphError::DeadAttribute(a.id())));
    }

    #[test]
    fn indirect_forwards_and_retargets() {
        let graph = Graph::new();
        let subgraph = graph.create_subgraph();

        let (first, second, indirect) = subgraph
            .scope(|| {
                let first = graph.external(1u32);
                let second = graph.external(2u32);
                let indirect = graph.indirect(&first);
                (first, second, indirect)
            })
            .unwrap();

        assert_eq!(indirect.value(), 1);
        assert_eq!(indirect.source(), first.id());

        indirect.set_source(&second);
        assert_eq!(indirect.value(), 2);
        assert_eq!(indirect.source(), second.id());

        indirect.reset_source();
        assert_eq!(indirect.value(), 1);
        assert_eq!(indirect.source(), first.id());
    }

    #[test]
    fn retarget_invalidates_dependents() {
        let graph = Graph::new();
        let subgraph = graph.create_subgraph();

        let (second, indirect, doubled) = subgraph
            .scope(|| {
                let first = graph.external(10u32);
                let second = graph.external(20u32);
                let indirect = graph.indirect(&first);
                let through = indirect.id();
                let context = first.context_arc();
                let doubled = graph.computed(move |cx| {
                    cx.add_input(through, InputOptions::empty(), None);
                    evaluator::read_value::<u32>(&context, through) * 2
                });
                (second, indirect, doubled)
            })
            .unwrap();

        assert_eq!(doubled.value(), 20);
        indirect.set_source(&second);
        assert_eq!(doubled.value(), 40);
    }

    #[test]
    fn optional_slot_reads_none_when_empty() {
        let graph = Graph::new();
        let subgraph = graph.create_subgraph();

        let mut slot: OptionalAttribute<u32> = OptionalAttribute::empty();
        assert!(slot.is_empty());
        assert_eq!(slot.value(), None);

        let a = subgraph.scope(|| graph.external(5u32)).unwrap();
        slot.set(a);
        assert_eq!(slot.value(), Some(5));

        slot.clear();
        assert_eq!(slot.value(), None);
    }

    #[test]
    fn weak_backed_optional_goes_absent_on_teardown() {
        let graph = Graph::new();
        let subgraph = graph.create_subgraph();
        let a = subgraph.scope(|| graph.external(9u32)).unwrap();

        let slot = OptionalAttribute::weak(a.downgrade());
        assert!(!slot.is_empty());
        assert_eq!(slot.value(), Some(9));
        // A weak-backed slot does not hand out a strong handle.
        assert!(slot.attribute().is_none());

        subgraph.invalidate().unwrap();
        assert!(slot.is_empty());
        assert_eq!(slot.value(), None);
    }

    #[test]
    fn handle_debug_formats_name_the_variant() {
        let graph = Graph::new();
        let subgraph = graph.create_subgraph();

        let (indirect, slot) = subgraph
            .scope(|| {
                let a = graph.external(1u32);
                (graph.indirect(&a), OptionalAttribute::of(a))
            })
            .unwrap();

        assert!(format!("{indirect:?}").starts_with("IndirectAttribute"));
        assert!(format!("{slot:?}").starts_with("OptionalAttribute"));
        assert_eq!(
            format!("{:?}", OptionalAttribute::<u32>::empty()),
            "OptionalAttribute(empty)"
        );
    }

    #[test]
    fn erased_handle_round_trips() {
        let graph = Graph::new();
        let subgraph = graph.create_subgraph();
        let a = subgraph.scope(|| graph.external(3i64)).unwrap();

        let any = a.erase();
        assert_eq!(any.id(), a.id());
        assert_eq!(any.downcast::<i64>().value(), 3);
    }

    #[test]
    #[should_panic(expected = "holds")]
    fn downcast_to_wrong_type_is_fatal() {
        let graph = Graph::new();
        let subgraph = graph.create_subgraph();
        let a = subgraph.scope(|| graph.external(3i64)).unwrap();
        a.erase().downcast::<u8>();
    }
}

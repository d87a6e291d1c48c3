//! Rules
//!
//! A rule is caller-supplied logic that computes an attribute's value from
//! its declared inputs. Rules read inputs through a [`RuleContext`], which
//! records the dependency edge and recursively pulls the input up to date
//! before handing the value back.
//!
//! Implement [`Rule`] directly for bodies with declared traits (main-thread
//! affinity, destructor hooks, a non-default comparison mode), or use
//! `Graph::computed` with a closure for the common case.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use crate::attribute::{Attribute, WeakAttribute};
use crate::compare::ComparisonMode;
use crate::error::fatal;
use crate::graph::context;
use crate::graph::evaluator;
use crate::graph::graph::GraphContext;
use crate::graph::node::{AttributeId, InputOptions};

/// Bounds every graph value must satisfy.
///
/// `PartialEq` backs the dynamic equality capability, `Debug` the
/// description capability, and `Clone` lets reads hand out owned values.
/// Values live inside the context's shared store, so they must be
/// shareable across threads.
pub trait GraphValue: Clone + PartialEq + std::fmt::Debug + Send + Sync + 'static {}

impl<T: Clone + PartialEq + std::fmt::Debug + Send + Sync + 'static> GraphValue for T {}

bitflags::bitflags! {
    /// Traits a rule declares for every node of its type.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RuleFlags: u8 {
        /// Nodes of this type may only be evaluated on the context's main
        /// thread.
        const MAIN_THREAD = 1 << 0;
        /// The body has a meaningful `Drop` that must run on teardown.
        const HAS_DESTRUCTOR = 1 << 1;
    }
}

/// Caller-supplied computation for one attribute type.
///
/// Bodies are stored in the context's shared node store, so they carry the
/// same shareability bounds as values.
pub trait Rule: Send + Sync + 'static {
    type Value: GraphValue;

    /// Compute the value. Inputs read through `cx` become dependency edges.
    fn compute(&mut self, cx: &mut RuleContext<'_>) -> Self::Value;

    /// Declared traits, merged into every node's flags.
    fn flags() -> RuleFlags {
        RuleFlags::empty()
    }

    /// How recomputed values are compared against the cached one.
    fn comparison_mode() -> ComparisonMode {
        ComparisonMode::default()
    }
}

/// Marker body for external (constant) attributes.
///
/// Externals never compute; the marker only gives the registry a distinct
/// body type identity per value type.
pub struct ExternalBody<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> ExternalBody<T> {
    pub(crate) fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

/// Adapter letting a closure serve as a rule body.
///
/// Each closure has its own type, so each call site interns its own
/// attribute type descriptor, exactly as a named rule would.
pub struct ClosureRule<F, T> {
    compute: F,
    _marker: PhantomData<fn() -> T>,
}

impl<F, T> ClosureRule<F, T> {
    pub(crate) fn new(compute: F) -> Self {
        Self {
            compute,
            _marker: PhantomData,
        }
    }
}

impl<F, T> Rule for ClosureRule<F, T>
where
    F: FnMut(&mut RuleContext<'_>) -> T + Send + Sync + 'static,
    T: GraphValue,
{
    type Value = T;

    fn compute(&mut self, cx: &mut RuleContext<'_>) -> T {
        (self.compute)(cx)
    }
}

/// Body of an indirect attribute: forwards its single pulled input.
pub(crate) struct IndirectRule<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> IndirectRule<T> {
    pub(crate) fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T: GraphValue> Rule for IndirectRule<T> {
    type Value = T;

    fn compute(&mut self, cx: &mut RuleContext<'_>) -> T {
        let source = match cx.input_source(0) {
            Some(source) => source,
            None => fatal!(
                "indirect attribute {:?} has no source edge",
                cx.attribute()
            ),
        };
        cx.read_source(source)
    }
}

/// Evaluation-scoped view handed to a rule while it computes.
///
/// Holds the identity of the attribute being updated; reads through it
/// create (or refresh) dependency edges from that attribute.
pub struct RuleContext<'a> {
    context: &'a Arc<GraphContext>,
    attribute: AttributeId,
}

impl<'a> RuleContext<'a> {
    pub(crate) fn new(context: &'a Arc<GraphContext>, attribute: AttributeId) -> Self {
        Self { context, attribute }
    }

    /// The attribute currently being updated.
    pub fn attribute(&self) -> AttributeId {
        self.attribute
    }

    /// Read an input, recording the dependency edge.
    pub fn get<T: GraphValue>(&mut self, input: &Attribute<T>) -> T {
        self.get_with(input, InputOptions::empty(), None)
    }

    /// Read an input with explicit edge options and sub-field offset.
    pub fn get_with<T: GraphValue>(
        &mut self,
        input: &Attribute<T>,
        options: InputOptions,
        offset: Option<u32>,
    ) -> T {
        evaluator::add_input(self.context, self.attribute, input.id(), options, offset);
        evaluator::read_value::<T>(self.context, input.id())
    }

    /// Read a weak input. Absent once the target's subgraph was invalidated;
    /// a live read records the edge like [`Self::get`].
    pub fn get_weak<T: GraphValue>(&mut self, input: &WeakAttribute<T>) -> Option<T> {
        let id = input.id();
        if !evaluator::is_alive(self.context, id) {
            return None;
        }
        evaluator::add_input(
            self.context,
            self.attribute,
            id,
            InputOptions::empty(),
            None,
        );
        evaluator::try_read_value::<T>(self.context, id)
    }

    /// Record a dependency edge without reading through it.
    pub fn add_input(&mut self, source: AttributeId, options: InputOptions, offset: Option<u32>) {
        evaluator::add_input(self.context, self.attribute, source, options, offset);
    }

    /// The advisory evaluation deadline, if one is established.
    pub fn deadline(&self) -> Option<Instant> {
        context::current_deadline()
    }

    /// Source of the nth pulled input edge of the updating attribute.
    pub(crate) fn input_source(&self, n: usize) -> Option<AttributeId> {
        let store = self.context.store.read();
        let node = store.get(self.attribute)?;
        // Bound so the edge iterator dies before the store guard does.
        let source = node.pull_inputs().nth(n).map(|edge| edge.source);
        source
    }

    /// Read a source by id over an already-present edge.
    pub(crate) fn read_source<T: GraphValue>(&mut self, source: AttributeId) -> T {
        evaluator::read_value::<T>(self.context, source)
    }
}

impl<T> std::fmt::Debug for ExternalBody<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ExternalBody")
    }
}

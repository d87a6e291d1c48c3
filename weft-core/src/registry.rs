//! Type Registry
//!
//! One [`AttributeType`] descriptor exists per distinct rule (body) type,
//! keyed by the body's type identity. The first node created for a body type
//! builds the descriptor (update shim, flags, comparison mode, value
//! vtable); every later node reuses it. Interning is safe under concurrent
//! first use: at most one factory invocation per type, and readers never
//! observe a partially built descriptor.

use std::any::{Any, TypeId};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::trace;

use crate::compare::{layout_options, prefetch_layout, LayoutOptions, ValueVTable};
use crate::graph::graph::GraphContext;
use crate::graph::node::{AttributeId, NodeFlags};
use crate::rule::{GraphValue, Rule, RuleFlags};

/// Handle to an interned attribute type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct AttributeTypeId(pub(crate) u32);

impl AttributeTypeId {
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Update function: computes and publishes the node's value from its body.
pub(crate) type UpdateFn = fn(&mut (dyn Any + Send + Sync), AttributeId, &Arc<GraphContext>);

/// Interned descriptor for one body type.
pub struct AttributeType {
    pub id: AttributeTypeId,
    pub body_type: TypeId,
    pub body_name: &'static str,
    pub value_vtable: ValueVTable,
    pub(crate) update: UpdateFn,
    /// Flags merged from the rule's declared traits plus the comparison
    /// mode bits; copied onto each node of this type at creation.
    pub flags: NodeFlags,
}

impl std::fmt::Debug for AttributeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttributeType")
            .field("id", &self.id)
            .field("body", &self.body_name)
            .field("value", &self.value_vtable.type_name)
            .field("flags", &self.flags)
            .finish()
    }
}

/// Per-context intern table.
pub struct Registry {
    by_body: DashMap<TypeId, AttributeTypeId>,
    types: RwLock<Vec<Arc<AttributeType>>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            by_body: DashMap::new(),
            types: RwLock::new(Vec::new()),
        }
    }

    /// Intern the descriptor for rule type `R`, building it on first use.
    pub fn intern_rule<R: Rule>(&self) -> AttributeTypeId {
        self.intern_with(TypeId::of::<R>(), || {
            (
                std::any::type_name::<R>(),
                ValueVTable::of::<R::Value>(),
                update_shim::<R> as UpdateFn,
                node_flags(R::flags(), R::comparison_mode()),
            )
        })
    }

    /// Intern the descriptor for an external (constant) value of type `T`.
    pub fn intern_external<T: GraphValue>(&self) -> AttributeTypeId {
        self.intern_with(TypeId::of::<crate::rule::ExternalBody<T>>(), || {
            (
                std::any::type_name::<crate::rule::ExternalBody<T>>(),
                ValueVTable::of::<T>(),
                external_shim as UpdateFn,
                node_flags(RuleFlags::empty(), Default::default()) | NodeFlags::EXTERNAL,
            )
        })
    }

    fn intern_with(
        &self,
        body_type: TypeId,
        factory: impl FnOnce() -> (&'static str, ValueVTable, UpdateFn, NodeFlags),
    ) -> AttributeTypeId {
        if let Some(found) = self.by_body.get(&body_type) {
            return *found;
        }
        // The entry lock makes this a single-winner initialization: a second
        // thread racing on the same body type blocks here and then takes the
        // early return inside or_insert_with's absence check.
        *self.by_body.entry(body_type).or_insert_with(|| {
            let (body_name, value_vtable, update, flags) = factory();
            let mut types = self.types.write();
            let id = AttributeTypeId(types.len() as u32);
            trace!(body = body_name, id = id.raw(), "interned attribute type");
            types.push(Arc::new(AttributeType {
                id,
                body_type,
                body_name,
                value_vtable: value_vtable.clone(),
                update,
                flags,
            }));
            drop(types);
            if layout_options().contains(LayoutOptions::PREFETCH) {
                let _ = prefetch_layout(value_vtable.type_id);
            }
            id
        })
    }

    /// Descriptor lookup; interned ids are never removed.
    pub fn get(&self, id: AttributeTypeId) -> Arc<AttributeType> {
        let types = self.types.read();
        Arc::clone(&types[id.0 as usize])
    }

    pub fn len(&self) -> usize {
        self.types.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn node_flags(rule_flags: RuleFlags, mode: crate::compare::ComparisonMode) -> NodeFlags {
    let mut flags = NodeFlags::empty();
    if rule_flags.contains(RuleFlags::MAIN_THREAD) {
        flags |= NodeFlags::MAIN_THREAD;
    }
    if rule_flags.contains(RuleFlags::HAS_DESTRUCTOR) {
        flags |= NodeFlags::HAS_DESTRUCTOR;
    }
    flags.with_comparison_mode(mode)
}

/// Monomorphized update entry point for rule type `R`.
fn update_shim<R: Rule>(
    body: &mut (dyn Any + Send + Sync),
    attribute: AttributeId,
    context: &Arc<GraphContext>,
) {
    let rule = match body.downcast_mut::<R>() {
        Some(rule) => rule,
        None => crate::error::fatal!(
            "body type mismatch while updating attribute {:?}: expected {}",
            attribute,
            std::any::type_name::<R>()
        ),
    };
    let mut cx = crate::rule::RuleContext::new(context, attribute);
    let value = rule.compute(&mut cx);
    crate::graph::evaluator::publish::<R::Value>(context, attribute, value);
}

/// External nodes hold constants; their update function must never run.
fn external_shim(
    _body: &mut (dyn Any + Send + Sync),
    attribute: AttributeId,
    _context: &Arc<GraphContext>,
) {
    crate::error::fatal!("external attribute {:?} has no update function", attribute);
}

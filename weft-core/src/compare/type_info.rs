//! Type service boundary.
//!
//! The comparison engine needs to know, for an arbitrary value type, its
//! identity, size, field breakdown, and which capabilities (equality,
//! description) it supports. Rust has no runtime reflection, so this module
//! is the explicit registration surface standing in for one: callers describe
//! their types once with [`TypeInfoBuilder`] and the layout engine consumes
//! the descriptors.
//!
//! Registration is optional. Unregistered types still work everywhere; they
//! are simply treated as opaque (not trivially comparable, no synthesized
//! layout).

use std::any::{Any, TypeId};
use std::collections::HashSet;
use std::mem;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;

/// Equality witness over type-erased values.
pub type EqFn = fn(&(dyn Any + Send + Sync), &(dyn Any + Send + Sync)) -> bool;

/// Description witness over type-erased values.
pub type DescribeFn = fn(&(dyn Any + Send + Sync)) -> String;

/// What a field contributes to comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Plain bytes: compared bitwise.
    Primitive,
    /// A composite whose own descriptor (if registered) drives comparison.
    Nested(TypeId),
    /// A heap-boxed or handle-like field: identity comparison only.
    Indirect,
    /// An existential or function capture: identity comparison only.
    Existential,
}

/// One stored field of a registered type.
#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub name: &'static str,
    pub offset: usize,
    pub len: usize,
    pub kind: FieldKind,
}

/// One payload case of a registered enum.
#[derive(Debug, Clone)]
pub struct EnumCase {
    pub tag: u64,
    pub name: &'static str,
    pub fields: Vec<FieldInfo>,
}

/// Tag location and per-case payloads for a registered enum.
#[derive(Debug, Clone)]
pub struct EnumInfo {
    pub tag_offset: usize,
    pub tag_len: usize,
    pub cases: Vec<EnumCase>,
}

/// Registered metadata for one value type.
#[derive(Debug)]
pub struct TypeDescriptor {
    pub type_id: TypeId,
    pub type_name: &'static str,
    pub size: usize,
    pub fields: Vec<FieldInfo>,
    pub cases: Option<EnumInfo>,
    pub equality: Option<EqFn>,
    pub description: Option<DescribeFn>,
}

/// A capability a type may expose through its descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Equatable,
    Describable,
}

bitflags::bitflags! {
    /// Options for [`TypeService::for_each_field`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FieldOptions: u8 {
        /// Also enumerate enum payload cases (flattened, per case).
        const INCLUDE_ENUM_CASES = 1 << 0;
    }
}

/// Process-wide registry of type descriptors.
pub struct TypeService {
    descriptors: DashMap<TypeId, Arc<TypeDescriptor>>,
}

static SERVICE: OnceLock<TypeService> = OnceLock::new();

/// The shared type service instance.
pub fn service() -> &'static TypeService {
    SERVICE.get_or_init(|| TypeService {
        descriptors: DashMap::new(),
    })
}

impl TypeService {
    /// Identity for a concrete type.
    pub fn identity<T: 'static>() -> TypeId {
        TypeId::of::<T>()
    }

    /// Stored size for a registered type, if known.
    pub fn size(&self, ty: TypeId) -> Option<usize> {
        self.descriptors.get(&ty).map(|d| d.size)
    }

    /// Look up a registered descriptor.
    pub fn descriptor(&self, ty: TypeId) -> Option<Arc<TypeDescriptor>> {
        self.descriptors.get(&ty).map(|d| Arc::clone(&d))
    }

    /// Visit each stored field of a registered type.
    ///
    /// Returns whether the type supported the requested enumeration: `false`
    /// for unregistered types, and for `INCLUDE_ENUM_CASES` on a type with
    /// no registered cases.
    pub fn for_each_field(
        &self,
        ty: TypeId,
        options: FieldOptions,
        mut visitor: impl FnMut(&FieldInfo),
    ) -> bool {
        let Some(desc) = self.descriptor(ty) else {
            return false;
        };
        for field in &desc.fields {
            visitor(field);
        }
        if options.contains(FieldOptions::INCLUDE_ENUM_CASES) {
            let Some(cases) = &desc.cases else {
                return false;
            };
            for case in &cases.cases {
                for field in &case.fields {
                    visitor(field);
                }
            }
        }
        true
    }

    /// Capability dispatch: equality witness, if the type declared one.
    pub fn equality(&self, ty: TypeId) -> Option<EqFn> {
        self.descriptor(ty).and_then(|d| d.equality)
    }

    /// Capability dispatch: description witness, if the type declared one.
    pub fn description(&self, ty: TypeId) -> Option<DescribeFn> {
        self.descriptor(ty).and_then(|d| d.description)
    }

    /// Whether a capability is present for a type.
    pub fn capability(&self, ty: TypeId, cap: Capability) -> bool {
        match cap {
            Capability::Equatable => self.equality(ty).is_some(),
            Capability::Describable => self.description(ty).is_some(),
        }
    }

    /// Whether a type is provably trivially comparable: registered, and no
    /// indirect/existential field transitively.
    ///
    /// `None` means unknown (unregistered somewhere in the chain); callers
    /// must treat that as "not trivial".
    pub fn is_trivially_comparable(&self, ty: TypeId) -> Option<bool> {
        let mut visiting = HashSet::new();
        self.trivial_inner(ty, &mut visiting)
    }

    fn trivial_inner(&self, ty: TypeId, visiting: &mut HashSet<TypeId>) -> Option<bool> {
        let desc = self.descriptor(ty)?;
        if !visiting.insert(ty) {
            // Recursive type: necessarily behind indirection somewhere.
            return Some(false);
        }
        let mut all_fields: Vec<&FieldInfo> = desc.fields.iter().collect();
        if let Some(cases) = &desc.cases {
            for case in &cases.cases {
                all_fields.extend(case.fields.iter());
            }
        }
        let mut trivial = true;
        for field in all_fields {
            match field.kind {
                FieldKind::Primitive => {}
                FieldKind::Indirect | FieldKind::Existential => trivial = false,
                FieldKind::Nested(inner) => match self.trivial_inner(inner, visiting) {
                    Some(true) => {}
                    Some(false) => trivial = false,
                    None => {
                        visiting.remove(&ty);
                        return None;
                    }
                },
            }
            if !trivial {
                break;
            }
        }
        visiting.remove(&ty);
        Some(trivial)
    }

    fn insert(&self, desc: TypeDescriptor) {
        self.descriptors.insert(desc.type_id, Arc::new(desc));
    }
}

fn eq_witness<T: PartialEq + Send + Sync + 'static>(
    lhs: &(dyn Any + Send + Sync),
    rhs: &(dyn Any + Send + Sync),
) -> bool {
    match (lhs.downcast_ref::<T>(), rhs.downcast_ref::<T>()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn describe_witness<T: std::fmt::Debug + Send + Sync + 'static>(
    value: &(dyn Any + Send + Sync),
) -> String {
    match value.downcast_ref::<T>() {
        Some(v) => format!("{v:?}"),
        None => "<type mismatch>".to_string(),
    }
}

/// Builder for registering a type descriptor.
///
/// Offsets are the caller's responsibility (typically via
/// `core::mem::offset_of!`); the builder only records them.
pub struct TypeInfoBuilder<T: 'static> {
    fields: Vec<FieldInfo>,
    cases: Option<EnumInfo>,
    equality: Option<EqFn>,
    description: Option<DescribeFn>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: 'static> TypeInfoBuilder<T> {
    pub fn new() -> Self {
        Self {
            fields: Vec::new(),
            cases: None,
            equality: None,
            description: None,
            _marker: std::marker::PhantomData,
        }
    }

    /// A plain-bytes field.
    pub fn primitive(mut self, name: &'static str, offset: usize, len: usize) -> Self {
        self.fields.push(FieldInfo {
            name,
            offset,
            len,
            kind: FieldKind::Primitive,
        });
        self
    }

    /// A composite field whose type may carry its own descriptor.
    pub fn nested<F: 'static>(mut self, name: &'static str, offset: usize) -> Self {
        self.fields.push(FieldInfo {
            name,
            offset,
            len: mem::size_of::<F>(),
            kind: FieldKind::Nested(TypeId::of::<F>()),
        });
        self
    }

    /// A heap-boxed or handle field, compared by identity only.
    pub fn indirect(mut self, name: &'static str, offset: usize) -> Self {
        self.fields.push(FieldInfo {
            name,
            offset,
            len: mem::size_of::<usize>(),
            kind: FieldKind::Indirect,
        });
        self
    }

    /// An existential or function-capture field, compared by identity only.
    pub fn existential(mut self, name: &'static str, offset: usize) -> Self {
        self.fields.push(FieldInfo {
            name,
            offset,
            len: mem::size_of::<usize>(),
            kind: FieldKind::Existential,
        });
        self
    }

    /// Declare an enum tag location. Cases are added with [`Self::case`].
    pub fn enum_repr(mut self, tag_offset: usize, tag_len: usize) -> Self {
        self.cases = Some(EnumInfo {
            tag_offset,
            tag_len,
            cases: Vec::new(),
        });
        self
    }

    /// Add one enum payload case. Field offsets are absolute within the value.
    pub fn case(mut self, tag: u64, name: &'static str, fields: Vec<FieldInfo>) -> Self {
        let info = self
            .cases
            .as_mut()
            .expect("case() requires a preceding enum_repr()");
        info.cases.push(EnumCase { tag, name, fields });
        self
    }

    /// Attach the equality capability (requires `PartialEq`).
    pub fn equatable(mut self) -> Self
    where
        T: PartialEq + Send + Sync,
    {
        self.equality = Some(eq_witness::<T>);
        self
    }

    /// Attach the description capability (requires `Debug`).
    pub fn describable(mut self) -> Self
    where
        T: std::fmt::Debug + Send + Sync,
    {
        self.description = Some(describe_witness::<T>);
        self
    }

    /// Register the descriptor with the shared service.
    pub fn register(self) {
        service().insert(TypeDescriptor {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            size: mem::size_of::<T>(),
            fields: self.fields,
            cases: self.cases,
            equality: self.equality,
            description: self.description,
        });
    }
}

impl<T: 'static> Default for TypeInfoBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Free-standing helper to build a field list for [`TypeInfoBuilder::case`].
pub fn field(name: &'static str, offset: usize, len: usize, kind: FieldKind) -> FieldInfo {
    FieldInfo {
        name,
        offset,
        len,
        kind,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(PartialEq, Debug)]
    struct Point {
        x: f64,
        y: f64,
    }

    struct Labeled {
        point: Point,
        label: String,
    }

    fn register_point() {
        TypeInfoBuilder::<Point>::new()
            .primitive("x", 0, 8)
            .primitive("y", 8, 8)
            .equatable()
            .describable()
            .register();
    }

    #[test]
    fn registered_type_is_enumerable() {
        register_point();

        let mut names = Vec::new();
        let supported = service().for_each_field(
            TypeService::identity::<Point>(),
            FieldOptions::empty(),
            |f| names.push(f.name),
        );

        assert!(supported);
        assert_eq!(names, vec!["x", "y"]);
    }

    #[test]
    fn unregistered_type_is_not_enumerable() {
        struct Unregistered;
        let supported = service().for_each_field(
            TypeService::identity::<Unregistered>(),
            FieldOptions::empty(),
            |_| {},
        );
        assert!(!supported);
    }

    #[test]
    fn trivially_comparable_classification() {
        register_point();
        TypeInfoBuilder::<Labeled>::new()
            .nested::<Point>("point", 0)
            .indirect("label", 16)
            .register();

        assert_eq!(
            service().is_trivially_comparable(TypeService::identity::<Point>()),
            Some(true)
        );
        assert_eq!(
            service().is_trivially_comparable(TypeService::identity::<Labeled>()),
            Some(false)
        );
        struct Unknown;
        assert_eq!(
            service().is_trivially_comparable(TypeService::identity::<Unknown>()),
            None
        );
    }

    #[test]
    fn capabilities_dispatch_through_descriptor() {
        register_point();
        let ty = TypeService::identity::<Point>();

        assert!(service().capability(ty, Capability::Equatable));
        assert!(service().capability(ty, Capability::Describable));

        let eq = service().equality(ty).unwrap();
        let a: Box<dyn std::any::Any + Send + Sync> = Box::new(Point { x: 1.0, y: 2.0 });
        let b: Box<dyn std::any::Any + Send + Sync> = Box::new(Point { x: 1.0, y: 2.0 });
        let c: Box<dyn std::any::Any + Send + Sync> = Box::new(Point { x: 9.0, y: 2.0 });
        assert!(eq(a.as_ref(), b.as_ref()));
        assert!(!eq(a.as_ref(), c.as_ref()));
    }
}

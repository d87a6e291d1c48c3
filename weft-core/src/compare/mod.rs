//! Value comparison.
//!
//! After a rule recomputes, the engine compares the new value against the
//! cached one to decide whether dependents must be invalidated. Four modes
//! exist; which one applies is recorded per node when it is created.
//!
//! - [`ComparisonMode::Bitwise`]: raw memory equality over the stored
//!   representation (padding skipped when a layout is available).
//! - [`ComparisonMode::Indirect`]: allocation identity only.
//! - [`ComparisonMode::EquatableUnlessPod`]: dynamic equality, except for
//!   types proven trivially comparable, which use the faster bitwise path.
//! - [`ComparisonMode::EquatableAlways`]: dynamic equality whenever the type
//!   provides it, bitwise otherwise.

pub mod layout;
pub mod type_info;

use std::any::{Any, TypeId};

pub use layout::{layout_options, prefetch_layout, Layout, LayoutOp, LayoutOptions};
pub use type_info::{
    service, Capability, DescribeFn, EqFn, FieldInfo, FieldKind, FieldOptions, TypeInfoBuilder,
    TypeService,
};

/// Policy governing when two values count as equal for propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComparisonMode {
    /// Raw memory equality over the stored representation.
    Bitwise,
    /// Pointer/handle identity only.
    Indirect,
    /// Dynamic equality unless the type is provably trivially comparable.
    #[default]
    EquatableUnlessPod,
    /// Dynamic equality whenever available.
    EquatableAlways,
}

impl ComparisonMode {
    pub(crate) fn to_bits(self) -> u16 {
        match self {
            Self::Bitwise => 0,
            Self::Indirect => 1,
            Self::EquatableUnlessPod => 2,
            Self::EquatableAlways => 3,
        }
    }

    pub(crate) fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0 => Self::Bitwise,
            1 => Self::Indirect,
            2 => Self::EquatableUnlessPod,
            _ => Self::EquatableAlways,
        }
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            Self::Bitwise => "bitwise",
            Self::Indirect => "indirect",
            Self::EquatableUnlessPod => "equatable-unless-pod",
            Self::EquatableAlways => "equatable-always",
        }
    }
}

/// Type-erased dispatch record for one value type.
///
/// Built once per interned attribute type from the value type's bounds; the
/// optional capabilities mirror the type service's dispatch table.
#[derive(Debug, Clone)]
pub struct ValueVTable {
    pub type_id: TypeId,
    pub type_name: &'static str,
    pub size: usize,
    pub equality: Option<EqFn>,
    pub description: Option<DescribeFn>,
}

impl ValueVTable {
    /// Build the vtable for a concrete value type.
    pub fn of<T: PartialEq + std::fmt::Debug + Send + Sync + 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            size: std::mem::size_of::<T>(),
            equality: Some(eq_erased::<T>),
            description: Some(describe_erased::<T>),
        }
    }
}

fn eq_erased<T: PartialEq + Send + Sync + 'static>(
    lhs: &(dyn Any + Send + Sync),
    rhs: &(dyn Any + Send + Sync),
) -> bool {
    match (lhs.downcast_ref::<T>(), rhs.downcast_ref::<T>()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn describe_erased<T: std::fmt::Debug + Send + Sync + 'static>(
    value: &(dyn Any + Send + Sync),
) -> String {
    match value.downcast_ref::<T>() {
        Some(v) => format!("{v:?}"),
        None => "<type mismatch>".to_string(),
    }
}

/// Thin data pointer for an erased value.
fn data_ptr(value: &(dyn Any + Send + Sync)) -> *const u8 {
    value as *const (dyn Any + Send + Sync) as *const u8
}

fn bitwise_eq(
    lhs: &(dyn Any + Send + Sync),
    rhs: &(dyn Any + Send + Sync),
    vtable: &ValueVTable,
) -> bool {
    // A synthesized layout knows where the padding is; registered types get
    // one on demand. Unregistered types fall back to the full stored
    // representation, which may include padding bytes: callers opting into
    // bitwise mode for an unregistered padded type can see spurious
    // inequality and should register the type's fields.
    if let Some(layout) = layout::prefetch_layout(vtable.type_id) {
        unsafe { layout.matches(data_ptr(lhs), data_ptr(rhs)) }
    } else {
        unsafe {
            let a = std::slice::from_raw_parts(data_ptr(lhs), vtable.size);
            let b = std::slice::from_raw_parts(data_ptr(rhs), vtable.size);
            a == b
        }
    }
}

/// Identity comparison for handle-like values (`Arc`, `Box`, `Rc`): equal
/// exactly when the leading pointer-sized word matches, i.e. both values
/// reference the same allocation.
fn identity_eq(
    lhs: &(dyn Any + Send + Sync),
    rhs: &(dyn Any + Send + Sync),
    vtable: &ValueVTable,
) -> bool {
    if vtable.size < std::mem::size_of::<usize>() {
        // Too small to hold a handle; the whole representation is the
        // identity.
        return bitwise_eq(lhs, rhs, vtable);
    }
    unsafe {
        let a = data_ptr(lhs).cast::<usize>().read_unaligned();
        let b = data_ptr(rhs).cast::<usize>().read_unaligned();
        a == b
    }
}

/// Compare two erased values of the vtable's type under `mode`.
///
/// For every value `v` and every mode, `compare_values(v, v, ..)` is `true`.
pub fn compare_values(
    lhs: &(dyn Any + Send + Sync),
    rhs: &(dyn Any + Send + Sync),
    vtable: &ValueVTable,
    mode: ComparisonMode,
) -> bool {
    if std::ptr::eq(data_ptr(lhs), data_ptr(rhs)) {
        return true;
    }
    match mode {
        ComparisonMode::Bitwise => bitwise_eq(lhs, rhs, vtable),
        ComparisonMode::Indirect => identity_eq(lhs, rhs, vtable),
        ComparisonMode::EquatableUnlessPod => {
            let trivial = service()
                .is_trivially_comparable(vtable.type_id)
                .unwrap_or(false);
            if trivial {
                bitwise_eq(lhs, rhs, vtable)
            } else if let Some(eq) = vtable.equality {
                eq(lhs, rhs)
            } else if let Some(layout) = prefetch_layout(vtable.type_id) {
                unsafe { layout.matches(data_ptr(lhs), data_ptr(rhs)) }
            } else {
                // No capability and no layout: trivial always-equal result.
                true
            }
        }
        ComparisonMode::EquatableAlways => match vtable.equality {
            Some(eq) => eq(lhs, rhs),
            None => bitwise_eq(lhs, rhs, vtable),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn erased<T: Send + Sync + 'static>(value: T) -> Box<dyn Any + Send + Sync> {
        Box::new(value)
    }

    #[test]
    fn compare_is_reflexive_in_every_mode() {
        let vt = ValueVTable::of::<u64>();
        let v = erased(17u64);
        for mode in [
            ComparisonMode::Bitwise,
            ComparisonMode::Indirect,
            ComparisonMode::EquatableUnlessPod,
            ComparisonMode::EquatableAlways,
        ] {
            assert!(
                compare_values(v.as_ref(), v.as_ref(), &vt, mode),
                "mode {:?} not reflexive",
                mode
            );
        }
    }

    #[test]
    fn bitwise_compares_stored_bytes() {
        let vt = ValueVTable::of::<u32>();
        let a = erased(5u32);
        let b = erased(5u32);
        let c = erased(6u32);
        assert!(compare_values(a.as_ref(), b.as_ref(), &vt, ComparisonMode::Bitwise));
        assert!(!compare_values(a.as_ref(), c.as_ref(), &vt, ComparisonMode::Bitwise));
    }

    #[test]
    fn indirect_compares_handle_identity() {
        use std::sync::Arc;

        let vt = ValueVTable::of::<Arc<u32>>();
        let shared = Arc::new(5u32);
        let a = erased(Arc::clone(&shared));
        let b = erased(Arc::clone(&shared));
        let c = erased(Arc::new(5u32));
        // Two handles to the same allocation are identical even though the
        // erased boxes differ.
        assert!(compare_values(a.as_ref(), b.as_ref(), &vt, ComparisonMode::Indirect));
        // Equal contents in a fresh allocation are not.
        assert!(!compare_values(a.as_ref(), c.as_ref(), &vt, ComparisonMode::Indirect));
    }

    #[test]
    fn indirect_falls_back_to_bytes_below_handle_size() {
        let vt = ValueVTable::of::<u32>();
        let a = erased(5u32);
        let b = erased(5u32);
        let c = erased(6u32);
        assert!(compare_values(a.as_ref(), b.as_ref(), &vt, ComparisonMode::Indirect));
        assert!(!compare_values(a.as_ref(), c.as_ref(), &vt, ComparisonMode::Indirect));
    }

    #[test]
    fn bitwise_ignores_padding_for_registered_types() {
        #[repr(C)]
        #[derive(PartialEq, Debug)]
        struct Gapped {
            a: u8,
            // 7 bytes padding
            b: u64,
        }
        TypeInfoBuilder::<Gapped>::new()
            .primitive("a", 0, 1)
            .primitive("b", 8, 8)
            .register();

        // Identical fields over deliberately different padding bytes.
        let make = |pad: u8| {
            let mut bytes = [pad; std::mem::size_of::<Gapped>()];
            bytes[0] = 3;
            bytes[8..16].copy_from_slice(&7u64.to_ne_bytes());
            unsafe { std::ptr::read(bytes.as_ptr() as *const Gapped) }
        };

        let vt = ValueVTable::of::<Gapped>();
        let x = erased(make(0x00));
        let y = erased(make(0xFF));
        assert!(compare_values(
            x.as_ref(),
            y.as_ref(),
            &vt,
            ComparisonMode::Bitwise
        ));
    }

    #[test]
    fn equatable_always_uses_dynamic_equality() {
        let vt = ValueVTable::of::<String>();
        let a = erased(String::from("weft"));
        let b = erased(String::from("weft"));
        // Bitwise would see distinct heap pointers; dynamic equality sees
        // equal contents.
        assert!(compare_values(
            a.as_ref(),
            b.as_ref(),
            &vt,
            ComparisonMode::EquatableAlways
        ));
        assert!(compare_values(
            a.as_ref(),
            b.as_ref(),
            &vt,
            ComparisonMode::EquatableUnlessPod
        ));
    }

    #[test]
    fn equatable_unless_pod_prefers_bitwise_for_trivial_types() {
        #[repr(C)]
        #[derive(PartialEq, Debug)]
        struct Pair {
            a: u32,
            b: u32,
        }
        TypeInfoBuilder::<Pair>::new()
            .primitive("a", 0, 4)
            .primitive("b", 4, 4)
            .equatable()
            .register();

        assert_eq!(
            service().is_trivially_comparable(TypeId::of::<Pair>()),
            Some(true)
        );

        let vt = ValueVTable::of::<Pair>();
        let x = erased(Pair { a: 1, b: 2 });
        let y = erased(Pair { a: 1, b: 2 });
        let z = erased(Pair { a: 1, b: 3 });
        assert!(compare_values(
            x.as_ref(),
            y.as_ref(),
            &vt,
            ComparisonMode::EquatableUnlessPod
        ));
        assert!(!compare_values(
            x.as_ref(),
            z.as_ref(),
            &vt,
            ComparisonMode::EquatableUnlessPod
        ));
    }

    #[test]
    fn mode_round_trips_through_flag_bits() {
        for mode in [
            ComparisonMode::Bitwise,
            ComparisonMode::Indirect,
            ComparisonMode::EquatableUnlessPod,
            ComparisonMode::EquatableAlways,
        ] {
            assert_eq!(ComparisonMode::from_bits(mode.to_bits()), mode);
        }
    }
}

//! Comparison layouts.
//!
//! A layout is a synthesized, cacheable program describing how to compare a
//! value of a given type field-by-field: primitive byte runs, skip regions
//! for padding, nested layout references, enum-case dispatch tables, and
//! identity-only handling for heap-boxed and existential fields.
//!
//! Layouts are computed once per distinct type and cached; synthesis may
//! recursively request layouts for nested types. A consumer that finds no
//! cached layout must fall back to a trivial (always-equal) result rather
//! than fail.
//!
//! # Configuration
//!
//! The `WEFT_LAYOUTS` environment variable is read once and accepts a
//! comma-separated subset of:
//!
//! - `prefetch`: compute layouts eagerly when a type is first interned
//! - `async`: compute layouts off the evaluation path (trivial fallback
//!   until the background computation lands)
//! - `print`: log each synthesized program

use std::any::TypeId;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use dashmap::{DashMap, DashSet};
use tracing::debug;

use super::type_info::{service, FieldKind};

/// One step of a comparison program.
#[derive(Debug, Clone)]
pub enum LayoutOp {
    /// Compare `len` raw bytes at `offset`.
    Compare { offset: usize, len: usize },
    /// Padding or otherwise meaningless bytes; never compared.
    Skip { offset: usize, len: usize },
    /// Run a nested layout against the region starting at `offset`.
    Nested { offset: usize, layout: Arc<Layout> },
    /// Pointer-sized identity comparison (heap-boxed payload).
    Indirect { offset: usize },
    /// Pointer-sized identity comparison (existential or function capture).
    Existential { offset: usize },
    /// Compare the tag, then run the matching case program.
    EnumDispatch {
        tag_offset: usize,
        tag_len: usize,
        cases: Vec<(u64, Arc<Layout>)>,
    },
}

/// A synthesized comparison program for one type.
#[derive(Debug)]
pub struct Layout {
    pub type_name: &'static str,
    pub size: usize,
    pub ops: Vec<LayoutOp>,
}

impl Layout {
    /// Run the program against two values of the layout's type.
    ///
    /// # Safety
    ///
    /// Both pointers must reference live, initialized values of the exact
    /// type this layout was synthesized for.
    pub unsafe fn matches(&self, lhs: *const u8, rhs: *const u8) -> bool {
        for op in &self.ops {
            match op {
                LayoutOp::Compare { offset, len } => {
                    let a = std::slice::from_raw_parts(lhs.add(*offset), *len);
                    let b = std::slice::from_raw_parts(rhs.add(*offset), *len);
                    if a != b {
                        return false;
                    }
                }
                LayoutOp::Skip { .. } => {}
                LayoutOp::Nested { offset, layout } => {
                    if !layout.matches(lhs.add(*offset), rhs.add(*offset)) {
                        return false;
                    }
                }
                LayoutOp::Indirect { offset } | LayoutOp::Existential { offset } => {
                    let a = lhs.add(*offset).cast::<usize>().read_unaligned();
                    let b = rhs.add(*offset).cast::<usize>().read_unaligned();
                    if a != b {
                        return false;
                    }
                }
                LayoutOp::EnumDispatch {
                    tag_offset,
                    tag_len,
                    cases,
                } => {
                    let a = read_tag(lhs, *tag_offset, *tag_len);
                    let b = read_tag(rhs, *tag_offset, *tag_len);
                    if a != b {
                        return false;
                    }
                    match cases.iter().find(|(tag, _)| *tag == a) {
                        Some((_, case)) => {
                            if !case.matches(lhs, rhs) {
                                return false;
                            }
                        }
                        // Unknown case: no registered payload info, treat
                        // the payload as trivially equal.
                        None => {}
                    }
                }
            }
        }
        true
    }
}

unsafe fn read_tag(base: *const u8, offset: usize, len: usize) -> u64 {
    let mut tag: u64 = 0;
    for i in 0..len.min(8) {
        tag |= (base.add(offset + i).read() as u64) << (8 * i);
    }
    tag
}

bitflags::bitflags! {
    /// Layout engine switches, read once from `WEFT_LAYOUTS`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LayoutOptions: u8 {
        /// Synthesize layouts eagerly on first type use.
        const PREFETCH = 1 << 0;
        /// Synthesize layouts off the critical evaluation path.
        const ASYNC = 1 << 1;
        /// Log synthesized programs.
        const PRINT = 1 << 2;
    }
}

impl LayoutOptions {
    /// Parse a comma-separated option string.
    pub fn parse(raw: &str) -> Self {
        let mut options = Self::empty();
        for token in raw.split(',') {
            match token.trim() {
                "prefetch" => options |= Self::PREFETCH,
                "async" => options |= Self::ASYNC,
                "print" => options |= Self::PRINT,
                "" => {}
                other => debug!(option = other, "ignoring unknown layout option"),
            }
        }
        options
    }

    fn from_env() -> Self {
        match std::env::var("WEFT_LAYOUTS") {
            Ok(raw) => Self::parse(&raw),
            Err(_) => Self::empty(),
        }
    }
}

/// Effective layout options for this process.
pub fn layout_options() -> LayoutOptions {
    static OPTIONS: OnceLock<LayoutOptions> = OnceLock::new();
    *OPTIONS.get_or_init(LayoutOptions::from_env)
}

struct LayoutCache {
    layouts: DashMap<TypeId, Arc<Layout>>,
    pending: DashSet<TypeId>,
}

fn cache() -> &'static LayoutCache {
    static CACHE: OnceLock<LayoutCache> = OnceLock::new();
    CACHE.get_or_init(|| LayoutCache {
        layouts: DashMap::new(),
        pending: DashSet::new(),
    })
}

/// Fetch (synthesizing if necessary) the comparison layout for a type.
///
/// Returns `None` when the type has no registered descriptor, or when async
/// layout computation is enabled and the program is not ready yet. Callers
/// fall back to a trivial comparison in that case.
pub fn prefetch_layout(ty: TypeId) -> Option<Arc<Layout>> {
    let cache = cache();
    if let Some(found) = cache.layouts.get(&ty) {
        return Some(Arc::clone(&found));
    }
    service().descriptor(ty)?;

    if layout_options().contains(LayoutOptions::ASYNC) {
        if cache.pending.insert(ty) {
            // The cache reference is 'static, so it moves into the worker.
            std::thread::spawn(move || {
                if let Some(layout) = synthesize(ty, &mut HashSet::new()) {
                    cache.layouts.insert(ty, layout);
                }
                cache.pending.remove(&ty);
            });
        }
        return None;
    }

    let layout = synthesize(ty, &mut HashSet::new())?;
    cache.layouts.insert(ty, Arc::clone(&layout));
    Some(layout)
}

fn synthesize(ty: TypeId, visiting: &mut HashSet<TypeId>) -> Option<Arc<Layout>> {
    if let Some(found) = cache().layouts.get(&ty) {
        return Some(Arc::clone(&found));
    }
    let desc = service().descriptor(ty)?;
    if !visiting.insert(ty) {
        // Recursive nesting can only occur through indirection; the
        // indirect field itself already compares by identity.
        return None;
    }

    let mut ops = ops_for_fields(&desc.fields, desc.size, visiting);

    if let Some(info) = &desc.cases {
        let mut cases = Vec::with_capacity(info.cases.len());
        for case in &info.cases {
            let case_ops = ops_for_fields(&case.fields, 0, visiting);
            cases.push((
                case.tag,
                Arc::new(Layout {
                    type_name: case.name,
                    size: desc.size,
                    ops: case_ops,
                }),
            ));
        }
        ops.push(LayoutOp::EnumDispatch {
            tag_offset: info.tag_offset,
            tag_len: info.tag_len,
            cases,
        });
    }

    visiting.remove(&ty);

    let layout = Arc::new(Layout {
        type_name: desc.type_name,
        size: desc.size,
        ops,
    });
    if layout_options().contains(LayoutOptions::PRINT) {
        debug!(type_name = desc.type_name, layout = ?layout, "synthesized comparison layout");
    }
    Some(layout)
}

/// Emit ops for a field list, inserting skip regions for the gaps.
///
/// `trailing` is the end of the covered region (the type size for struct
/// fields, 0 to suppress trailing skips for enum-case payloads).
fn ops_for_fields(
    fields: &[super::type_info::FieldInfo],
    trailing: usize,
    visiting: &mut HashSet<TypeId>,
) -> Vec<LayoutOp> {
    let mut sorted: Vec<_> = fields.iter().collect();
    sorted.sort_by_key(|f| f.offset);

    let mut ops = Vec::with_capacity(sorted.len() + 2);
    let mut cursor = 0usize;
    for field in sorted {
        if field.offset > cursor {
            ops.push(LayoutOp::Skip {
                offset: cursor,
                len: field.offset - cursor,
            });
        }
        match field.kind {
            FieldKind::Primitive => ops.push(LayoutOp::Compare {
                offset: field.offset,
                len: field.len,
            }),
            FieldKind::Indirect => ops.push(LayoutOp::Indirect {
                offset: field.offset,
            }),
            FieldKind::Existential => ops.push(LayoutOp::Existential {
                offset: field.offset,
            }),
            FieldKind::Nested(inner) => match synthesize(inner, visiting) {
                Some(layout) => ops.push(LayoutOp::Nested {
                    offset: field.offset,
                    layout,
                }),
                // No descriptor for the nested type: compare its bytes.
                None => ops.push(LayoutOp::Compare {
                    offset: field.offset,
                    len: field.len,
                }),
            },
        }
        cursor = cursor.max(field.offset + field.len);
    }
    if trailing > cursor {
        ops.push(LayoutOp::Skip {
            offset: cursor,
            len: trailing - cursor,
        });
    }
    ops
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::type_info::TypeInfoBuilder;

    #[repr(C)]
    #[derive(Clone, PartialEq, Debug)]
    struct Padded {
        a: u8,
        // 7 bytes padding
        b: u64,
    }

    fn register_padded() {
        TypeInfoBuilder::<Padded>::new()
            .primitive("a", 0, 1)
            .primitive("b", 8, 8)
            .register();
    }

    #[test]
    fn layout_skips_padding() {
        register_padded();
        let layout = prefetch_layout(TypeId::of::<Padded>()).expect("layout");

        // Two values equal in declared fields but (potentially) different
        // padding must compare equal.
        let x = Padded { a: 1, b: 2 };
        let y = Padded { a: 1, b: 2 };
        let z = Padded { a: 1, b: 3 };

        unsafe {
            let px = &x as *const Padded as *const u8;
            let py = &y as *const Padded as *const u8;
            let pz = &z as *const Padded as *const u8;
            assert!(layout.matches(px, py));
            assert!(!layout.matches(px, pz));
            assert!(layout.matches(px, px));
        }
    }

    #[test]
    fn layout_is_cached_once() {
        register_padded();
        let first = prefetch_layout(TypeId::of::<Padded>()).expect("layout");
        let second = prefetch_layout(TypeId::of::<Padded>()).expect("layout");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn unregistered_type_has_no_layout() {
        struct Opaque(#[allow(dead_code)] u32);
        assert!(prefetch_layout(TypeId::of::<Opaque>()).is_none());
    }

    #[test]
    fn indirect_fields_compare_by_identity() {
        #[repr(C)]
        struct Handle {
            boxed: Box<u32>,
        }
        TypeInfoBuilder::<Handle>::new()
            .indirect("boxed", 0)
            .register();

        let layout = prefetch_layout(TypeId::of::<Handle>()).expect("layout");
        let a = Handle { boxed: Box::new(7) };
        let b = Handle { boxed: Box::new(7) };

        unsafe {
            let pa = &a as *const Handle as *const u8;
            let pb = &b as *const Handle as *const u8;
            // Same payload, different allocations: identity differs.
            assert!(!layout.matches(pa, pb));
            assert!(layout.matches(pa, pa));
        }
    }

    #[test]
    fn option_string_parsing() {
        assert_eq!(
            LayoutOptions::parse("prefetch,print"),
            LayoutOptions::PREFETCH | LayoutOptions::PRINT
        );
        assert_eq!(LayoutOptions::parse(""), LayoutOptions::empty());
        assert_eq!(
            LayoutOptions::parse(" async , bogus "),
            LayoutOptions::ASYNC
        );
    }

    #[test]
    fn enum_dispatch_compares_tagged_payloads() {
        // Hand-modeled two-case enum: tag byte at 0, u32 payload at 4.
        #[repr(C)]
        struct TaggedRepr {
            tag: u8,
            payload: u32,
        }
        use crate::compare::type_info::{field, FieldKind};
        TypeInfoBuilder::<TaggedRepr>::new()
            .enum_repr(0, 1)
            .case(0, "A", vec![field("value", 4, 4, FieldKind::Primitive)])
            .case(1, "B", vec![])
            .register();

        let layout = prefetch_layout(TypeId::of::<TaggedRepr>()).expect("layout");
        let a1 = TaggedRepr { tag: 0, payload: 5 };
        let a2 = TaggedRepr { tag: 0, payload: 5 };
        let a3 = TaggedRepr { tag: 0, payload: 9 };
        let b1 = TaggedRepr { tag: 1, payload: 5 };
        let b2 = TaggedRepr { tag: 1, payload: 9 };

        unsafe {
            let p = |v: &TaggedRepr| v as *const TaggedRepr as *const u8;
            assert!(layout.matches(p(&a1), p(&a2)));
            assert!(!layout.matches(p(&a1), p(&a3)));
            assert!(!layout.matches(p(&a1), p(&b1)));
            // Case B has no payload fields: tag equality suffices.
            assert!(layout.matches(p(&b1), p(&b2)));
        }
    }
}

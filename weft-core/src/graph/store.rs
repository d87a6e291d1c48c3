//! Node Store
//!
//! Arena-backed storage for attribute nodes. Slots are addressed by index,
//! tagged with a generation so freed slots can be recycled without stale
//! handles ever resolving. The first two slots are reserved for the nil and
//! implicit-root sentinels and are never allocated.

use crate::error::fatal;
use crate::graph::node::{AttributeId, NodeRecord};

struct Slot {
    generation: u32,
    record: Option<NodeRecord>,
}

/// Arena of attribute nodes.
pub struct NodeStore {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl NodeStore {
    pub fn new() -> Self {
        // Slots 0 and 1 back the NIL and ROOT sentinels; they stay empty
        // and never enter the free list.
        let slots = vec![
            Slot {
                generation: 0,
                record: None,
            },
            Slot {
                generation: 0,
                record: None,
            },
        ];
        Self {
            slots,
            free: Vec::new(),
            live: 0,
        }
    }

    /// Allocate a node. Exhaustion of the index space is fatal.
    pub fn allocate(&mut self, record: NodeRecord) -> AttributeId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.record.is_none());
            slot.record = Some(record);
            return AttributeId::new(index, slot.generation);
        }
        let index = self.slots.len();
        if index > u32::MAX as usize {
            fatal!("attribute arena exhausted");
        }
        self.slots.push(Slot {
            generation: 0,
            record: Some(record),
        });
        AttributeId::new(index as u32, 0)
    }

    /// Free a node, returning its record. The slot's generation is bumped so
    /// the id can later be recycled without aliasing.
    pub fn free(&mut self, id: AttributeId) -> Option<NodeRecord> {
        let slot = self.slots.get_mut(id.index() as usize)?;
        if slot.generation != id.generation() || slot.record.is_none() {
            return None;
        }
        let record = slot.record.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index());
        self.live -= 1;
        record
    }

    pub fn get(&self, id: AttributeId) -> Option<&NodeRecord> {
        let slot = self.slots.get(id.index() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.record.as_ref()
    }

    pub fn get_mut(&mut self, id: AttributeId) -> Option<&mut NodeRecord> {
        let slot = self.slots.get_mut(id.index() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.record.as_mut()
    }

    pub fn contains(&self, id: AttributeId) -> bool {
        self.get(id).is_some()
    }

    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Iterate live nodes in index order.
    pub fn iter(&self) -> impl Iterator<Item = (AttributeId, &NodeRecord)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.record
                .as_ref()
                .map(|record| (AttributeId::new(index as u32, slot.generation), record))
        })
    }
}

impl Default for NodeStore {
    fn default() -> Self {
        Self::new()
    }
}

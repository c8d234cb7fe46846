// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Address spaces and their cached hardware context ids.

extern crate alloc;

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use static_assertions::const_assert;

use super::region::RegionMap;
use crate::types::{ContextId, Generation, RootTable, SpaceId, GENERATION_BITS, MAX_CONTEXT_BITS};

const ID_BITS: u32 = MAX_CONTEXT_BITS;
const ID_MASK: u64 = (1 << ID_BITS) - 1;

const_assert!(ID_BITS + GENERATION_BITS <= u64::BITS);

static NEXT_SPACE_ID: AtomicU32 = AtomicU32::new(1);

/// Draws a user space id; 0 belongs to the kernel space and is skipped on wrap.
fn next_space_id(counter: &AtomicU32) -> SpaceId {
    loop {
        let raw = counter.fetch_add(1, Ordering::Relaxed);
        if raw != SpaceId::KERNEL.as_raw() {
            return SpaceId::from_raw(raw);
        }
    }
}

/// Cached `(ContextId, Generation)` pair, readable and clearable without locks.
///
/// The packed value 0 means "no context": valid generations start at 1.
#[derive(Debug, Default)]
pub struct ContextSlot {
    packed: AtomicU64,
}

impl ContextSlot {
    pub const fn empty() -> Self {
        Self { packed: AtomicU64::new(0) }
    }

    #[inline]
    pub fn load(&self) -> Option<(ContextId, Generation)> {
        unpack(self.packed.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn store(&self, id: ContextId, generation: Generation) {
        self.packed.store(pack(id, generation), Ordering::Release);
    }

    /// Clears the slot only if it still holds `(id, generation)`.
    pub(crate) fn clear_if(&self, id: ContextId, generation: Generation) -> bool {
        self.packed
            .compare_exchange(pack(id, generation), 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[inline]
fn pack(id: ContextId, generation: Generation) -> u64 {
    debug_assert!(generation <= Generation::MAX);
    (generation.as_raw() << ID_BITS) | (id.as_raw() as u64 & ID_MASK)
}

#[inline]
fn unpack(raw: u64) -> Option<(ContextId, Generation)> {
    if raw == 0 {
        return None;
    }
    Some((ContextId::from_raw((raw & ID_MASK) as u32), Generation::from_raw(raw >> ID_BITS)))
}

/// Whether the space is the persistent kernel space or a process space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpaceKind {
    Kernel,
    User,
}

/// One process's (or the kernel's) mapping context.
///
/// The context slots are shared with the allocator's owner table so a steal can
/// evict the cached id without holding a reference to the whole space.
pub struct AddressSpace {
    id: SpaceId,
    kind: SpaceKind,
    root: RootTable,
    slots: Vec<Arc<ContextSlot>>,
    regions: RegionMap,
}

impl AddressSpace {
    /// Creates a process address space with one context slot per allocator domain.
    pub fn user(root: RootTable, domains: usize, regions: RegionMap) -> Self {
        let id = next_space_id(&NEXT_SPACE_ID);
        let slots = (0..domains.max(1)).map(|_| Arc::new(ContextSlot::empty())).collect();
        Self { id, kind: SpaceKind::User, root, slots, regions }
    }

    /// The boot-time kernel space; it always runs on the reserved context.
    pub fn kernel(root: RootTable) -> Self {
        Self {
            id: SpaceId::KERNEL,
            kind: SpaceKind::Kernel,
            root,
            slots: Vec::new(),
            regions: RegionMap::new(0),
        }
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    pub fn is_kernel(&self) -> bool {
        self.kind == SpaceKind::Kernel
    }

    pub fn root_table(&self) -> RootTable {
        self.root
    }

    pub fn regions(&self) -> &RegionMap {
        &self.regions
    }

    /// Cached context id for `domain`, `None` until first scheduled or after eviction.
    pub fn context_id(&self, domain: usize) -> Option<ContextId> {
        if self.is_kernel() {
            return Some(ContextId::KERNEL);
        }
        self.context(domain).map(|(id, _)| id)
    }

    /// Cached `(id, generation)` for `domain`.
    pub fn context(&self, domain: usize) -> Option<(ContextId, Generation)> {
        self.slots.get(domain).and_then(|slot| slot.load())
    }

    pub fn domains(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn slot(&self, domain: usize) -> Option<&Arc<ContextSlot>> {
        self.slots.get(domain)
    }
}

impl core::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("root", &self.root)
            .field("contexts", &self.slots.iter().map(|s| s.load()).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_packs_and_clears_conditionally() {
        let slot = ContextSlot::empty();
        assert_eq!(slot.load(), None);
        let id = ContextId::from_raw((1 << ID_BITS) - 1);
        let generation = Generation::MAX;
        slot.store(id, generation);
        assert_eq!(slot.load(), Some((id, generation)));
        assert!(!slot.clear_if(id, Generation::FIRST));
        assert!(slot.clear_if(id, generation));
        assert_eq!(slot.load(), None);
    }

    #[test]
    fn space_ids_skip_kernel_id_on_wrap() {
        let counter = AtomicU32::new(u32::MAX);
        assert_eq!(next_space_id(&counter), SpaceId::from_raw(u32::MAX));
        assert_eq!(next_space_id(&counter), SpaceId::from_raw(1));
        assert_eq!(next_space_id(&counter), SpaceId::from_raw(2));
    }

    #[test]
    fn kernel_space_reports_reserved_context() {
        let kernel = AddressSpace::kernel(RootTable::from_phys(0x8020_0000));
        assert!(kernel.is_kernel());
        assert_eq!(kernel.context_id(0), Some(ContextId::KERNEL));
        assert_eq!(kernel.domains(), 0);
    }

    #[test]
    fn user_spaces_get_distinct_ids_and_empty_slots() {
        let a = AddressSpace::user(RootTable::from_phys(0x1000), 2, RegionMap::new(0));
        let b = AddressSpace::user(RootTable::from_phys(0x2000), 2, RegionMap::new(0));
        assert_ne!(a.id(), b.id());
        assert_ne!(a.id(), SpaceId::KERNEL);
        assert_eq!(a.domains(), 2);
        assert_eq!(a.context_id(0), None);
        assert_eq!(a.context_id(5), None);
    }
}

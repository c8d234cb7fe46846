// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Memory regions and the reference region index consulted on faults
//! OWNERS: @kernel-mm-team
//! PUBLIC API: MemoryRegion, RegionFlags, RegionMap, RegionError, ResourceLimitError
//! DEPENDS_ON: spin::RwLock, bitflags
//! INVARIANTS: regions are page aligned, non-empty and never overlap; lookups take the read
//!             lock only so faults on sibling regions run concurrently; only stack growth
//!             takes the write lock on the fault path

extern crate alloc;

use alloc::collections::BTreeMap;
use core::fmt;
use core::ops::Bound;

use bitflags::bitflags;
use spin::RwLock;

use crate::types::VirtAddr;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
    /// Capability set of a region.
    pub struct RegionFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const GROWS_DOWN = 1 << 3;
    }
}

/// Contiguous range `[start, end)` with uniform permissions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: VirtAddr,
    pub end: VirtAddr,
    pub flags: RegionFlags,
}

impl MemoryRegion {
    pub const fn new(start: usize, end: usize, flags: RegionFlags) -> Self {
        Self { start: VirtAddr::new(start), end: VirtAddr::new(end), flags }
    }

    #[inline]
    pub fn contains(&self, addr: VirtAddr) -> bool {
        self.start <= addr && addr < self.end
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.end.raw() - self.start.raw()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    #[inline]
    pub fn grows_down(&self) -> bool {
        self.flags.contains(RegionFlags::GROWS_DOWN)
    }
}

/// Errors reported while editing the region index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionError {
    /// Start or end is not page aligned.
    Unaligned,
    /// `end <= start`.
    Empty,
    /// Region intersects an existing one.
    Overlap,
    /// No region starts at the given address.
    NotFound,
}

impl fmt::Display for RegionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            RegionError::Unaligned => "region bounds not page aligned",
            RegionError::Empty => "empty region",
            RegionError::Overlap => "region overlaps an existing mapping",
            RegionError::NotFound => "no such region",
        };
        f.write_str(msg)
    }
}

/// Why a downward stack expansion was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceLimitError {
    /// Growth would exceed the stack size limit.
    StackLimit,
    /// Growth would run into the region below.
    Collision,
    /// The region is not `GROWS_DOWN`, or vanished concurrently.
    NotGrowable,
}

impl fmt::Display for ResourceLimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ResourceLimitError::StackLimit => "stack size limit reached",
            ResourceLimitError::Collision => "stack would collide with a lower mapping",
            ResourceLimitError::NotGrowable => "region cannot grow downward",
        };
        f.write_str(msg)
    }
}

/// Region index of one address space, keyed by region start.
pub struct RegionMap {
    regions: RwLock<BTreeMap<VirtAddr, MemoryRegion>>,
    stack_limit: usize,
}

impl RegionMap {
    /// Creates an empty index; `stack_limit` caps a grown-down region's size.
    pub const fn new(stack_limit: usize) -> Self {
        Self { regions: RwLock::new(BTreeMap::new()), stack_limit }
    }

    pub fn insert(&self, region: MemoryRegion) -> Result<(), RegionError> {
        if !region.start.is_page_aligned() || !region.end.is_page_aligned() {
            return Err(RegionError::Unaligned);
        }
        if region.is_empty() {
            return Err(RegionError::Empty);
        }
        let mut regions = self.regions.write();
        if Self::overlaps(&regions, region.start, region.end) {
            return Err(RegionError::Overlap);
        }
        regions.insert(region.start, region);
        Ok(())
    }

    pub fn remove(&self, start: VirtAddr) -> Result<MemoryRegion, RegionError> {
        self.regions.write().remove(&start).ok_or(RegionError::NotFound)
    }

    /// First region whose end lies above `addr`; it covers `addr` only if its start is at
    /// or below it.
    pub fn find(&self, addr: VirtAddr) -> Option<MemoryRegion> {
        let regions = self.regions.read();
        if let Some((_, below)) = regions.range(..=addr).next_back() {
            if below.end > addr {
                return Some(*below);
            }
        }
        regions.range((Bound::Excluded(addr), Bound::Unbounded)).next().map(|(_, r)| *r)
    }

    /// Extends the `GROWS_DOWN` region ending at `region.end` down to cover `addr`.
    ///
    /// The region is found by its end, which growth never moves, so a descriptor read
    /// before a concurrent expansion still names it.
    pub fn expand_downward(
        &self,
        region: &MemoryRegion,
        addr: VirtAddr,
    ) -> Result<MemoryRegion, ResourceLimitError> {
        let new_start = addr.page_floor();
        let mut regions = self.regions.write();
        let current = match regions.range(..region.end).next_back() {
            Some((_, current)) if current.end == region.end && current.grows_down() => *current,
            _ => return Err(ResourceLimitError::NotGrowable),
        };
        if new_start >= current.start {
            // Another thread already grew it.
            return Ok(current);
        }
        if current.end.raw() - new_start.raw() > self.stack_limit {
            return Err(ResourceLimitError::StackLimit);
        }
        if let Some((_, below)) = regions.range(..current.start).next_back() {
            if below.end > new_start {
                return Err(ResourceLimitError::Collision);
            }
        }
        regions.remove(&current.start);
        let grown = MemoryRegion { start: new_start, ..current };
        regions.insert(new_start, grown);
        Ok(grown)
    }

    pub fn len(&self) -> usize {
        self.regions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.read().is_empty()
    }

    fn overlaps(regions: &BTreeMap<VirtAddr, MemoryRegion>, start: VirtAddr, end: VirtAddr) -> bool {
        if let Some((_, below)) = regions.range(..=start).next_back() {
            if below.end > start {
                return true;
            }
        }
        regions.range(start..end).next().is_some()
    }
}

impl fmt::Debug for RegionMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.regions.read().values()).finish()
    }
}

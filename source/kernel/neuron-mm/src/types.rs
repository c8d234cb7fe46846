// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Newtypes shared by the fault dispatcher and the context allocator
//! OWNERS: @kernel-mm-team
//! PUBLIC API: VirtAddr, ContextId, Generation, CpuId, CpuSet, ThreadId, SpaceId, RootTable
//! DEPENDS_ON: core only
//! INVARIANTS: ContextId fits in MAX_CONTEXT_BITS; Generation 0 never names a live holder;
//!             CpuSet covers at most MAX_CPUS CPUs

use core::fmt;

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Widest hardware context tag supported (24-bit VSID-derived values).
pub const MAX_CONTEXT_BITS: u32 = 24;

/// Generation width left once a generation is packed next to a context id.
pub const GENERATION_BITS: u32 = u64::BITS - MAX_CONTEXT_BITS;

/// CPU ceiling for bounded per-CPU state.
pub const MAX_CPUS: usize = 64;

/// Faulting or mapped virtual address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Rounds down to the containing page.
    #[inline]
    pub const fn page_floor(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    #[inline]
    pub fn checked_add(self, v: usize) -> Option<Self> {
        self.0.checked_add(v).map(Self)
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Hardware address-space tag (ASID / PID-tag / VSID).
///
/// **Invariant**: the value fits in [`MAX_CONTEXT_BITS`]; the allocator's reserved
/// range (at least 0) belongs to the kernel and is never handed to user spaces.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ContextId(u32);

impl ContextId {
    /// Kernel/idle context.
    pub const KERNEL: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// Monotonic assignment stamp used to detect recycled context ids.
///
/// Generation 0 is reserved to mean "no valid holder". Values stay below
/// `1 << GENERATION_BITS`; [`Generation::next`] wraps from [`Generation::MAX`] to
/// [`Generation::FIRST`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Generation(u64);

impl Generation {
    pub const INVALID: Self = Self(0);
    pub const FIRST: Self = Self(1);
    pub const MAX: Self = Self((1 << GENERATION_BITS) - 1);

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    #[inline]
    pub const fn next(self) -> Self {
        if self.0 >= Self::MAX.0 {
            Self::FIRST
        } else {
            Self(self.0 + 1)
        }
    }
}

/// Logical CPU index (0-based).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct CpuId(u16);

impl CpuId {
    pub const BOOT: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }
}

/// Bounded set of CPUs used as a cross-call target mask.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct CpuSet(u64);

impl CpuSet {
    pub const EMPTY: Self = Self(0);

    /// Set containing CPUs `0..count`.
    pub const fn first(count: usize) -> Self {
        if count >= MAX_CPUS {
            Self(u64::MAX)
        } else {
            Self((1u64 << count) - 1)
        }
    }

    #[inline]
    pub const fn from_mask(mask: u64) -> Self {
        Self(mask)
    }

    #[inline]
    pub const fn mask(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn insert(&mut self, cpu: CpuId) {
        if cpu.as_index() < MAX_CPUS {
            self.0 |= 1 << cpu.as_index();
        }
    }

    #[inline]
    pub fn remove(&mut self, cpu: CpuId) {
        if cpu.as_index() < MAX_CPUS {
            self.0 &= !(1 << cpu.as_index());
        }
    }

    #[inline]
    pub const fn contains(self, cpu: CpuId) -> bool {
        cpu.as_index() < MAX_CPUS && self.0 & (1 << cpu.as_index()) != 0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Returns a copy without `cpu`.
    #[inline]
    pub fn without(mut self, cpu: CpuId) -> Self {
        self.remove(cpu);
        self
    }

    pub fn iter(self) -> impl Iterator<Item = CpuId> {
        (0..MAX_CPUS)
            .filter(move |bit| self.0 & (1 << bit) != 0)
            .map(|bit| CpuId::from_raw(bit as u16))
    }
}

/// Identifier of the faulting thread, used as the signal target.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ThreadId(u32);

impl ThreadId {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

/// Identity of an address space, stable for its whole lifetime.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SpaceId(u32);

impl SpaceId {
    pub const KERNEL: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "as#{}", self.0)
    }
}

/// Physical address of a top-level page table; opaque to this crate.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct RootTable(usize);

impl RootTable {
    #[inline]
    pub const fn from_phys(pa: usize) -> Self {
        Self(pa)
    }

    #[inline]
    pub const fn phys(self) -> usize {
        self.0
    }

    /// Physical page number, as consumed by SATP-style registers.
    #[inline]
    pub const fn ppn(self) -> usize {
        self.0 / PAGE_SIZE
    }
}

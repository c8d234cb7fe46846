// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Hardware context-id (ASID/PID/VSID) allocator with generation tracking
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: unit tests below + mm/tests.rs + mm/tests_prop.rs + tests/concurrency.rs
//! PUBLIC API: ContextAllocator (acquire/release/take_flush/mark_active), Acquisition,
//!             AcquireKind, ContextError, ContextStats
//! DEPENDS_ON: mm::bitmap, mm::address_space::ContextSlot, hal::TlbShootdown
//! INVARIANTS:
//!   - At most one live address space holds an id with a generation that matches
//!     `generations[id]`; generation 0 never matches.
//!   - Ids below `config.reserved` are never handed to user spaces, not even on error.
//!   - Exhaustion never fails `acquire`: it ends in a rollover or a steal. Errors only
//!     report a CPU outside the namespace or a space without a slot for it.
//!   - The fast path (cached id, matching generation) takes no lock and touches neither the
//!     bitmap nor the owner table; it only publishes the per-CPU active id.
//!   - Ids loaded on some CPU survive a rollover.
//!
//! Two recycling policies share one engine. `OwnerTracking` keeps an owner table and
//! steals the least-recently-acquired id when the namespace is full. `VersionBump`
//! keeps no owners: a full namespace frees every id that is not currently loaded on a
//! CPU and flushes all TLBs, so its steal path is only reached when every usable id is
//! loaded somewhere.
//!
//! Every fresh assignment marks the id stale on the other CPUs of the namespace; a CPU
//! flushes that id locally the first time it loads it afterwards (see `take_flush`).

extern crate alloc;

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::cmp::Reverse;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use spin::Mutex;

use super::address_space::{AddressSpace, ContextSlot};
use super::bitmap::ContextBitmap;
use crate::config::{AllocatorConfig, ConfigError, RecyclePolicy};
use crate::hal::{FlushScope, TlbShootdown};
use crate::types::{ContextId, CpuId, CpuSet, Generation, SpaceId};

/// How an acquisition was satisfied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireKind {
    /// Kernel space on the reserved id.
    Reserved,
    /// Cached id still valid; nothing changed.
    Cached,
    /// Free id taken from the bitmap.
    Fresh,
    /// Namespace was full; a rollover freed ids.
    Rollover,
    /// Namespace was full; the id was taken from `victim` (unknown without owner tracking).
    Stolen { victim: Option<SpaceId> },
}

/// Result of [`ContextAllocator::acquire`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub struct Acquisition {
    pub id: ContextId,
    pub generation: Generation,
    pub kind: AcquireKind,
}

impl Acquisition {
    /// The kernel's reserved context.
    pub const fn reserved() -> Self {
        Self { id: ContextId::KERNEL, generation: Generation::INVALID, kind: AcquireKind::Reserved }
    }

    /// Whether the id changed hands, so the local TLB may hold a prior owner's entries.
    pub fn needs_local_flush(&self) -> bool {
        !matches!(self.kind, AcquireKind::Reserved | AcquireKind::Cached)
    }
}

/// Why no context could be handed out; both are caller bugs, never exhaustion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextError {
    /// `cpu` is not a member of any context namespace.
    OfflineCpu(CpuId),
    /// `space` carries no context slot for `domain`.
    MissingSlot { space: SpaceId, domain: usize },
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextError::OfflineCpu(cpu) => write!(f, "cpu {} is offline", cpu.as_raw()),
            ContextError::MissingSlot { space, domain } => {
                write!(f, "{} has no context slot for domain {}", space, domain)
            }
        }
    }
}

/// Diagnostic counters; exhaustion is distinguishable from clean fast-path acquires.
#[derive(Debug, Default)]
pub struct ContextStats {
    fast_path: AtomicU64,
    fresh: AtomicU64,
    rollovers: AtomicU64,
    steals: AtomicU64,
    releases: AtomicU64,
    stale_releases: AtomicU64,
}

/// Point-in-time copy of [`ContextStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContextStatsSnapshot {
    pub fast_path: u64,
    pub fresh: u64,
    pub rollovers: u64,
    pub steals: u64,
    pub releases: u64,
    pub stale_releases: u64,
}

impl ContextStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ContextStatsSnapshot {
        ContextStatsSnapshot {
            fast_path: self.fast_path.load(Ordering::Relaxed),
            fresh: self.fresh.load(Ordering::Relaxed),
            rollovers: self.rollovers.load(Ordering::Relaxed),
            steals: self.steals.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            stale_releases: self.stale_releases.load(Ordering::Relaxed),
        }
    }
}

/// Per-CPU bookkeeping inside one namespace.
struct Lane {
    cpu: CpuId,
    /// Id currently loaded on the CPU; 0 when none or kernel.
    active: AtomicU32,
    /// Full local flush owed after a rollover.
    flush_all: AtomicBool,
    /// Ids reassigned since this CPU last flushed them.
    stale: Box<[AtomicU64]>,
}

impl Lane {
    fn new(cpu: CpuId, capacity: usize) -> Self {
        let words = capacity.div_ceil(64);
        Self {
            cpu,
            active: AtomicU32::new(0),
            flush_all: AtomicBool::new(false),
            stale: (0..words).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn mark_stale(&self, id: ContextId) {
        let index = id.as_index();
        if let Some(word) = self.stale.get(index / 64) {
            word.fetch_or(1 << (index % 64), Ordering::Release);
        }
    }

    fn take_stale(&self, id: ContextId) -> bool {
        let index = id.as_index();
        let mask = 1u64 << (index % 64);
        self.stale
            .get(index / 64)
            .map(|word| word.fetch_and(!mask, Ordering::AcqRel) & mask != 0)
            .unwrap_or(false)
    }

    fn clear_all_stale(&self) {
        for word in self.stale.iter() {
            word.store(0, Ordering::Release);
        }
    }
}

struct Owner {
    space: SpaceId,
    slot: Arc<ContextSlot>,
    generation: Generation,
}

struct Inner {
    bitmap: ContextBitmap,
    /// Next id to try; an optimisation only.
    next_hint: usize,
    next_generation: Generation,
    /// Reverse map id -> holder; empty under `VersionBump`.
    owners: Vec<Option<Owner>>,
}

/// Allocator for one context-id namespace.
pub struct ContextAllocator {
    config: AllocatorConfig,
    domain: usize,
    members: CpuSet,
    inner: Mutex<Inner>,
    /// Generation currently valid for each id; 0 = no holder. Read lock-free.
    generations: Box<[AtomicU64]>,
    lanes: Vec<Lane>,
    stats: ContextStats,
}

impl ContextAllocator {
    /// Builds the allocator for namespace `domain`, shared by the CPUs in `members`.
    pub fn new(config: AllocatorConfig, domain: usize, members: CpuSet) -> Result<Self, ConfigError> {
        config.validate()?;
        let capacity = config.capacity();
        let usable = capacity - config.reserved as usize;
        if members.is_empty() || members.len() > usable {
            return Err(ConfigError::CpuCount);
        }
        let mut bitmap = ContextBitmap::new(capacity);
        for reserved in 0..config.reserved as usize {
            bitmap.set(reserved);
        }
        let owners = match config.policy {
            RecyclePolicy::OwnerTracking => (0..capacity).map(|_| None).collect(),
            RecyclePolicy::VersionBump => Vec::new(),
        };
        Ok(Self {
            config,
            domain,
            members,
            inner: Mutex::new(Inner {
                bitmap,
                next_hint: config.first_usable() as usize,
                next_generation: Generation::FIRST,
                owners,
            }),
            generations: (0..capacity).map(|_| AtomicU64::new(0)).collect(),
            lanes: members.iter().map(|cpu| Lane::new(cpu, capacity)).collect(),
            stats: ContextStats::default(),
        })
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn domain(&self) -> usize {
        self.domain
    }

    pub fn members(&self) -> CpuSet {
        self.members
    }

    pub fn stats(&self) -> &ContextStats {
        &self.stats
    }

    /// Usable ids (capacity minus the reserved range).
    pub fn usable(&self) -> usize {
        self.config.capacity() - self.config.reserved as usize
    }

    /// Ids currently marked in use, reserved range excluded.
    pub fn in_use(&self) -> usize {
        self.inner.lock().bitmap.count_from(self.config.reserved as usize)
    }

    /// Whether `(id, generation)` is the current assignment of `id`.
    #[inline]
    pub fn is_current(&self, id: ContextId, generation: Generation) -> bool {
        generation.is_valid()
            && self
                .generations
                .get(id.as_index())
                .map(|g| g.load(Ordering::Acquire) == generation.as_raw())
                .unwrap_or(false)
    }

    /// Ensures `space` holds a valid context id in this namespace and returns it.
    ///
    /// When the returned kind is not `Cached`/`Reserved` the caller must invalidate the
    /// local TLB for the id before first use. A user space never receives a reserved id:
    /// a CPU outside this namespace or a missing slot is an error instead.
    pub fn acquire<S: TlbShootdown + ?Sized>(
        &self,
        cpu: CpuId,
        space: &AddressSpace,
        shootdown: &S,
    ) -> Result<Acquisition, ContextError> {
        if space.is_kernel() {
            return Ok(Acquisition::reserved());
        }
        if self.lane(cpu).is_none() {
            crate::log_error!(
                target: "asid",
                "{} acquire on cpu {} outside domain {}",
                space.id(),
                cpu.as_raw(),
                self.domain
            );
            return Err(ContextError::OfflineCpu(cpu));
        }
        let Some(slot) = space.slot(self.domain) else {
            crate::log_error!(target: "asid", "{} has no slot for domain {}", space.id(), self.domain);
            return Err(ContextError::MissingSlot { space: space.id(), domain: self.domain });
        };

        if let Some(hit) = self.cached(cpu, slot) {
            ContextStats::bump(&self.stats.fast_path);
            return Ok(hit);
        }

        let mut inner = self.inner.lock();
        // Another thread of the same space may have won the race.
        if let Some(hit) = self.cached(cpu, slot) {
            ContextStats::bump(&self.stats.fast_path);
            return Ok(hit);
        }

        if let Some(id) = self.scan(&mut inner) {
            let generation = self.assign(&mut inner, cpu, id, space.id(), slot);
            ContextStats::bump(&self.stats.fresh);
            crate::log_trace!(target: "asid", "{} -> {} gen={}", space.id(), id, generation.as_raw());
            return Ok(Acquisition { id, generation, kind: AcquireKind::Fresh });
        }

        // Wraparound: every usable id is taken.
        inner.next_hint = self.config.first_usable() as usize;
        if self.config.policy == RecyclePolicy::VersionBump {
            self.rollover(&mut inner, cpu, shootdown);
        }
        if let Some(id) = self.scan(&mut inner) {
            let generation = self.assign(&mut inner, cpu, id, space.id(), slot);
            return Ok(Acquisition { id, generation, kind: AcquireKind::Rollover });
        }

        let (id, victim) = self.steal(&mut inner, cpu, shootdown);
        let generation = self.assign(&mut inner, cpu, id, space.id(), slot);
        Ok(Acquisition { id, generation, kind: AcquireKind::Stolen { victim } })
    }

    /// Returns the id held by `space` to the pool on teardown.
    ///
    /// A no-op when the id has since been stolen or recycled by someone else.
    pub fn release(&self, space: &AddressSpace) {
        if space.is_kernel() {
            return;
        }
        let Some(slot) = space.slot(self.domain) else {
            return;
        };
        let Some((id, generation)) = slot.load() else {
            return;
        };
        let mut inner = self.inner.lock();
        let owned = self.is_current(id, generation)
            && match self.config.policy {
                RecyclePolicy::OwnerTracking => inner
                    .owners
                    .get(id.as_index())
                    .and_then(|o| o.as_ref())
                    .map(|o| Arc::ptr_eq(&o.slot, slot))
                    .unwrap_or(false),
                RecyclePolicy::VersionBump => true,
            };
        if owned {
            inner.bitmap.clear(id.as_index());
            self.generations[id.as_index()].store(0, Ordering::Release);
            if let Some(owner) = inner.owners.get_mut(id.as_index()) {
                *owner = None;
            }
            ContextStats::bump(&self.stats.releases);
        } else {
            ContextStats::bump(&self.stats.stale_releases);
        }
        slot.clear_if(id, generation);
    }

    /// Records `id` as loaded on `cpu`; ids loaded somewhere survive rollovers.
    pub fn mark_active(&self, cpu: CpuId, id: ContextId) {
        if let Some(lane) = self.lane(cpu) {
            lane.active.store(id.as_raw(), Ordering::SeqCst);
        }
    }

    /// Id last recorded as loaded on `cpu`.
    pub fn active_on(&self, cpu: CpuId) -> Option<ContextId> {
        self.lane(cpu)
            .map(|lane| lane.active.load(Ordering::Acquire))
            .filter(|&raw| raw >= self.config.reserved)
            .map(ContextId::from_raw)
    }

    /// Local invalidation `cpu` owes before loading `id`, consuming the debt.
    pub fn take_flush(&self, cpu: CpuId, id: ContextId) -> Option<FlushScope> {
        let lane = self.lane(cpu)?;
        if lane.flush_all.swap(false, Ordering::AcqRel) {
            lane.clear_all_stale();
            return Some(FlushScope::All);
        }
        lane.take_stale(id).then_some(FlushScope::Context(id))
    }

    fn lane(&self, cpu: CpuId) -> Option<&Lane> {
        self.lanes.iter().find(|lane| lane.cpu == cpu)
    }

    /// Lock-free hit check. Publishes the id as active before re-validating it, pairing
    /// with `try_revoke`, so a concurrent steal or rollover either sees the CPU using the
    /// id or this check sees the revocation.
    fn cached(&self, cpu: CpuId, slot: &ContextSlot) -> Option<Acquisition> {
        let (id, generation) = slot.load()?;
        if !self.is_current(id, generation) {
            return None;
        }
        if let Some(lane) = self.lane(cpu) {
            lane.active.store(id.as_raw(), Ordering::SeqCst);
        }
        let still = self.generations[id.as_index()].load(Ordering::SeqCst) == generation.as_raw();
        still.then_some(Acquisition { id, generation, kind: AcquireKind::Cached })
    }

    fn loaded_elsewhere(&self, index: usize, except: Option<CpuId>) -> bool {
        self.lanes.iter().any(|lane| {
            Some(lane.cpu) != except && lane.active.load(Ordering::SeqCst) as usize == index
        })
    }

    /// Invalidates the current generation of `index` unless a CPU (other than `except`)
    /// has it loaded; returns the revoked generation.
    fn try_revoke(&self, index: usize, except: Option<CpuId>) -> Option<u64> {
        let old = self.generations[index].swap(0, Ordering::SeqCst);
        if self.loaded_elsewhere(index, except) {
            self.generations[index].store(old, Ordering::SeqCst);
            return None;
        }
        Some(old)
    }

    fn scan(&self, inner: &mut Inner) -> Option<ContextId> {
        let floor = self.config.first_usable() as usize;
        inner.bitmap.find_first_clear(inner.next_hint, floor).map(|i| ContextId::from_raw(i as u32))
    }

    fn assign(
        &self,
        inner: &mut Inner,
        cpu: CpuId,
        id: ContextId,
        space: SpaceId,
        slot: &Arc<ContextSlot>,
    ) -> Generation {
        let index = id.as_index();
        let generation = inner.next_generation;
        inner.next_generation = generation.next();
        if inner.next_generation == Generation::FIRST {
            crate::log_info!(target: "asid", "generation wrap domain={}", self.domain);
        }
        inner.bitmap.set(index);
        inner.next_hint = if index + 1 >= self.config.capacity() {
            self.config.first_usable() as usize
        } else {
            index + 1
        };
        self.generations[index].store(generation.as_raw(), Ordering::SeqCst);
        if let Some(owner) = inner.owners.get_mut(index) {
            *owner = Some(Owner { space, slot: Arc::clone(slot), generation });
        }
        slot.store(id, generation);
        if let Some(lane) = self.lane(cpu) {
            lane.active.store(id.as_raw(), Ordering::SeqCst);
        }
        // The local CPU is told through `Acquisition::needs_local_flush`.
        for lane in self.lanes.iter().filter(|lane| lane.cpu != cpu) {
            lane.mark_stale(id);
        }
        generation
    }

    /// Frees every id not loaded on some CPU and schedules a full flush everywhere.
    fn rollover<S: TlbShootdown + ?Sized>(&self, inner: &mut Inner, cpu: CpuId, shootdown: &S) {
        let floor = self.config.first_usable() as usize;
        let mut kept = 0usize;
        for index in floor..self.config.capacity() {
            if !inner.bitmap.test(index) {
                continue;
            }
            if self.try_revoke(index, None).is_some() {
                inner.bitmap.clear(index);
            } else {
                kept += 1;
            }
        }
        for lane in self.lanes.iter() {
            lane.flush_all.store(true, Ordering::Release);
        }
        shootdown.cross_call_invalidate(self.members.without(cpu), FlushScope::All);
        ContextStats::bump(&self.stats.rollovers);
        crate::log_info!(
            target: "asid",
            "rollover domain={} kept={} gen={}",
            self.domain,
            kept,
            inner.next_generation.as_raw()
        );
    }

    /// Picks the least-recently-acquired id not loaded on another CPU and evicts its holder.
    fn steal<S: TlbShootdown + ?Sized>(
        &self,
        inner: &mut Inner,
        cpu: CpuId,
        shootdown: &S,
    ) -> (ContextId, Option<SpaceId>) {
        let floor = self.config.first_usable() as usize;
        // Oldest assignment first, measured behind the next generation so a wrap keeps the order.
        let next = inner.next_generation.as_raw();
        let mut candidates: Vec<(Reverse<u64>, usize)> = (floor..self.config.capacity())
            .map(|index| {
                let generation = self.generations[index].load(Ordering::Acquire);
                (Reverse(next.wrapping_sub(generation) & Generation::MAX.as_raw()), index)
            })
            .collect();
        candidates.sort_unstable();
        let index = candidates
            .iter()
            .map(|&(_, index)| index)
            .find(|&index| self.try_revoke(index, Some(cpu)).is_some())
            .or_else(|| candidates.first().map(|&(_, index)| index))
            .unwrap_or(floor);
        let id = ContextId::from_raw(index as u32);

        let victim = inner.owners.get_mut(index).and_then(|owner| owner.take()).map(|owner| {
            owner.slot.clear_if(id, owner.generation);
            owner.space
        });
        shootdown.cross_call_invalidate(self.members.without(cpu), FlushScope::Context(id));
        ContextStats::bump(&self.stats.steals);
        match victim {
            Some(space) => crate::log_warn!(
                target: "asid",
                "steal {} from {} domain={} (live spaces exceed {} ids)",
                id,
                space,
                self.domain,
                self.usable()
            ),
            None => crate::log_warn!(target: "asid", "steal {} domain={}", id, self.domain),
        }
        (id, victim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::NoShootdown;
    use crate::mm::region::RegionMap;
    use crate::types::RootTable;

    fn space() -> AddressSpace {
        AddressSpace::user(RootTable::from_phys(0x8000_0000), 1, RegionMap::new(0))
    }

    fn allocator(config: AllocatorConfig) -> ContextAllocator {
        ContextAllocator::new(config, 0, CpuSet::first(config.cpus)).unwrap()
    }

    #[test]
    fn fresh_then_cached() {
        let alloc = allocator(AllocatorConfig::sv39());
        let a = space();
        let first = alloc.acquire(CpuId::BOOT, &a, &NoShootdown).unwrap();
        assert_eq!(first.kind, AcquireKind::Fresh);
        assert_eq!(first.id, ContextId::from_raw(1));
        assert!(first.needs_local_flush());
        let again = alloc.acquire(CpuId::BOOT, &a, &NoShootdown).unwrap();
        assert_eq!(again.kind, AcquireKind::Cached);
        assert_eq!(again.id, first.id);
        assert!(!again.needs_local_flush());
        assert_eq!(alloc.stats().snapshot().fast_path, 1);
        assert_eq!(alloc.in_use(), 1);
    }

    #[test]
    fn kernel_space_never_touches_bitmap() {
        let alloc = allocator(AllocatorConfig::embedded_4bit());
        let kernel = AddressSpace::kernel(RootTable::from_phys(0x8020_0000));
        let acq = alloc.acquire(CpuId::BOOT, &kernel, &NoShootdown).unwrap();
        assert_eq!(acq.id, ContextId::KERNEL);
        assert_eq!(acq.kind, AcquireKind::Reserved);
        assert_eq!(alloc.in_use(), 0);
    }

    #[test]
    fn release_returns_id_and_ignores_stolen() {
        let alloc = allocator(AllocatorConfig::embedded_4bit());
        let spaces: Vec<_> = (0..15).map(|_| space()).collect();
        for s in &spaces {
            let _ = alloc.acquire(CpuId::BOOT, s, &NoShootdown).unwrap();
        }
        assert_eq!(alloc.in_use(), 15);
        let late = space();
        let stolen = alloc.acquire(CpuId::BOOT, &late, &NoShootdown).unwrap();
        assert_eq!(stolen.kind, AcquireKind::Stolen { victim: Some(spaces[0].id()) });
        assert_eq!(spaces[0].context_id(0), None);

        // The victim's cached id is gone, so its release must not free `late`'s id.
        alloc.release(&spaces[0]);
        assert_eq!(alloc.in_use(), 15);
        alloc.release(&late);
        assert_eq!(alloc.in_use(), 14);
        assert_eq!(late.context_id(0), None);
        assert_eq!(alloc.stats().snapshot().releases, 1);
    }

    #[test]
    fn version_bump_rollover_keeps_active_ids() {
        let cfg = AllocatorConfig::embedded_4bit().with_policy(RecyclePolicy::VersionBump);
        let alloc = allocator(cfg);
        let spaces: Vec<_> = (0..15).map(|_| space()).collect();
        let mut last = None;
        for s in &spaces {
            last = Some(alloc.acquire(CpuId::BOOT, s, &NoShootdown).unwrap());
        }
        let running = last.unwrap();
        alloc.mark_active(CpuId::BOOT, running.id);

        let newcomer = space();
        let acq = alloc.acquire(CpuId::BOOT, &newcomer, &NoShootdown).unwrap();
        assert_eq!(acq.kind, AcquireKind::Rollover);
        assert_ne!(acq.id, running.id);
        // The running space keeps its id; everyone else went stale.
        assert_eq!(
            alloc.acquire(CpuId::BOOT, &spaces[14], &NoShootdown).unwrap().kind,
            AcquireKind::Cached
        );
        let (id0, gen0) = spaces[0].context(0).unwrap();
        assert!(!alloc.is_current(id0, gen0));
        assert_eq!(alloc.take_flush(CpuId::BOOT, acq.id), Some(FlushScope::All));
        assert_eq!(alloc.take_flush(CpuId::BOOT, acq.id), None);
        assert_eq!(alloc.stats().snapshot().rollovers, 1);
    }

    #[test]
    fn fresh_assignment_marks_other_cpus_stale() {
        let cfg = AllocatorConfig::sv39().with_cpus(2);
        let alloc = allocator(cfg);
        let a = space();
        let acq = alloc.acquire(CpuId::BOOT, &a, &NoShootdown).unwrap();
        let other = CpuId::from_raw(1);
        assert_eq!(alloc.take_flush(CpuId::BOOT, acq.id), None);
        assert_eq!(alloc.take_flush(other, acq.id), Some(FlushScope::Context(acq.id)));
        assert_eq!(alloc.take_flush(other, acq.id), None);
    }

    #[test]
    fn user_space_never_gets_reserved_id_on_error() {
        let alloc = allocator(AllocatorConfig::sv39());
        let a = space();
        assert_eq!(
            alloc.acquire(CpuId::from_raw(3), &a, &NoShootdown),
            Err(ContextError::OfflineCpu(CpuId::from_raw(3)))
        );
        let other_domain = ContextAllocator::new(AllocatorConfig::sv39(), 1, CpuSet::first(1)).unwrap();
        assert_eq!(
            other_domain.acquire(CpuId::BOOT, &a, &NoShootdown),
            Err(ContextError::MissingSlot { space: a.id(), domain: 1 })
        );
        assert_eq!(alloc.in_use(), 0);
        assert_eq!(a.context(0), None);
    }

    #[test]
    fn generation_wrap_keeps_ids_valid_and_lru_order() {
        let alloc = allocator(AllocatorConfig::embedded_4bit());
        alloc.inner.lock().next_generation = Generation::from_raw(Generation::MAX.as_raw() - 13);
        let spaces: Vec<_> = (0..15).map(|_| space()).collect();
        for s in &spaces {
            let _ = alloc.acquire(CpuId::BOOT, s, &NoShootdown).unwrap();
        }
        // The last two assignments took MAX and then wrapped to FIRST.
        assert_eq!(spaces[13].context(0).map(|(_, g)| g), Some(Generation::MAX));
        assert_eq!(spaces[14].context(0).map(|(_, g)| g), Some(Generation::FIRST));
        for s in &spaces {
            let again = alloc.acquire(CpuId::BOOT, s, &NoShootdown).unwrap();
            assert_eq!(again.kind, AcquireKind::Cached);
        }
        // The oldest holder is still the first assignment, not the wrapped one.
        let late = space();
        let stolen = alloc.acquire(CpuId::BOOT, &late, &NoShootdown).unwrap();
        assert_eq!(stolen.kind, AcquireKind::Stolen { victim: Some(spaces[0].id()) });
    }

    #[test]
    fn rejects_more_cpus_than_ids() {
        let cfg = AllocatorConfig { id_bits: 2, ..AllocatorConfig::sv39() }.with_cpus(4);
        assert!(matches!(
            ContextAllocator::new(cfg, 0, CpuSet::first(4)),
            Err(ConfigError::CpuCount)
        ));
    }
}

// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Hardware seams for TLB maintenance and context loading
//! OWNERS: @kernel-mm-team
//! PUBLIC API: TlbShootdown, MmuOps, FlushScope, NoShootdown, Sv39Mmu (kernel target)
//! DEPENDS_ON: riscv (satp, sfence.vma), sbi-rt (remote fences) on riscv64-none only
//! INVARIANTS: cross-calls only mark remote TLB state stale; they never stop the target CPUs

use crate::types::{ContextId, CpuSet, RootTable};

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod sv39;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub use sv39::Sv39Mmu;

/// Which TLB entries an invalidation covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushScope {
    /// Every non-global entry.
    All,
    /// Entries tagged with one context id.
    Context(ContextId),
}

/// Cross-CPU invalidation primitive consumed by the allocator when it recycles ids.
pub trait TlbShootdown {
    fn cross_call_invalidate(&self, cpus: CpuSet, scope: FlushScope);
}

/// Per-CPU translation control, driven by the scheduler through `switch_mm`.
pub trait MmuOps: TlbShootdown {
    fn local_invalidate(&self, scope: FlushScope);

    /// Programs the translation-control registers with `id` and `root`.
    fn load_context_into_hardware(&self, id: ContextId, root: RootTable);
}

/// Shootdown for uniprocessor or per-CPU namespaces, where no peer can cache the id.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoShootdown;

impl TlbShootdown for NoShootdown {
    fn cross_call_invalidate(&self, _cpus: CpuSet, _scope: FlushScope) {}
}

// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Scheduler entry: make an address space current on a CPU.

use super::address_space::AddressSpace;
use super::context::{AcquireKind, Acquisition, ContextError};
use super::domains::ContextDomains;
use crate::hal::{FlushScope, MmuOps};
use crate::types::{ContextId, CpuId};

/// Acquires a context for `space` on `cpu`, settles any TLB debt and loads it.
///
/// Flush order: a pending full flush (rollover) wins; otherwise the id is flushed when
/// it changed hands locally or was reassigned since this CPU last used it.
///
/// On error the hardware is left untouched and the caller keeps running its current space.
pub fn switch_mm<M: MmuOps + ?Sized>(
    domains: &ContextDomains,
    cpu: CpuId,
    space: &AddressSpace,
    mmu: &M,
) -> Result<Acquisition, ContextError> {
    let acquisition = domains.acquire(cpu, space, mmu)?;
    if let Some(allocator) = domains.allocator(cpu) {
        if acquisition.kind == AcquireKind::Reserved {
            allocator.mark_active(cpu, ContextId::KERNEL);
        }
        match allocator.take_flush(cpu, acquisition.id) {
            Some(scope) => mmu.local_invalidate(scope),
            None if acquisition.needs_local_flush() => {
                mmu.local_invalidate(FlushScope::Context(acquisition.id))
            }
            None => {}
        }
    }
    mmu.load_context_into_hardware(acquisition.id, space.root_table());
    Ok(acquisition)
}

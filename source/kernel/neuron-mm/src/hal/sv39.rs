// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sv39 translation control via `satp`, local `sfence.vma` and SBI remote fences.

use riscv::register::satp::{self, Mode};
use sbi_rt as sbi;

use super::{FlushScope, MmuOps, TlbShootdown};
use crate::types::{ContextId, CpuSet, RootTable};

/// Sv39 MMU on QEMU `virt`; logical CPU ids equal hart ids.
#[derive(Clone, Copy, Debug, Default)]
pub struct Sv39Mmu;

impl TlbShootdown for Sv39Mmu {
    fn cross_call_invalidate(&self, cpus: CpuSet, scope: FlushScope) {
        if cpus.is_empty() {
            return;
        }
        let mask = cpus.mask() as usize;
        let ret = match scope {
            FlushScope::All => sbi::remote_sfence_vma(mask, 0, 0, usize::MAX),
            FlushScope::Context(id) => sbi::remote_sfence_vma_asid(mask, 0, 0, usize::MAX, id.as_index()),
        };
        if ret.error != 0 {
            crate::log_error!(
                target: "tlb",
                "remote sfence failed mask=0x{:x} err=0x{:x}",
                mask,
                ret.error
            );
        }
    }
}

impl MmuOps for Sv39Mmu {
    fn local_invalidate(&self, scope: FlushScope) {
        match scope {
            // SAFETY: fences only discard cached translations.
            FlushScope::All => unsafe { core::arch::asm!("sfence.vma", options(nostack)) },
            FlushScope::Context(id) => unsafe {
                core::arch::asm!("sfence.vma x0, {0}", in(reg) id.as_index(), options(nostack))
            },
        }
    }

    fn load_context_into_hardware(&self, id: ContextId, root: RootTable) {
        // SAFETY: `root` is a live Sv39 root that maps the kernel image globally.
        unsafe { satp::set(Mode::Sv39, id.as_index(), root.ppn()) };
    }
}

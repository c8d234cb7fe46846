// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Architecture-neutral page-fault dispatch
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: fault/tests.rs (scenarios) + fault/tests_prop.rs (permission matrix) + tests/fault_path.rs
//! PUBLIC API: Dispatcher, FaultPlatform, FaultEvent, FaultOutcome, FaultState, permits()
//! DEPENDS_ON: mm::region (MemoryRegion, RegionFlags), mm::address_space, config::FaultConfig
//! INVARIANTS:
//!   - Kernel-mode faults consult the fixup table at most once per dispatch
//!   - User-mode faults never produce KernelFixup/KernelFatal
//!   - Resolver retries are bounded by FaultConfig::max_retries

mod dispatcher;
mod stats;

pub use dispatcher::{Dispatcher, FaultTrace, TRACE_CAPACITY};
pub use stats::{FaultStats, FaultStatsSnapshot};

use core::fmt;

use crate::mm::address_space::AddressSpace;
use crate::mm::region::{MemoryRegion, RegionFlags, ResourceLimitError};
use crate::types::{ThreadId, VirtAddr};

/// Kind of memory access that trapped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Read,
    Write,
    InstructionFetch,
}

/// Raw trap parameters, built by the trap entry on the faulting CPU's stack.
#[derive(Clone, Copy, Debug)]
pub struct FaultEvent<F> {
    pub address: VirtAddr,
    pub access: AccessKind,
    pub is_user_mode: bool,
    pub trap_pc: usize,
    pub thread: ThreadId,
    /// Fault taken while servicing an interrupt; there is no process context to use.
    pub in_interrupt: bool,
    /// User stack pointer at the time of the trap, when the platform knows it.
    pub stack_pointer: Option<usize>,
    /// Saved trap frame; only handed back to the platform for fixup and diagnostics.
    pub frame: F,
}

/// States of the dispatch state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum FaultState {
    #[default]
    Start,
    NoContext,
    RegionLookup,
    ExpandStack,
    PermissionCheck,
    Resolve,
    Success,
    SigSegv,
    KernelOops,
    SigBus,
    OutOfMemory,
}

impl FaultState {
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            FaultState::Success
                | FaultState::SigSegv
                | FaultState::KernelOops
                | FaultState::SigBus
                | FaultState::OutOfMemory
        )
    }
}

/// How the faulting context resumes after a handled fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resume {
    /// Re-execute the faulting instruction.
    Retry,
    /// Continue at `next_pc`, skipping the faulting instruction.
    Skip { next_pc: usize },
}

/// `si_code` for SIGSEGV.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegvCode {
    /// No mapping at the address.
    MapErr,
    /// Mapping exists but does not permit the access.
    AccErr,
}

/// Signal handed to [`FaultPlatform::deliver_signal`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalKind {
    Segv(SegvCode),
    Bus,
    Kill,
}

/// What happens to the kernel after an unrecoverable kernel-mode fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FatalAction {
    /// Terminate only the faulting kernel thread.
    KillContext,
    /// Stop the machine.
    Halt,
}

/// Result of dispatching one fault. Trap entry glue must handle every variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub enum FaultOutcome {
    Success(Resume),
    SigSegv { code: SegvCode },
    SigBus,
    /// The user thread was killed for lack of memory.
    OutOfMemory,
    /// Resume the kernel at the exception-table landing pad.
    KernelFixup { landing_pc: usize },
    KernelFatal { action: FatalAction },
}

impl fmt::Display for FaultOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultOutcome::Success(Resume::Retry) => f.write_str("resolved"),
            FaultOutcome::Success(Resume::Skip { next_pc }) => write!(f, "skipped to {:#x}", next_pc),
            FaultOutcome::SigSegv { code } => write!(f, "SIGSEGV ({:?})", code),
            FaultOutcome::SigBus => f.write_str("SIGBUS"),
            FaultOutcome::OutOfMemory => f.write_str("killed (out of memory)"),
            FaultOutcome::KernelFixup { landing_pc } => write!(f, "fixup -> {:#x}", landing_pc),
            FaultOutcome::KernelFatal { action } => write!(f, "fatal kernel fault ({:?})", action),
        }
    }
}

/// Answer of the generic fault resolver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolveResult {
    /// The page is present now; `major` when I/O was needed.
    Resolved { major: bool },
    /// Someone else changed the mapping concurrently; look the region up again.
    Retry,
    /// Could not handle, not due to memory exhaustion.
    StructuralFailure,
    OutOfMemory,
}

/// Broad class of a decoded faulting instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsnClass {
    Load,
    Prefetch,
    Store,
    Other,
}

/// Faulting instruction as decoded by the platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodedInsn {
    pub class: InsnClass,
    /// Destination is the hardwired zero register.
    pub dest_is_zero_reg: bool,
    /// Encoded length in bytes.
    pub length: usize,
}

impl DecodedInsn {
    /// Loads and prefetches into the zero register are architecturally no-ops.
    pub fn is_zero_register_prefetch(&self) -> bool {
        self.dest_is_zero_reg && matches!(self.class, InsnClass::Load | InsnClass::Prefetch)
    }
}

/// Platform collaborators consumed by the dispatcher; one implementation per target.
///
/// Region lookup and stack growth default to the address space's own [`RegionMap`].
///
/// [`RegionMap`]: crate::mm::region::RegionMap
pub trait FaultPlatform {
    /// Saved register state carried in [`FaultEvent::frame`].
    type Frame: fmt::Debug;

    /// First region whose end lies above `address` (it may start above it).
    fn find_region(&self, space: &AddressSpace, address: VirtAddr) -> Option<MemoryRegion> {
        space.regions().find(address)
    }

    /// Grows the `GROWS_DOWN` region down to cover `address`; returns the grown region.
    fn expand_region_downward(
        &self,
        space: &AddressSpace,
        region: &MemoryRegion,
        address: VirtAddr,
    ) -> Result<MemoryRegion, ResourceLimitError> {
        space.regions().expand_downward(region, address)
    }

    /// Populates the page table for `address`. May sleep.
    fn resolve_fault(
        &self,
        space: &AddressSpace,
        region: &MemoryRegion,
        address: VirtAddr,
        is_write: bool,
    ) -> ResolveResult;

    /// Exception-table lookup: landing pc registered for `trap_pc`.
    fn lookup_fixup(&self, trap_pc: usize) -> Option<usize>;

    fn deliver_signal(&self, thread: ThreadId, signal: SignalKind);

    fn decode_faulting_insn(&self, _event: &FaultEvent<Self::Frame>) -> Option<DecodedInsn> {
        None
    }

    /// Diagnostic dump for a fatal kernel fault.
    fn report_oops(&self, _event: &FaultEvent<Self::Frame>, _action: FatalAction) {}
}

/// Permission matrix applied in `PermissionCheck`.
///
/// Reads are allowed on write-only mappings; fetches need `EXECUTE`, writes need `WRITE`.
#[inline]
pub fn permits(access: AccessKind, flags: RegionFlags) -> bool {
    match access {
        AccessKind::Read => flags.intersects(RegionFlags::READ | RegionFlags::WRITE),
        AccessKind::Write => flags.contains(RegionFlags::WRITE),
        AccessKind::InstructionFetch => flags.contains(RegionFlags::EXECUTE),
    }
}

#[cfg(test)]
mod tests_prop;

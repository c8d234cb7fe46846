// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! The fault state machine: one `match` per transition, no shared mutable state
//! besides counters.

use core::ops::ControlFlow;

use super::{
    permits, AccessKind, FatalAction, FaultEvent, FaultOutcome, FaultPlatform, FaultState,
    FaultStats, ResolveResult, Resume, SegvCode, SignalKind,
};
use crate::config::{ConfigError, FaultConfig};
use crate::mm::address_space::AddressSpace;
use crate::mm::region::MemoryRegion;

/// States recorded per dispatch before the trace stops growing.
pub const TRACE_CAPACITY: usize = 32;

/// Ordered list of the states one dispatch visited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultTrace {
    states: [FaultState; TRACE_CAPACITY],
    len: usize,
    truncated: bool,
}

impl FaultTrace {
    const fn new() -> Self {
        Self { states: [FaultState::Start; TRACE_CAPACITY], len: 0, truncated: false }
    }

    fn push(&mut self, state: FaultState) {
        match self.states.get_mut(self.len) {
            Some(slot) => {
                *slot = state;
                self.len += 1;
            }
            None => self.truncated = true,
        }
    }

    pub fn states(&self) -> &[FaultState] {
        &self.states[..self.len]
    }

    /// How many times `state` was entered.
    pub fn visits(&self, state: FaultState) -> usize {
        self.states().iter().filter(|&&s| s == state).count()
    }

    pub fn last(&self) -> Option<FaultState> {
        self.states().last().copied()
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }
}

/// Internal state with the data each transition needs.
#[derive(Clone, Copy, Debug)]
enum Step {
    Start,
    NoContext,
    RegionLookup,
    ExpandStack(MemoryRegion),
    PermissionCheck(MemoryRegion),
    Resolve(MemoryRegion),
    Success(Resume),
    SigSegv(SegvCode),
    KernelOops,
    SigBus,
    OutOfMemory,
}

impl Step {
    fn state(&self) -> FaultState {
        match self {
            Step::Start => FaultState::Start,
            Step::NoContext => FaultState::NoContext,
            Step::RegionLookup => FaultState::RegionLookup,
            Step::ExpandStack(_) => FaultState::ExpandStack,
            Step::PermissionCheck(_) => FaultState::PermissionCheck,
            Step::Resolve(_) => FaultState::Resolve,
            Step::Success(_) => FaultState::Success,
            Step::SigSegv(_) => FaultState::SigSegv,
            Step::KernelOops => FaultState::KernelOops,
            Step::SigBus => FaultState::SigBus,
            Step::OutOfMemory => FaultState::OutOfMemory,
        }
    }
}

/// Fault dispatcher bound to one platform's collaborators.
pub struct Dispatcher<P: FaultPlatform> {
    platform: P,
    config: FaultConfig,
    stats: FaultStats,
}

impl<P: FaultPlatform> Dispatcher<P> {
    pub fn new(platform: P, config: FaultConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { platform, config, stats: FaultStats::default() })
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn config(&self) -> &FaultConfig {
        &self.config
    }

    pub fn stats(&self) -> &FaultStats {
        &self.stats
    }

    /// Handles one fault taken while `space` was current (`None` for kernel threads).
    pub fn dispatch(&self, event: &FaultEvent<P::Frame>, space: Option<&AddressSpace>) -> FaultOutcome {
        self.dispatch_traced(event, space).0
    }

    /// Like [`dispatch`](Self::dispatch), also returning the visited states.
    pub fn dispatch_traced(
        &self,
        event: &FaultEvent<P::Frame>,
        space: Option<&AddressSpace>,
    ) -> (FaultOutcome, FaultTrace) {
        self.stats.on_fault();
        let mut trace = FaultTrace::new();
        let mut retries = 0u8;
        let mut step = Step::Start;
        let outcome = loop {
            trace.push(step.state());
            match self.advance(event, space, &mut retries, step) {
                ControlFlow::Continue(next) => step = next,
                ControlFlow::Break(outcome) => break outcome,
            }
        };
        #[cfg(feature = "fault_trace_ring")]
        crate::diag::ring::record(event.address, event.trap_pc, event.access, outcome);
        (outcome, trace)
    }

    fn advance(
        &self,
        event: &FaultEvent<P::Frame>,
        space: Option<&AddressSpace>,
        retries: &mut u8,
        step: Step,
    ) -> ControlFlow<FaultOutcome, Step> {
        use ControlFlow::{Break, Continue};

        match step {
            Step::Start => Continue(self.start(event, space)),
            Step::NoContext => Continue(self.bad_area(event, SegvCode::MapErr)),
            Step::RegionLookup => {
                Continue(space.map_or(Step::NoContext, |space| self.lookup(event, space)))
            }
            Step::ExpandStack(region) => {
                Continue(space.map_or(Step::NoContext, |space| self.expand(event, space, &region)))
            }
            Step::PermissionCheck(region) => Continue(if permits(event.access, region.flags) {
                Step::Resolve(region)
            } else {
                self.bad_area(event, SegvCode::AccErr)
            }),
            Step::Resolve(region) => Continue(
                space.map_or(Step::NoContext, |space| self.resolve(event, space, &region, retries)),
            ),
            Step::Success(resume) => {
                if matches!(resume, Resume::Skip { .. }) {
                    self.stats.on_skip();
                }
                Break(FaultOutcome::Success(resume))
            }
            Step::SigSegv(code) => {
                self.stats.on_segv();
                self.platform.deliver_signal(event.thread, SignalKind::Segv(code));
                Break(FaultOutcome::SigSegv { code })
            }
            Step::SigBus if event.is_user_mode => {
                self.stats.on_bus();
                self.platform.deliver_signal(event.thread, SignalKind::Bus);
                Break(FaultOutcome::SigBus)
            }
            Step::OutOfMemory if event.is_user_mode => {
                self.stats.on_oom();
                crate::log_warn!(
                    target: "fault",
                    "out of memory at {:#x}; killing thread {}",
                    event.address,
                    event.thread.as_raw()
                );
                self.platform.deliver_signal(event.thread, SignalKind::Kill);
                Break(FaultOutcome::OutOfMemory)
            }
            Step::SigBus | Step::OutOfMemory => Continue(Step::KernelOops),
            Step::KernelOops => Break(self.oops(event)),
        }
    }

    fn start(&self, event: &FaultEvent<P::Frame>, space: Option<&AddressSpace>) -> Step {
        if self.config.zero_register_prefetch {
            if let Some(insn) = self.platform.decode_faulting_insn(event) {
                if insn.is_zero_register_prefetch() {
                    let next_pc = event.trap_pc.wrapping_add(insn.length);
                    return Step::Success(Resume::Skip { next_pc });
                }
            }
        }
        match space {
            Some(space)
                if !space.is_kernel()
                    && !event.in_interrupt
                    && event.address.raw() < self.config.user_ceiling =>
            {
                Step::RegionLookup
            }
            _ => Step::NoContext,
        }
    }

    fn lookup(&self, event: &FaultEvent<P::Frame>, space: &AddressSpace) -> Step {
        match self.platform.find_region(space, event.address) {
            Some(region) if region.contains(event.address) => Step::PermissionCheck(region),
            Some(region) if self.stack_candidate(event, &region) => Step::ExpandStack(region),
            _ => self.bad_area(event, SegvCode::MapErr),
        }
    }

    /// Whether `region` may grow down to cover the faulting address.
    fn stack_candidate(&self, event: &FaultEvent<P::Frame>, region: &MemoryRegion) -> bool {
        if !region.grows_down() || region.start <= event.address {
            return false;
        }
        if region.start.raw() - event.address.page_floor().raw() > self.config.stack_guard_gap {
            return false;
        }
        match (event.is_user_mode, event.stack_pointer, self.config.stack_pointer_slack) {
            // Accesses far below the stack pointer are wild pointers, not pushes.
            (true, Some(sp), Some(slack)) => event.address.raw().saturating_add(slack) >= sp,
            _ => true,
        }
    }

    fn expand(&self, event: &FaultEvent<P::Frame>, space: &AddressSpace, region: &MemoryRegion) -> Step {
        match self.platform.expand_region_downward(space, region, event.address) {
            Ok(grown) if grown.contains(event.address) => {
                self.stats.on_stack_growth();
                crate::log_debug!(
                    target: "fault",
                    "{} stack [{:#x}, {:#x}) grown for {:#x}",
                    space.id(),
                    grown.start,
                    grown.end,
                    event.address
                );
                Step::PermissionCheck(grown)
            }
            Ok(_) => self.bad_area(event, SegvCode::MapErr),
            Err(err) => {
                crate::log_debug!(target: "fault", "stack growth to {:#x} refused: {}", event.address, err);
                self.bad_area(event, SegvCode::MapErr)
            }
        }
    }

    fn resolve(
        &self,
        event: &FaultEvent<P::Frame>,
        space: &AddressSpace,
        region: &MemoryRegion,
        retries: &mut u8,
    ) -> Step {
        let is_write = event.access == AccessKind::Write;
        match self.platform.resolve_fault(space, region, event.address, is_write) {
            ResolveResult::Resolved { major } => {
                self.stats.on_resolved();
                if major {
                    self.stats.on_major();
                }
                Step::Success(Resume::Retry)
            }
            ResolveResult::Retry if *retries < self.config.max_retries => {
                *retries += 1;
                self.stats.on_retry();
                Step::RegionLookup
            }
            // Out of retries: let the instruction fault again from user context.
            ResolveResult::Retry => Step::Success(Resume::Retry),
            ResolveResult::StructuralFailure => Step::SigBus,
            ResolveResult::OutOfMemory => Step::OutOfMemory,
        }
    }

    /// Bad address: a signal for user mode, the fixup path for kernel mode.
    fn bad_area(&self, event: &FaultEvent<P::Frame>, code: SegvCode) -> Step {
        if event.is_user_mode {
            Step::SigSegv(code)
        } else {
            Step::KernelOops
        }
    }

    fn oops(&self, event: &FaultEvent<P::Frame>) -> FaultOutcome {
        if let Some(landing_pc) = self.platform.lookup_fixup(event.trap_pc) {
            self.stats.on_fixup();
            crate::log_debug!(
                target: "fault",
                "fixup pc={:#x} -> {:#x} addr={:#x}",
                event.trap_pc,
                landing_pc,
                event.address
            );
            return FaultOutcome::KernelFixup { landing_pc };
        }
        let action = if event.in_interrupt || self.config.panic_on_oops {
            FatalAction::Halt
        } else {
            FatalAction::KillContext
        };
        self.stats.on_fatal();
        crate::log_error!(
            target: "fault",
            "unhandled kernel {:?} fault addr={:#x} pc={:#x} thread={} irq={} action={:?} frame={:?}",
            event.access,
            event.address,
            event.trap_pc,
            event.thread.as_raw(),
            event.in_interrupt,
            action,
            event.frame
        );
        self.platform.report_oops(event, action);
        FaultOutcome::KernelFatal { action }
    }
}

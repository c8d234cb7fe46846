// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Property-based tests for the fault permission matrix
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - PermissionCheck decision for every (access, capability set) pair
//!   - User-mode faults never escalate to kernel outcomes
//!
//! TEST_SCENARIOS:
//!   - matrix_matches_table(): permits() equals the reference table
//!   - dispatch_follows_matrix(): a covered user fault resolves iff permitted, else AccErr
//!   - user_faults_stay_in_user(): arbitrary user faults never yield KernelFixup/KernelFatal

use proptest::prelude::*;

use super::*;
use crate::config::FaultConfig;
use crate::mm::region::RegionMap;
use crate::types::RootTable;

struct AlwaysResolves;

impl FaultPlatform for AlwaysResolves {
    type Frame = ();

    fn resolve_fault(&self, _: &AddressSpace, _: &MemoryRegion, _: VirtAddr, _: bool) -> ResolveResult {
        ResolveResult::Resolved { major: false }
    }

    fn lookup_fixup(&self, _: usize) -> Option<usize> {
        Some(0xdead)
    }

    fn deliver_signal(&self, _: ThreadId, _: SignalKind) {}
}

fn arb_access() -> impl Strategy<Value = AccessKind> {
    prop_oneof![
        Just(AccessKind::Read),
        Just(AccessKind::Write),
        Just(AccessKind::InstructionFetch),
    ]
}

fn arb_flags() -> impl Strategy<Value = RegionFlags> {
    (0u8..16).prop_map(RegionFlags::from_bits_truncate)
}

fn expected(access: AccessKind, flags: RegionFlags) -> bool {
    let (r, w, x) = (
        flags.contains(RegionFlags::READ),
        flags.contains(RegionFlags::WRITE),
        flags.contains(RegionFlags::EXECUTE),
    );
    match access {
        AccessKind::Read => r || w,
        AccessKind::Write => w,
        AccessKind::InstructionFetch => x,
    }
}

fn event(address: usize, access: AccessKind) -> FaultEvent<()> {
    FaultEvent {
        address: VirtAddr::new(address),
        access,
        is_user_mode: true,
        trap_pc: 0x1000,
        thread: ThreadId::from_raw(1),
        in_interrupt: false,
        stack_pointer: None,
        frame: (),
    }
}

proptest! {
    #[test]
    fn matrix_matches_table(access in arb_access(), flags in arb_flags()) {
        prop_assert_eq!(permits(access, flags), expected(access, flags));
    }

    #[test]
    fn dispatch_follows_matrix(access in arb_access(), flags in arb_flags(), page in 1usize..64, offset in 0usize..4096) {
        let map = RegionMap::new(0);
        map.insert(MemoryRegion::new(0x10_0000, 0x14_0000, flags)).unwrap();
        let space = AddressSpace::user(RootTable::from_phys(0x8000_0000), 1, map);
        let d = Dispatcher::new(AlwaysResolves, FaultConfig::sv39()).unwrap();
        let address = 0x10_0000 + page * 0x1000 + offset;
        let (outcome, trace) = d.dispatch_traced(&event(address, access), Some(&space));
        prop_assert_eq!(trace.visits(FaultState::PermissionCheck), 1);
        if expected(access, flags) {
            prop_assert_eq!(outcome, FaultOutcome::Success(Resume::Retry));
        } else {
            prop_assert_eq!(outcome, FaultOutcome::SigSegv { code: SegvCode::AccErr });
            prop_assert_eq!(trace.visits(FaultState::Resolve), 0);
        }
    }

    #[test]
    fn user_faults_stay_in_user(access in arb_access(), flags in arb_flags(), address in any::<usize>()) {
        let map = RegionMap::new(1 << 20);
        map.insert(MemoryRegion::new(0x40_0000, 0x80_0000, flags)).unwrap();
        let space = AddressSpace::user(RootTable::from_phys(0x8000_0000), 1, map);
        let d = Dispatcher::new(AlwaysResolves, FaultConfig::sv39()).unwrap();
        let outcome = d.dispatch(&event(address, access), Some(&space));
        let escalated = matches!(
            outcome,
            FaultOutcome::KernelFixup { .. } | FaultOutcome::KernelFatal { .. }
        );
        prop_assert!(!escalated);
    }
}

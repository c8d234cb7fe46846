// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Property-based tests for the context allocator
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic. Random acquire/release/switch sequences over a
//!       16-id namespace so exhaustion, steals and rollovers happen constantly.
//!
//! TEST_SCOPE:
//!   - No two spaces hold the same id with a current generation
//!   - Back-to-back acquires hit the fast path and leave the bitmap alone
//!   - The reserved id is never handed to a user space
//!
//! TEST_SCENARIOS:
//!   - ids_stay_unique(): uniqueness after every step, both recycle policies
//!   - repeated_acquire_is_cached(): second acquire returns the same id, in_use unchanged
//!   - reserved_id_never_assigned(): every acquisition for a user space is >= reserved,
//!     including acquires on an offline CPU, which are refused

extern crate std;

use std::collections::BTreeSet;
use std::vec::Vec;

use proptest::prelude::*;

use super::*;
use crate::config::{AllocatorConfig, RecyclePolicy};
use crate::hal::NoShootdown;
use crate::types::{ContextId, CpuId, RootTable};

const SPACES: usize = 24;

#[derive(Clone, Copy, Debug)]
enum Step {
    Acquire { space: usize, cpu: u16 },
    Release { space: usize },
}

fn arb_step(cpus: u16) -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (0..SPACES, 0..cpus).prop_map(|(space, cpu)| Step::Acquire { space, cpu }),
        1 => (0..SPACES).prop_map(|space| Step::Release { space }),
    ]
}

fn arb_policy() -> impl Strategy<Value = RecyclePolicy> {
    prop_oneof![Just(RecyclePolicy::OwnerTracking), Just(RecyclePolicy::VersionBump)]
}

fn setup(policy: RecyclePolicy, cpus: u16) -> (ContextDomains, Vec<AddressSpace>) {
    let cfg = AllocatorConfig::embedded_4bit().with_policy(policy).with_cpus(cpus as usize);
    let domains = ContextDomains::new(cfg).unwrap();
    let spaces = (0..SPACES)
        .map(|n| domains.new_user_space(RootTable::from_phys(0x8000_0000 + n * 0x1000), RegionMap::new(0)))
        .collect();
    (domains, spaces)
}

/// Ids currently held with a generation the allocator still honours.
fn live_ids(alloc: &ContextAllocator, spaces: &[AddressSpace]) -> Vec<ContextId> {
    spaces
        .iter()
        .filter_map(|s| s.context(0))
        .filter(|&(id, generation)| alloc.is_current(id, generation))
        .map(|(id, _)| id)
        .collect()
}

fn run(
    domains: &ContextDomains,
    spaces: &[AddressSpace],
    step: Step,
) -> Option<Result<Acquisition, ContextError>> {
    match step {
        Step::Acquire { space, cpu } => {
            Some(domains.acquire(CpuId::from_raw(cpu), &spaces[space], &NoShootdown))
        }
        Step::Release { space } => {
            domains.release(&spaces[space]);
            None
        }
    }
}

proptest! {
    #[test]
    fn ids_stay_unique(
        policy in arb_policy(),
        steps in prop::collection::vec(arb_step(2), 1..200),
    ) {
        let (domains, spaces) = setup(policy, 2);
        let alloc = domains.allocator(CpuId::BOOT).unwrap();
        for step in steps {
            let _ = run(&domains, &spaces, step);
            let live = live_ids(alloc, &spaces);
            let unique: BTreeSet<_> = live.iter().copied().collect();
            prop_assert_eq!(unique.len(), live.len());
            prop_assert!(live.len() <= alloc.usable());
        }
    }

    #[test]
    fn repeated_acquire_is_cached(
        policy in arb_policy(),
        steps in prop::collection::vec(arb_step(1), 0..100),
        probe in 0..SPACES,
    ) {
        let (domains, spaces) = setup(policy, 1);
        for step in steps {
            let _ = run(&domains, &spaces, step);
        }
        let alloc = domains.allocator(CpuId::BOOT).unwrap();
        let first = domains.acquire(CpuId::BOOT, &spaces[probe], &NoShootdown).unwrap();
        let in_use = alloc.in_use();
        let second = domains.acquire(CpuId::BOOT, &spaces[probe], &NoShootdown).unwrap();
        prop_assert_eq!(second.kind, AcquireKind::Cached);
        prop_assert_eq!(second.id, first.id);
        prop_assert_eq!(second.generation, first.generation);
        prop_assert_eq!(alloc.in_use(), in_use);
    }

    #[test]
    fn reserved_id_never_assigned(
        policy in arb_policy(),
        steps in prop::collection::vec(arb_step(3), 1..300),
    ) {
        // CPU 2 is offline.
        let (domains, spaces) = setup(policy, 2);
        let reserved = domains.allocator(CpuId::BOOT).unwrap().config().reserved;
        for step in steps {
            match (step, run(&domains, &spaces, step)) {
                (_, Some(Ok(acq))) => {
                    prop_assert!(acq.id.as_raw() >= reserved);
                    prop_assert_ne!(acq.kind, AcquireKind::Reserved);
                }
                (Step::Acquire { cpu, .. }, Some(Err(err))) => {
                    prop_assert_eq!(cpu, 2);
                    prop_assert_eq!(err, ContextError::OfflineCpu(CpuId::from_raw(2)));
                }
                _ => {}
            }
        }
    }
}

// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fault counters, updated with relaxed atomics from every CPU.

use core::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct FaultStats {
    total: AtomicU64,
    resolved: AtomicU64,
    major: AtomicU64,
    stack_growths: AtomicU64,
    segv: AtomicU64,
    bus: AtomicU64,
    oom: AtomicU64,
    fixups: AtomicU64,
    fatal: AtomicU64,
    retries: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FaultStatsSnapshot {
    pub total: u64,
    pub resolved: u64,
    pub major: u64,
    pub stack_growths: u64,
    pub segv: u64,
    pub bus: u64,
    pub oom: u64,
    pub fixups: u64,
    pub fatal: u64,
    pub retries: u64,
    pub skipped: u64,
}

macro_rules! bumpers {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            #[inline]
            pub(super) fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl FaultStats {
    bumpers! {
        on_fault => total,
        on_resolved => resolved,
        on_major => major,
        on_stack_growth => stack_growths,
        on_segv => segv,
        on_bus => bus,
        on_oom => oom,
        on_fixup => fixups,
        on_fatal => fatal,
        on_retry => retries,
        on_skip => skipped,
    }

    pub fn snapshot(&self) -> FaultStatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        FaultStatsSnapshot {
            total: get(&self.total),
            resolved: get(&self.resolved),
            major: get(&self.major),
            stack_growths: get(&self.stack_growths),
            segv: get(&self.segv),
            bus: get(&self.bus),
            oom: get(&self.oom),
            fixups: get(&self.fixups),
            fatal: get(&self.fatal),
            retries: get(&self.retries),
            skipped: get(&self.skipped),
        }
    }
}

// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Bounded in-memory ring of recent fault outcomes for bring-up triage
//! OWNERS: @kernel-mm-team
//! STATUS: Experimental (fault_trace_ring feature only)
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 1 test (wraparound keeps newest records)
//!
//! Records are kept without heap allocation and only printed on `dump()`.

use spin::Mutex;

use crate::fault::{AccessKind, FaultOutcome};
use crate::types::VirtAddr;

// Power of two so the write index masks cheaply.
const RING_SIZE: usize = 256;
const RING_MASK: usize = RING_SIZE - 1;

/// One dispatched fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultRecord {
    /// Monotonic sequence number (wraps).
    pub seq: u64,
    pub address: VirtAddr,
    pub trap_pc: usize,
    pub access: AccessKind,
    pub outcome: FaultOutcome,
}

struct Ring {
    next: u64,
    slots: [Option<FaultRecord>; RING_SIZE],
}

static RING: Mutex<Ring> = Mutex::new(Ring { next: 0, slots: [None; RING_SIZE] });

pub fn record(address: VirtAddr, trap_pc: usize, access: AccessKind, outcome: FaultOutcome) {
    let mut ring = RING.lock();
    let seq = ring.next;
    ring.next = seq.wrapping_add(1);
    ring.slots[seq as usize & RING_MASK] = Some(FaultRecord { seq, address, trap_pc, access, outcome });
}

/// Copies up to `out.len()` of the newest records, oldest first; returns how many.
pub fn snapshot(out: &mut [FaultRecord]) -> usize {
    let ring = RING.lock();
    let available = (ring.next as usize).min(RING_SIZE).min(out.len());
    let first = ring.next - available as u64;
    let mut written = 0;
    for seq in first..ring.next {
        if let Some(rec) = ring.slots[seq as usize & RING_MASK] {
            out[written] = rec;
            written += 1;
        }
    }
    written
}

/// Prints the ring through the log sink.
pub fn dump() {
    let ring = RING.lock();
    let count = (ring.next as usize).min(RING_SIZE);
    crate::log_info!(target: "fault", "fault ring: {} of {} records", count, ring.next);
    for seq in ring.next - count as u64..ring.next {
        if let Some(rec) = ring.slots[seq as usize & RING_MASK] {
            crate::log_info!(
                target: "fault",
                "  #{} {:?} addr={:#x} pc={:#x} -> {}",
                rec.seq,
                rec.access,
                rec.address,
                rec.trap_pc,
                rec.outcome
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::Resume;

    #[test]
    fn keeps_newest_records() {
        for i in 0..(RING_SIZE + 10) {
            record(VirtAddr::new(i * 0x1000), i, AccessKind::Read, FaultOutcome::Success(Resume::Retry));
        }
        let mut out = [FaultRecord {
            seq: 0,
            address: VirtAddr::new(0),
            trap_pc: 0,
            access: AccessKind::Read,
            outcome: FaultOutcome::SigBus,
        }; 4];
        assert_eq!(snapshot(&mut out), 4);
        // Other tests may dispatch concurrently; only ordering is stable.
        assert!(out.windows(2).all(|w| w[0].seq + 1 == w[1].seq));
    }
}

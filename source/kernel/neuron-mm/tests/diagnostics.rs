// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Log sink wiring: steals and fatal kernel faults must be diagnosable
//! OWNERS: @kernel-mm-team
//! NOTE: Single test so the process-wide sink and level are not shared across tests.

use std::string::String;
use std::sync::Mutex;

use neuron_mm::config::{AllocatorConfig, FaultConfig};
use neuron_mm::diag::log::{self, format_line, Level, LogSink};
use neuron_mm::fault::{AccessKind, Dispatcher, FaultEvent, FaultOutcome, FaultPlatform, ResolveResult, SignalKind};
use neuron_mm::hal::NoShootdown;
use neuron_mm::mm::{AddressSpace, ContextDomains, MemoryRegion, RegionMap};
use neuron_mm::types::{CpuId, RootTable, ThreadId, VirtAddr};

struct Capture {
    lines: Mutex<Vec<String>>,
}

impl LogSink for Capture {
    fn write_line(&self, level: Level, target: &str, args: core::fmt::Arguments<'_>) {
        let mut line = String::new();
        let _ = format_line(&mut line, level, target, args);
        self.lines.lock().unwrap().push(line);
    }
}

static CAPTURE: Capture = Capture { lines: Mutex::new(Vec::new()) };

struct NoFixups;

impl FaultPlatform for NoFixups {
    type Frame = [usize; 2];

    fn resolve_fault(&self, _: &AddressSpace, _: &MemoryRegion, _: VirtAddr, _: bool) -> ResolveResult {
        ResolveResult::StructuralFailure
    }

    fn lookup_fixup(&self, _: usize) -> Option<usize> {
        None
    }

    fn deliver_signal(&self, _: ThreadId, _: SignalKind) {}
}

#[test]
fn steals_and_oopses_are_logged() {
    assert!(log::install_sink(&CAPTURE));
    assert!(!log::install_sink(&CAPTURE));
    log::set_max_level(Level::Warn);

    let domains = ContextDomains::new(AllocatorConfig::embedded_4bit()).unwrap();
    let spaces: Vec<_> = (0..16)
        .map(|n| domains.new_user_space(RootTable::from_phys(0x8000_0000 + n * 0x1000), RegionMap::new(0)))
        .collect();
    for space in &spaces {
        let _ = domains.acquire(CpuId::BOOT, space, &NoShootdown).unwrap();
    }

    let dispatcher = Dispatcher::new(NoFixups, FaultConfig::sv39()).unwrap();
    let event = FaultEvent {
        address: VirtAddr::new(0xdead_b000),
        access: AccessKind::Write,
        is_user_mode: false,
        trap_pc: 0xffff_ffc0_0000_1234,
        thread: ThreadId::from_raw(0),
        in_interrupt: false,
        stack_pointer: None,
        frame: [0x11, 0x22],
    };
    assert!(matches!(dispatcher.dispatch(&event, None), FaultOutcome::KernelFatal { .. }));

    let lines = CAPTURE.lines.lock().unwrap();
    assert!(lines.iter().any(|l| l.starts_with("[WARN asid] steal ctx#1 from as#")));
    let oops = lines.iter().find(|l| l.starts_with("[ERROR fault] unhandled kernel")).unwrap();
    assert!(oops.contains("addr=0xdeadb000"));
    assert!(oops.contains("frame=[17, 34]"));
    // Info is above the configured level.
    assert!(!lines.iter().any(|l| l.starts_with("[INFO")));
    assert!(lines.iter().all(|l| l.ends_with('\n') && l.matches('\n').count() == 1));
}

// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: NEURON memory-management core: page-fault dispatch and hardware context ids
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! PUBLIC API: fault::Dispatcher, mm::{ContextDomains, switch_mm}, config, hal traits
//! DEPENDS_ON: spin, bitflags, static_assertions; riscv + sbi-rt on riscv64-none
//!
//! Host builds (tests, tooling) link `std`; the kernel target is `no_std + alloc`.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[macro_use]
pub mod diag;

pub mod config;
pub mod fault;
pub mod hal;
pub mod mm;
pub mod types;

pub use config::{AllocatorConfig, ConfigError, FaultConfig, RecyclePolicy, SharingModel};
pub use fault::{Dispatcher, FaultEvent, FaultOutcome, FaultPlatform};
pub use mm::{switch_mm, AddressSpace, ContextDomains, ContextError};

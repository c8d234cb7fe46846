// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address spaces, regions and hardware context-id management
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AddressSpace, RegionMap, ContextAllocator, ContextDomains, switch_mm
//! DEPENDS_ON: hal (TLB maintenance), config, spin

pub mod address_space;
pub mod bitmap;
pub mod context;
pub mod domains;
pub mod region;
pub mod switch;

pub use address_space::{AddressSpace, ContextSlot, SpaceKind};
pub use bitmap::ContextBitmap;
pub use context::{
    AcquireKind, Acquisition, ContextAllocator, ContextError, ContextStats, ContextStatsSnapshot,
};
pub use domains::ContextDomains;
pub use region::{MemoryRegion, RegionError, RegionFlags, RegionMap, ResourceLimitError};
pub use switch::switch_mm;

#[cfg(test)]
mod tests_prop;

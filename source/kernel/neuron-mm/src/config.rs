// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Boot-time configuration for context allocation and fault policy
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AllocatorConfig, FaultConfig, SharingModel, RecyclePolicy, ConfigError
//! DEPENDS_ON: types (MAX_CONTEXT_BITS, MAX_CPUS, PAGE_SIZE)
//! INVARIANTS: at least one usable id beyond the reserved range; cpus in 1..=MAX_CPUS
//!
//! Presets mirror the hardware the allocator has to cover: a 16-bit Sv39 ASID,
//! an 8-bit ARMv8 ASID, a 4-bit embedded tag and the 8-bit PPC 44x PID.
//! Whether one allocator is shared by every CPU or each CPU owns its own
//! namespace is an explicit [`SharingModel`] rather than a build-time switch.

use core::fmt;

use static_assertions::const_assert;

use crate::types::{MAX_CONTEXT_BITS, MAX_CPUS, PAGE_SIZE};

const_assert!(MAX_CONTEXT_BITS <= 32);
const_assert!(MAX_CPUS <= 64);

/// How context-id namespaces map onto CPUs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SharingModel {
    /// One allocator and one lock shared by every CPU; recycling cross-calls peers.
    Global,
    /// One allocator per CPU; no cross-CPU traffic at all.
    PerCpu,
}

/// What happens when every usable id is in use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecyclePolicy {
    /// Keep an owner table and steal the least-recently-acquired id.
    OwnerTracking,
    /// Bump the version: free every id not loaded on a CPU and flush all TLBs.
    VersionBump,
}

/// Configuration rejected by `validate`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// `id_bits` is zero or wider than the supported maximum.
    IdBits,
    /// The reserved range leaves no id for user address spaces.
    NoUsableIds,
    /// CPU count outside `1..=MAX_CPUS`.
    CpuCount,
    /// Stack guard gap is not page aligned.
    GuardGap,
    /// User ceiling is not page aligned or is zero.
    UserCeiling,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ConfigError::IdBits => "context id width out of range",
            ConfigError::NoUsableIds => "reserved ids exhaust the context namespace",
            ConfigError::CpuCount => "cpu count out of range",
            ConfigError::GuardGap => "stack guard gap must be page aligned",
            ConfigError::UserCeiling => "user ceiling must be a non-zero page boundary",
        };
        f.write_str(msg)
    }
}

/// Parameters for one context-id namespace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Width of the hardware tag; capacity is `1 << id_bits`.
    pub id_bits: u32,
    /// Ids `0..reserved` are never handed to user spaces.
    pub reserved: u32,
    pub policy: RecyclePolicy,
    pub sharing: SharingModel,
    /// Number of CPUs online.
    pub cpus: usize,
}

impl AllocatorConfig {
    /// Sv39 `satp.ASID`, 16 bits, one namespace for all harts.
    pub const fn sv39() -> Self {
        Self {
            id_bits: 16,
            reserved: 1,
            policy: RecyclePolicy::VersionBump,
            sharing: SharingModel::Global,
            cpus: 1,
        }
    }

    /// ARMv8 without the 16-bit ASID extension.
    pub const fn arm64_8bit() -> Self {
        Self { id_bits: 8, ..Self::sv39() }
    }

    /// Small embedded MMU with a 4-bit tag (16 ids).
    pub const fn embedded_4bit() -> Self {
        Self { id_bits: 4, policy: RecyclePolicy::OwnerTracking, ..Self::sv39() }
    }

    /// PPC 44x: 8-bit PID register, owner-tracked stealing.
    pub const fn ppc_44x() -> Self {
        Self { id_bits: 8, policy: RecyclePolicy::OwnerTracking, ..Self::sv39() }
    }

    pub const fn with_policy(self, policy: RecyclePolicy) -> Self {
        Self { policy, ..self }
    }

    pub const fn with_sharing(self, sharing: SharingModel) -> Self {
        Self { sharing, ..self }
    }

    pub const fn with_cpus(self, cpus: usize) -> Self {
        Self { cpus, ..self }
    }

    /// Total ids representable by the hardware tag.
    pub const fn capacity(&self) -> usize {
        1usize << self.id_bits
    }

    /// First id handed to user address spaces.
    pub const fn first_usable(&self) -> u32 {
        self.reserved
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id_bits == 0 || self.id_bits > MAX_CONTEXT_BITS {
            return Err(ConfigError::IdBits);
        }
        if self.reserved == 0 || self.reserved as usize >= self.capacity() {
            return Err(ConfigError::NoUsableIds);
        }
        if self.cpus == 0 || self.cpus > MAX_CPUS {
            return Err(ConfigError::CpuCount);
        }
        Ok(())
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self::sv39()
    }
}

/// Policy knobs for the fault dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultConfig {
    /// Lowest address that belongs to the kernel half in a split layout.
    pub user_ceiling: usize,
    /// Largest distance below a `GROWS_DOWN` region that still counts as a stack access.
    pub stack_guard_gap: usize,
    /// Reject user stack growth when `address + slack` is below the stack pointer.
    pub stack_pointer_slack: Option<usize>,
    /// Bound on resolver "retry" round trips before returning to the faulting instruction.
    pub max_retries: u8,
    /// Treat loads/prefetches into the hardwired zero register as non-faulting.
    pub zero_register_prefetch: bool,
    /// Halt instead of killing just the faulting kernel context.
    pub panic_on_oops: bool,
}

impl FaultConfig {
    /// Sv39 lower half, 256-page guard gap, x86-style push/call slack.
    pub const fn sv39() -> Self {
        Self {
            user_ceiling: 0x0000_0040_0000_0000,
            stack_guard_gap: 256 * PAGE_SIZE,
            stack_pointer_slack: Some(65536 + 32 * core::mem::size_of::<usize>()),
            max_retries: 2,
            zero_register_prefetch: false,
            panic_on_oops: false,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.user_ceiling == 0 || self.user_ceiling % PAGE_SIZE != 0 {
            return Err(ConfigError::UserCeiling);
        }
        if self.stack_guard_gap % PAGE_SIZE != 0 {
            return Err(ConfigError::GuardGap);
        }
        Ok(())
    }
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self::sv39()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_validate() {
        for cfg in [
            AllocatorConfig::sv39(),
            AllocatorConfig::arm64_8bit(),
            AllocatorConfig::embedded_4bit(),
            AllocatorConfig::ppc_44x(),
        ] {
            assert_eq!(cfg.validate(), Ok(()));
        }
        assert_eq!(AllocatorConfig::embedded_4bit().capacity(), 16);
        assert_eq!(FaultConfig::sv39().validate(), Ok(()));
    }

    #[test]
    fn rejects_degenerate_namespaces() {
        let cfg = AllocatorConfig { id_bits: 1, reserved: 2, ..AllocatorConfig::sv39() };
        assert_eq!(cfg.validate(), Err(ConfigError::NoUsableIds));
        let cfg = AllocatorConfig { reserved: 0, ..AllocatorConfig::sv39() };
        assert_eq!(cfg.validate(), Err(ConfigError::NoUsableIds));
        let cfg = AllocatorConfig { id_bits: 25, ..AllocatorConfig::sv39() };
        assert_eq!(cfg.validate(), Err(ConfigError::IdBits));
        assert_eq!(AllocatorConfig::sv39().with_cpus(0).validate(), Err(ConfigError::CpuCount));
    }

    #[test]
    fn rejects_unaligned_fault_layout() {
        let cfg = FaultConfig { stack_guard_gap: 100, ..FaultConfig::sv39() };
        assert_eq!(cfg.validate(), Err(ConfigError::GuardGap));
        let cfg = FaultConfig { user_ceiling: 0, ..FaultConfig::sv39() };
        assert_eq!(cfg.validate(), Err(ConfigError::UserCeiling));
    }
}

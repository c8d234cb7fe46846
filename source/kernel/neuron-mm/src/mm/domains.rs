// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Context namespaces per sharing model: one global allocator, or one per CPU.

extern crate alloc;

use alloc::vec::Vec;

use super::address_space::AddressSpace;
use super::context::{Acquisition, ContextAllocator, ContextError};
use super::region::RegionMap;
use crate::config::{AllocatorConfig, ConfigError, SharingModel};
use crate::hal::TlbShootdown;
use crate::types::{CpuId, CpuSet, RootTable};

/// The set of context allocators for the machine.
pub struct ContextDomains {
    sharing: SharingModel,
    allocators: Vec<ContextAllocator>,
}

impl ContextDomains {
    pub fn new(config: AllocatorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let allocators = match config.sharing {
            SharingModel::Global => {
                let mut all = Vec::with_capacity(1);
                all.push(ContextAllocator::new(config, 0, CpuSet::first(config.cpus))?);
                all
            }
            SharingModel::PerCpu => (0..config.cpus)
                .map(|index| {
                    let mut members = CpuSet::EMPTY;
                    members.insert(CpuId::from_raw(index as u16));
                    ContextAllocator::new(config, index, members)
                })
                .collect::<Result<Vec<_>, _>>()?,
        };
        crate::log_info!(
            target: "asid",
            "context domains={} ids={} policy={:?}",
            allocators.len(),
            config.capacity(),
            config.policy
        );
        Ok(Self { sharing: config.sharing, allocators })
    }

    pub fn sharing(&self) -> SharingModel {
        self.sharing
    }

    pub fn domains(&self) -> usize {
        self.allocators.len()
    }

    /// Allocator responsible for `cpu`, if the CPU is online.
    pub fn allocator(&self, cpu: CpuId) -> Option<&ContextAllocator> {
        match self.sharing {
            SharingModel::Global => self.allocators.first().filter(|a| a.members().contains(cpu)),
            SharingModel::PerCpu => self.allocators.get(cpu.as_index()),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContextAllocator> {
        self.allocators.iter()
    }

    /// Creates a process address space with a context slot for every domain.
    pub fn new_user_space(&self, root: RootTable, regions: RegionMap) -> AddressSpace {
        AddressSpace::user(root, self.domains(), regions)
    }

    /// Ensures `space` has a valid context id for `cpu`'s namespace.
    ///
    /// The kernel space runs on the reserved id everywhere; a user space on an offline CPU
    /// is refused.
    pub fn acquire<S: TlbShootdown + ?Sized>(
        &self,
        cpu: CpuId,
        space: &AddressSpace,
        shootdown: &S,
    ) -> Result<Acquisition, ContextError> {
        match self.allocator(cpu) {
            Some(allocator) => allocator.acquire(cpu, space, shootdown),
            None if space.is_kernel() => Ok(Acquisition::reserved()),
            None => {
                crate::log_error!(target: "asid", "{} acquire on offline cpu {}", space.id(), cpu.as_raw());
                Err(ContextError::OfflineCpu(cpu))
            }
        }
    }

    /// Releases every context `space` holds; called on address-space teardown.
    pub fn release(&self, space: &AddressSpace) {
        for allocator in &self.allocators {
            allocator.release(space);
        }
    }
}

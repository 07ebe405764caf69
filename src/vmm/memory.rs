use kvm_bindings::kvm_userspace_memory_region;
use vm_memory::{GuestAddress, GuestMemory, GuestMemoryMmap};

use crate::error::{Result, VmmError};


/// Guest RAM: one anonymous, zero-filled mapping aliased at guest-physical 0.
pub struct GuestMem { pub mem: GuestMemoryMmap, size: usize }


impl GuestMem {
    pub fn create(size: usize) -> Result<Self> {
        // vm-memory maps MAP_PRIVATE | MAP_ANONYMOUS | MAP_NORESERVE
        let gm = GuestMemoryMmap::<()>::from_ranges(&[(GuestAddress(0), size)])
            .map_err(|e| VmmError::Allocation { size, reason: e.to_string() })?;
        Ok(Self { mem: gm, size })
    }

    pub fn size(&self) -> usize { self.size }

    /// The KVM slot describing this mapping.
    pub fn region(&self, slot: u32) -> Result<kvm_userspace_memory_region> {
        let host = self
            .mem
            .get_host_address(GuestAddress(0))
            .map_err(|e| VmmError::Allocation { size: self.size, reason: e.to_string() })?;
        Ok(kvm_userspace_memory_region {
            slot,
            flags: 0,
            guest_phys_addr: 0,
            memory_size: self.size as u64,
            userspace_addr: host as u64,
        })
    }
}

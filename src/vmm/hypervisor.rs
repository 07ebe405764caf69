//! Capability provider seam.
//!
//! Everything the harness needs from the hypervisor goes through these three
//! traits. Releasing a resource is its `Drop`: dropping a [`VcpuContext`]
//! unmaps its run page and closes it, dropping a [`VmContext`] closes the VM,
//! dropping the [`Hypervisor`] closes the device.

use kvm_bindings::{kvm_regs, kvm_sregs, kvm_userspace_memory_region};
use vmm_sys_util::errno;

pub type BackendResult<T> = std::result::Result<T, errno::Error>;

/// Why the guest handed control back to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestExit {
    /// `out` to an I/O port. `data` is the written value, little-endian,
    /// zero-extended to 32 bits.
    IoOut { port: u16, data: u32 },
    /// Any other exit reason.
    Unhandled(String),
}

/// Decode the bytes of a port write.
pub fn io_data(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    let n = bytes.len().min(buf.len());
    buf[..n].copy_from_slice(&bytes[..n]);
    u32::from_le_bytes(buf)
}

pub trait Hypervisor: Send {
    type Vm: VmContext;

    fn api_version(&self) -> i32;
    fn create_vm(&self) -> BackendResult<Self::Vm>;
    /// Size of the shared run page every vCPU maps.
    fn run_page_size(&self) -> BackendResult<usize>;
}

pub trait VmContext: Send {
    type Vcpu: VcpuContext + 'static;

    /// Register a guest-physical memory slot.
    ///
    /// # Safety
    ///
    /// `region.userspace_addr` must point at a host mapping of at least
    /// `region.memory_size` bytes that outlives this VM context.
    unsafe fn install_memory(&self, region: kvm_userspace_memory_region) -> BackendResult<()>;

    fn create_vcpu(&self, id: u8) -> BackendResult<Self::Vcpu>;
}

pub trait VcpuContext: Send {
    fn regs(&self) -> BackendResult<kvm_regs>;
    fn set_regs(&self, regs: &kvm_regs) -> BackendResult<()>;
    fn sregs(&self) -> BackendResult<kvm_sregs>;
    fn set_sregs(&self, sregs: &kvm_sregs) -> BackendResult<()>;

    /// Map the shared run page of `size` bytes, as reported by
    /// [`Hypervisor::run_page_size`].
    fn map_run_page(&mut self, size: usize) -> BackendResult<()>;

    /// Enter the guest. Blocks until the next exit.
    fn run(&mut self) -> BackendResult<GuestExit>;
}

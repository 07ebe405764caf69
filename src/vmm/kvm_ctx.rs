use kvm_bindings::{kvm_regs, kvm_run, kvm_sregs, kvm_userspace_memory_region};
use kvm_ioctls::{Kvm, VcpuExit, VcpuFd, VmFd};
use log::{debug, info};
use vmm_sys_util::errno;

use super::hypervisor::{
    io_data, BackendResult, GuestExit, Hypervisor, VcpuContext, VmContext,
};
use crate::error::{Result, VmmError};


/// Open /dev/kvm. Fails when virtualization is missing or access is denied.
pub fn open() -> Result<Kvm> {
    let kvm = Kvm::new().map_err(VmmError::Unavailable)?;
    info!("KVM API version {}", kvm.get_api_version());
    Ok(kvm)
}


impl Hypervisor for Kvm {
    type Vm = VmFd;

    fn api_version(&self) -> i32 { self.get_api_version() }

    fn create_vm(&self) -> BackendResult<VmFd> { Kvm::create_vm(self) }

    fn run_page_size(&self) -> BackendResult<usize> { self.get_vcpu_mmap_size() }
}


impl VmContext for VmFd {
    type Vcpu = VcpuFd;

    unsafe fn install_memory(&self, region: kvm_userspace_memory_region) -> BackendResult<()> {
        self.set_user_memory_region(region)
    }

    fn create_vcpu(&self, id: u8) -> BackendResult<VcpuFd> { VmFd::create_vcpu(self, id.into()) }
}


impl VcpuContext for VcpuFd {
    fn regs(&self) -> BackendResult<kvm_regs> { self.get_regs() }

    fn set_regs(&self, regs: &kvm_regs) -> BackendResult<()> { VcpuFd::set_regs(self, regs) }

    fn sregs(&self) -> BackendResult<kvm_sregs> { self.get_sregs() }

    fn set_sregs(&self, sregs: &kvm_sregs) -> BackendResult<()> { VcpuFd::set_sregs(self, sregs) }

    fn map_run_page(&mut self, size: usize) -> BackendResult<()> {
        // kvm-ioctls already mapped kvm_run inside create_vcpu; all that is
        // left is refusing a page too short to hold it.
        if size < std::mem::size_of::<kvm_run>() {
            return Err(errno::Error::new(libc::EINVAL));
        }
        debug!("run page size {}", size);
        Ok(())
    }

    fn run(&mut self) -> BackendResult<GuestExit> {
        let exit = match VcpuFd::run(self)? {
            VcpuExit::IoOut(port, data) => GuestExit::IoOut { port, data: io_data(data) },
            other => GuestExit::Unhandled(format!("{:?}", other)),
        };
        Ok(exit)
    }
}

use std::path::Path;

use log::{debug, info};

use super::boot::load_executable;
use super::hypervisor::{Hypervisor, VmContext};
use super::memory::GuestMem;
use super::vcpu::Vcpu;
use crate::config::MAX_VCPUS;
use crate::error::{Result, VmmError};
use crate::types::Released;


/// A VM with one memory slot at guest-physical 0 and up to [`MAX_VCPUS`] vCPUs.
///
/// Fields drop in declaration order, so even without [`Vm::destroy`] the
/// vCPUs go first, then the VM connection, then guest memory.
pub struct Vm<V: VmContext> {
    vcpus: Vec<Vcpu<V::Vcpu>>,
    ctx: V,
    memory: GuestMem,
}


impl<V: VmContext> Vm<V> {
    pub fn create<H: Hypervisor<Vm = V>>(hv: &H, memory_size: usize) -> Result<Self> {
        let ctx = hv.create_vm().map_err(VmmError::CreateVm)?;
        let memory = GuestMem::create(memory_size)?;
        let region = memory.region(0)?;

        // SAFETY: the region is `memory`'s own mapping, and `memory` is
        // dropped only after `ctx`.
        if let Err(e) = unsafe { ctx.install_memory(region) } {
            drop(ctx);
            drop(memory);
            return Err(VmmError::MemoryInstall(e));
        }
        info!("VM created, {} bytes of guest memory at {:#x}", memory_size, region.userspace_addr);
        Ok(Self { vcpus: Vec::new(), ctx, memory })
    }

    pub fn memory(&self) -> &GuestMem { &self.memory }

    pub fn load(&self, path: &Path) -> Result<usize> { load_executable(&self.memory, path) }

    /// Create and reset the next vCPU. Ids are handed out 0, 1, 2, ...
    pub fn add_vcpu<H: Hypervisor<Vm = V>>(&mut self, hv: &H) -> Result<u8> {
        if self.vcpus.len() >= MAX_VCPUS {
            return Err(VmmError::TooManyVcpus { requested: self.vcpus.len() + 1, max: MAX_VCPUS });
        }
        let id = self.vcpus.len() as u8;
        let mut vcpu = Vcpu::create(hv, &self.ctx, id)?;
        vcpu.reset()?;
        self.vcpus.push(vcpu);
        Ok(id)
    }

    pub fn vcpus(&self) -> &[Vcpu<V::Vcpu>] { &self.vcpus }

    pub(crate) fn take_vcpus(&mut self) -> Vec<Vcpu<V::Vcpu>> { std::mem::take(&mut self.vcpus) }

    /// Hand a vCPU back after its thread finished, keeping index order.
    pub(crate) fn return_vcpu(&mut self, vcpu: Vcpu<V::Vcpu>) {
        let at = self.vcpus.partition_point(|v| v.id() < vcpu.id());
        self.vcpus.insert(at, vcpu);
    }

    /// Release every vCPU this VM holds, in index order.
    pub fn release_vcpus(&mut self, out: &mut Vec<Released>) {
        for vcpu in self.vcpus.drain(..) {
            let id = vcpu.id();
            drop(vcpu);
            debug!("#{}: run page unmapped, vCPU closed", id);
            out.push(Released::RunPage { vcpu: id });
            out.push(Released::VcpuConnection { vcpu: id });
        }
    }

    pub fn destroy(mut self, out: &mut Vec<Released>) {
        self.release_vcpus(out);
        let Vm { vcpus: _, ctx, memory } = self;

        drop(ctx);
        debug!("VM closed");
        out.push(Released::VmConnection);

        let bytes = memory.size();
        drop(memory);
        debug!("guest memory unmapped ({} bytes)", bytes);
        out.push(Released::GuestMemory { bytes });
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmm::fake::{Event, FakeHypervisor};

    const MEM: usize = 0x20_000;

    #[test]
    fn create_installs_one_slot_at_zero() {
        let hv = FakeHypervisor::new();
        let vm = Vm::create(&hv, MEM).unwrap();
        assert_eq!(vm.memory().size(), MEM);
        assert!(hv.ledger().events().contains(&Event::MemoryInstalled { size: MEM as u64 }));
    }

    #[test]
    fn construction_failures_are_classified() {
        let hv = FakeHypervisor::new();
        hv.fail_create_vm();
        assert!(matches!(Vm::create(&hv, MEM), Err(VmmError::CreateVm(_))));

        let hv = FakeHypervisor::new();
        hv.fail_install();
        assert!(matches!(Vm::create(&hv, MEM), Err(VmmError::MemoryInstall(_))));
        assert_eq!(hv.ledger().outstanding(), 0);

        let hv = FakeHypervisor::new();
        assert!(matches!(Vm::create(&hv, 0), Err(VmmError::Allocation { .. })));
        assert_eq!(hv.ledger().outstanding(), 0);
    }

    #[test]
    fn vcpu_ids_are_sequential_and_bounded() {
        let hv = FakeHypervisor::new();
        let mut vm = Vm::create(&hv, MEM).unwrap();
        for want in 0..MAX_VCPUS as u8 {
            assert_eq!(vm.add_vcpu(&hv).unwrap(), want);
        }
        assert!(matches!(vm.add_vcpu(&hv), Err(VmmError::TooManyVcpus { max: MAX_VCPUS, .. })));
        assert_eq!(vm.vcpus().len(), MAX_VCPUS);
    }

    #[test]
    fn returned_vcpus_keep_index_order() {
        let hv = FakeHypervisor::new();
        let mut vm = Vm::create(&hv, MEM).unwrap();
        for _ in 0..3 {
            vm.add_vcpu(&hv).unwrap();
        }
        let mut taken = vm.take_vcpus();
        assert!(vm.vcpus().is_empty());
        while let Some(v) = taken.pop() {
            vm.return_vcpu(v);
        }
        let ids: Vec<u8> = vm.vcpus().iter().map(|v| v.id()).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn destroy_releases_in_reverse_construction_order() {
        let hv = FakeHypervisor::new();
        let ledger = hv.ledger();
        let mut vm = Vm::create(&hv, MEM).unwrap();
        vm.add_vcpu(&hv).unwrap();
        vm.add_vcpu(&hv).unwrap();

        let mut out = Vec::new();
        vm.destroy(&mut out);
        assert_eq!(
            out,
            vec![
                Released::RunPage { vcpu: 0 },
                Released::VcpuConnection { vcpu: 0 },
                Released::RunPage { vcpu: 1 },
                Released::VcpuConnection { vcpu: 1 },
                Released::VmConnection,
                Released::GuestMemory { bytes: MEM },
            ]
        );
        let closed_vcpu = ledger.position(&Event::VcpuClosed(1)).unwrap();
        assert!(closed_vcpu < ledger.position(&Event::VmClosed).unwrap());
        assert_eq!(ledger.outstanding(), 0);
    }
}

use kvm_bindings::{kvm_regs, kvm_sregs};
use log::{debug, info};
use vmm_sys_util::errno;

use super::boot::{boot_regs, setup_sregs};
use super::event_loop::{dispatch, ExitAction, GoSignal, StateCell, VcpuState};
use super::hypervisor::{Hypervisor, VcpuContext, VmContext};
use crate::error::{Result, VmmError};


/// One guest execution context. Only the thread that runs it touches its
/// registers and run page.
pub struct Vcpu<C> {
    id: u8,
    ctx: C,
    regs: kvm_regs,
    sregs: kvm_sregs,
}


impl<C: VcpuContext> Vcpu<C> {
    pub fn create<H>(hv: &H, vm: &H::Vm, id: u8) -> Result<Self>
    where
        H: Hypervisor,
        H::Vm: VmContext<Vcpu = C>,
    {
        let mut ctx = vm.create_vcpu(id).map_err(|source| VmmError::CreateVcpu { id, source })?;
        let run_page_size = hv.run_page_size().map_err(VmmError::QueryRunSize)?;
        ctx.map_run_page(run_page_size).map_err(|source| VmmError::MapRunPage { id, source })?;
        info!("#{}: created, run page {} bytes", id, run_page_size);
        Ok(Self { id, ctx, regs: kvm_regs::default(), sregs: kvm_sregs::default() })
    }

    pub fn id(&self) -> u8 { self.id }

    pub fn regs(&self) -> &kvm_regs { &self.regs }

    pub fn sregs(&self) -> &kvm_sregs { &self.sregs }

    /// Load the real-mode boot state. Must happen before the vCPU's thread starts.
    pub fn reset(&mut self) -> Result<()> {
        let id = self.id;
        let reg_err = |op: &'static str| move |source: errno::Error| VmmError::Register { id, op, source };

        let mut sregs = self.ctx.sregs().map_err(reg_err("KVM_GET_SREGS"))?;
        setup_sregs(&mut sregs);
        self.ctx.set_sregs(&sregs).map_err(reg_err("KVM_SET_SREGS"))?;

        let regs = boot_regs(id);
        self.ctx.set_regs(&regs).map_err(reg_err("KVM_SET_REGS"))?;

        // read back what the hypervisor actually holds
        self.sregs = self.ctx.sregs().map_err(reg_err("KVM_GET_SREGS"))?;
        self.regs = self.ctx.regs().map_err(reg_err("KVM_GET_REGS"))?;
        debug!("#{}: reset, cs={:#x} rip={:#x} rax={}", id, self.sregs.cs.selector, self.regs.rip, self.regs.rax);
        Ok(())
    }

    /// Enter the guest and dispatch exits until the vCPU halts or parks.
    pub fn run_loop(&mut self, signal: &GoSignal, state: &StateCell) -> Result<VcpuState> {
        loop {
            state.set(VcpuState::Running);
            debug!("#{}: KVM start run", self.id);
            let exit = self.ctx.run().map_err(|source| VmmError::Run { id: self.id, source })?;

            match dispatch(self.id, &exit, signal, state) {
                ExitAction::Continue => continue,
                ExitAction::Terminate => {
                    state.set(VcpuState::Terminated);
                    return Ok(VcpuState::Terminated);
                }
                ExitAction::Park => {
                    state.set(VcpuState::Parked);
                    return Ok(VcpuState::Parked);
                }
            }
        }
    }
}

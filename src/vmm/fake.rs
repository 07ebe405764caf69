//! Instrumented in-process hypervisor for tests.
//!
//! Every open, map, unmap and close lands in a shared [`Ledger`], and each
//! vCPU plays back a scripted list of guest exits.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use kvm_bindings::{kvm_regs, kvm_sregs, kvm_userspace_memory_region};
use vmm_sys_util::errno;

use super::hypervisor::{
    BackendResult, GuestExit, Hypervisor, VcpuContext, VmContext,
};

pub const FAKE_API_VERSION: i32 = 12;
const FAKE_RUN_PAGE: usize = 12288;


#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    VmCreated,
    MemoryInstalled { size: u64 },
    VcpuCreated(u8),
    RunPageMapped(u8),
    Entered(u8),
    Exited(u8, GuestExit),
    RunPageUnmapped(u8),
    VcpuClosed(u8),
    VmClosed,
    HypervisorClosed,
}


#[derive(Debug, Default)]
pub struct Ledger { events: Mutex<Vec<Event>> }

impl Ledger {
    fn push(&self, ev: Event) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(ev);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn position(&self, ev: &Event) -> Option<usize> {
        self.events().iter().position(|e| e == ev)
    }

    /// Number of guest entries made by vCPU `id`.
    pub fn entries(&self, id: u8) -> usize {
        self.events().iter().filter(|e| **e == Event::Entered(id)).count()
    }

    /// Resources opened or mapped and not yet released.
    pub fn outstanding(&self) -> i64 {
        self.events()
            .iter()
            .map(|e| match e {
                Event::VmCreated | Event::VcpuCreated(_) | Event::RunPageMapped(_) => 1,
                Event::VmClosed | Event::VcpuClosed(_) | Event::RunPageUnmapped(_) => -1,
                _ => 0,
            })
            .sum()
    }
}


#[derive(Clone, Debug)]
pub enum Step {
    Exit(GuestExit),
    /// KVM_RUN itself fails.
    Fail,
}

impl Step {
    pub fn out(port: u16) -> Self { Step::Exit(GuestExit::IoOut { port, data: 0 }) }
}


#[derive(Debug, Default)]
struct Faults {
    create_vm: bool,
    install: bool,
    run_size_query: bool,
    vcpu_create: Option<u8>,
    run_page_map: Option<u8>,
    registers: Option<u8>,
}

#[derive(Default)]
struct Shared {
    faults: Mutex<Faults>,
    scripts: Mutex<HashMap<u8, VecDeque<Step>>>,
}

impl Shared {
    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn einval() -> errno::Error { errno::Error::new(libc::EINVAL) }


pub struct FakeHypervisor { ledger: Arc<Ledger>, shared: Arc<Shared> }

impl FakeHypervisor {
    pub fn new() -> Self { Self { ledger: Arc::default(), shared: Arc::default() } }

    pub fn ledger(&self) -> Arc<Ledger> { self.ledger.clone() }

    pub fn script(&self, id: u8, steps: Vec<Step>) {
        self.shared.scripts.lock().unwrap_or_else(PoisonError::into_inner).insert(id, steps.into());
    }

    pub fn fail_create_vm(&self) { self.shared.faults().create_vm = true }
    pub fn fail_install(&self) { self.shared.faults().install = true }
    pub fn fail_run_size_query(&self) { self.shared.faults().run_size_query = true }
    pub fn fail_vcpu_create(&self, id: u8) { self.shared.faults().vcpu_create = Some(id) }
    pub fn fail_run_page_map(&self, id: u8) { self.shared.faults().run_page_map = Some(id) }
    pub fn fail_registers(&self, id: u8) { self.shared.faults().registers = Some(id) }
}

impl Drop for FakeHypervisor {
    fn drop(&mut self) { self.ledger.push(Event::HypervisorClosed) }
}

impl Hypervisor for FakeHypervisor {
    type Vm = FakeVm;

    fn api_version(&self) -> i32 { FAKE_API_VERSION }

    fn create_vm(&self) -> BackendResult<FakeVm> {
        if self.shared.faults().create_vm {
            return Err(errno::Error::new(libc::ENOMEM));
        }
        self.ledger.push(Event::VmCreated);
        Ok(FakeVm { ledger: self.ledger.clone(), shared: self.shared.clone() })
    }

    fn run_page_size(&self) -> BackendResult<usize> {
        if self.shared.faults().run_size_query {
            return Err(einval());
        }
        Ok(FAKE_RUN_PAGE)
    }
}


pub struct FakeVm { ledger: Arc<Ledger>, shared: Arc<Shared> }

impl Drop for FakeVm {
    fn drop(&mut self) { self.ledger.push(Event::VmClosed) }
}

impl VmContext for FakeVm {
    type Vcpu = FakeVcpu;

    unsafe fn install_memory(&self, region: kvm_userspace_memory_region) -> BackendResult<()> {
        if self.shared.faults().install || region.userspace_addr == 0 {
            return Err(einval());
        }
        self.ledger.push(Event::MemoryInstalled { size: region.memory_size });
        Ok(())
    }

    fn create_vcpu(&self, id: u8) -> BackendResult<FakeVcpu> {
        let (fail_create, fail_map, fail_regs) = {
            let f = self.shared.faults();
            (f.vcpu_create == Some(id), f.run_page_map == Some(id), f.registers == Some(id))
        };
        if fail_create {
            return Err(einval());
        }
        self.ledger.push(Event::VcpuCreated(id));
        let script = self
            .shared
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .unwrap_or_default();
        Ok(FakeVcpu {
            id,
            ledger: self.ledger.clone(),
            script,
            fail_map,
            mapped: false,
            fail_regs,
            regs: Mutex::new(kvm_regs::default()),
            sregs: Mutex::new(kvm_sregs::default()),
        })
    }
}


pub struct FakeVcpu {
    id: u8,
    ledger: Arc<Ledger>,
    script: VecDeque<Step>,
    fail_map: bool,
    mapped: bool,
    fail_regs: bool,
    regs: Mutex<kvm_regs>,
    sregs: Mutex<kvm_sregs>,
}

impl Drop for FakeVcpu {
    fn drop(&mut self) {
        if self.mapped {
            self.ledger.push(Event::RunPageUnmapped(self.id));
        }
        self.ledger.push(Event::VcpuClosed(self.id));
    }
}

impl VcpuContext for FakeVcpu {
    fn regs(&self) -> BackendResult<kvm_regs> {
        Ok(*self.regs.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn set_regs(&self, regs: &kvm_regs) -> BackendResult<()> {
        if self.fail_regs {
            return Err(einval());
        }
        *self.regs.lock().unwrap_or_else(PoisonError::into_inner) = *regs;
        Ok(())
    }

    fn sregs(&self) -> BackendResult<kvm_sregs> {
        if self.fail_regs {
            return Err(einval());
        }
        Ok(*self.sregs.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn set_sregs(&self, sregs: &kvm_sregs) -> BackendResult<()> {
        *self.sregs.lock().unwrap_or_else(PoisonError::into_inner) = *sregs;
        Ok(())
    }

    fn map_run_page(&mut self, size: usize) -> BackendResult<()> {
        if self.fail_map || size == 0 {
            return Err(errno::Error::new(libc::ENOMEM));
        }
        self.mapped = true;
        self.ledger.push(Event::RunPageMapped(self.id));
        Ok(())
    }

    fn run(&mut self) -> BackendResult<GuestExit> {
        self.ledger.push(Event::Entered(self.id));
        let exit = match self.script.pop_front() {
            Some(Step::Exit(exit)) => exit,
            Some(Step::Fail) => return Err(errno::Error::new(libc::EFAULT)),
            None => GuestExit::Unhandled("script exhausted".into()),
        };
        self.ledger.push(Event::Exited(self.id, exit.clone()));
        Ok(exit)
    }
}

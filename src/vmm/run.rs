//! Lifecycle: create → load → run all → join all → tear down.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{error, info, warn};

use super::event_loop::{GoSignal, StateCell, VcpuState};
use super::hypervisor::{Hypervisor, VmContext};
use super::machine::Vm;
use super::vcpu::Vcpu;
use crate::config::VmConfig;
use crate::error::{Result, VmmError};
use crate::types::{Released, RunReport, VcpuReport};


const JOIN_POLL: Duration = Duration::from_millis(10);

type VcpuOf<H> = Vcpu<<<H as Hypervisor>::Vm as VmContext>::Vcpu>;
type VcpuThread<H> = JoinHandle<(VcpuOf<H>, Result<VcpuState>)>;

struct Worker<H: Hypervisor> {
    id: u8,
    handle: VcpuThread<H>,
}


/// Owns the hypervisor, the VM and the go signal every vCPU thread shares.
///
/// Teardown runs on drop if [`Coordinator::destroy_all`] was not called.
pub struct Coordinator<H: Hypervisor> {
    workers: Vec<Worker<H>>,
    vm: Option<Vm<H::Vm>>,
    hv: Option<H>,
    signal: Arc<GoSignal>,
    states: Vec<Arc<StateCell>>,
    api_version: i32,
    #[cfg(test)]
    fail_spawn: Option<u8>,
}


impl<H: Hypervisor> Coordinator<H> {
    pub fn new(hv: H, poll_interval: Duration) -> Self {
        let api_version = hv.api_version();
        Self {
            workers: Vec::new(),
            vm: None,
            hv: Some(hv),
            signal: Arc::new(GoSignal::new(poll_interval)),
            states: Vec::new(),
            api_version,
            #[cfg(test)]
            fail_spawn: None,
        }
    }

    pub fn api_version(&self) -> i32 { self.api_version }

    pub fn signal(&self) -> &GoSignal { &self.signal }

    pub fn create_vm(&mut self, memory_size: usize) -> Result<()> {
        if let Some(hv) = self.hv.as_ref() {
            self.vm = Some(Vm::create(hv, memory_size)?);
        }
        Ok(())
    }

    /// Load the image into guest memory. A no-op without a VM.
    pub fn load(&self, path: &Path) -> Result<usize> {
        match self.vm.as_ref() {
            Some(vm) => vm.load(path),
            None => Ok(0),
        }
    }

    pub fn create_vcpus(&mut self, count: u8) -> Result<()> {
        let (Some(hv), Some(vm)) = (self.hv.as_ref(), self.vm.as_mut()) else {
            return Ok(());
        };
        for _ in 0..count {
            vm.add_vcpu(hv)?;
            self.states.push(Arc::new(StateCell::new()));
        }
        Ok(())
    }

    pub fn setup(&mut self, cfg: &VmConfig) -> Result<()> {
        self.create_vm(cfg.memory_size)?;
        self.load(&cfg.executable)?;
        self.create_vcpus(cfg.vcpus)
    }

    fn spawn_vcpu(&self, mut vcpu: VcpuOf<H>) -> io::Result<VcpuThread<H>> {
        let id = vcpu.id();
        let signal = self.signal.clone();
        let state = self.states[usize::from(id)].clone();
        let body = move || {
            let res = vcpu.run_loop(&signal, &state);
            match res {
                Ok(VcpuState::Parked) => {
                    info!("#{}: parked", id);
                    // never re-enters the guest, never returns
                    loop {
                        thread::park();
                    }
                }
                Err(ref e) => {
                    state.set(VcpuState::Failed);
                    error!("#{}: {}", id, e);
                }
                Ok(_) => info!("#{}: terminated", id),
            }
            (vcpu, res)
        };

        #[cfg(test)]
        if self.fail_spawn == Some(id) {
            // same as a failed spawn: the closure and its vCPU are dropped
            drop(body);
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "thread limit reached"));
        }
        thread::Builder::new().name(format!("vcpu-{}", id)).spawn(body)
    }

    /// Start one thread per vCPU.
    ///
    /// A vCPU whose thread fails to spawn is released on the spot. The ones
    /// not yet started go back to the VM and the threads already running
    /// stay joinable.
    pub fn run_all(&mut self) -> Result<()> {
        let Some(vm) = self.vm.as_mut() else {
            return Ok(());
        };
        let mut pending = vm.take_vcpus().into_iter();
        while let Some(vcpu) = pending.next() {
            let id = vcpu.id();
            match self.spawn_vcpu(vcpu) {
                Ok(handle) => self.workers.push(Worker { id, handle }),
                Err(source) => {
                    if let Some(vm) = self.vm.as_mut() {
                        for rest in pending {
                            vm.return_vcpu(rest);
                        }
                    }
                    return Err(VmmError::Spawn { id, source });
                }
            }
        }
        info!("all threads started");
        Ok(())
    }

    /// Wait for every vCPU thread to finish, joining them in index order.
    ///
    /// Never returns while a vCPU is parked. A vCPU that failed is joined
    /// out of turn so its fatal error ends the wait at once.
    pub fn join_all(&mut self) -> Result<()> {
        self.join_until(None).map(|_| ())
    }

    /// Like [`Coordinator::join_all`] but gives up after `timeout`, returning
    /// the ids whose threads are still live.
    pub fn join_all_timeout(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        self.join_until(Some(Instant::now() + timeout))
    }

    fn join_until(&mut self, deadline: Option<Instant>) -> Result<Vec<u8>> {
        loop {
            while self.workers.first().is_some_and(|w| w.handle.is_finished()) {
                let w = self.workers.remove(0);
                self.reap(w)?;
            }
            let failed = self.workers.iter().position(|w| {
                w.handle.is_finished() && self.states[usize::from(w.id)].get() == VcpuState::Failed
            });
            if let Some(i) = failed {
                let w = self.workers.remove(i);
                self.reap(w)?;
            }

            if self.workers.is_empty() {
                return Ok(Vec::new());
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(self.live());
            }
            thread::sleep(JOIN_POLL);
        }
    }

    fn reap(&mut self, worker: Worker<H>) -> Result<()> {
        let Worker { id, handle } = worker;
        let (vcpu, res) = handle.join().map_err(|_| VmmError::VcpuPanicked { id })?;
        info!("thread {} joined", id);
        if let Some(vm) = self.vm.as_mut() {
            vm.return_vcpu(vcpu);
        }
        res.map(|_| ())
    }

    /// Ids of vCPUs whose threads have not been joined.
    pub fn live(&self) -> Vec<u8> { self.workers.iter().map(|w| w.id).collect() }

    pub fn states(&self) -> Vec<VcpuReport> {
        self.states
            .iter()
            .enumerate()
            .map(|(id, s)| VcpuReport { id: id as u8, state: s.get() })
            .collect()
    }

    /// Release vCPUs, then the VM connection and guest memory, then the
    /// hypervisor. Safe to call more than once.
    ///
    /// While any vCPU thread is still live the VM and its memory are leaked
    /// rather than pulled out from under that thread.
    pub fn destroy_all(&mut self) -> Vec<Released> {
        let mut released = Vec::new();
        if let Some(mut vm) = self.vm.take() {
            if self.workers.is_empty() {
                vm.destroy(&mut released);
            } else {
                vm.release_vcpus(&mut released);
                warn!("vCPUs {:?} still live, leaving the VM and guest memory mapped", self.live());
                std::mem::forget(vm);
            }
        }
        if let Some(hv) = self.hv.take() {
            drop(hv);
            released.push(Released::Hypervisor);
        }
        for r in &released {
            info!("released {:?}", r);
        }
        released
    }

    /// Set up, run every vCPU to completion and tear down.
    ///
    /// A VM construction failure is reported in the returned report and the
    /// run continues with no vCPUs. Any other failure is returned after
    /// teardown.
    pub fn run(mut self, cfg: &VmConfig) -> Result<RunReport> {
        let mut report = RunReport { api_version: self.api_version, ..Default::default() };

        let outcome = self.drive(cfg, &mut report);
        report.vcpus = self.states();
        report.released = self.destroy_all();
        outcome.map(|()| report)
    }

    fn drive(&mut self, cfg: &VmConfig, report: &mut RunReport) -> Result<()> {
        if let Err(e) = self.setup(cfg) {
            if !e.is_recoverable_setup() {
                return Err(e);
            }
            warn!("create vm fault: {}", e);
            report.setup_error = Some(e.to_string());
        }

        self.run_all()?;
        let live = match cfg.join_timeout {
            Some(t) => self.join_all_timeout(t)?,
            None => {
                self.join_all()?;
                Vec::new()
            }
        };

        let unfinished: Vec<u8> = self
            .states()
            .into_iter()
            .filter(|v| live.contains(&v.id) && !v.state.is_final())
            .map(|v| v.id)
            .collect();
        if !unfinished.is_empty() {
            warn!("vCPUs {:?} did not finish within {:?}", unfinished, cfg.join_timeout);
        }
        Ok(())
    }
}


impl<H: Hypervisor> Drop for Coordinator<H> {
    fn drop(&mut self) { self.destroy_all(); }
}


/// Boot `cfg.vcpus` vCPUs on `hv`, run them to completion and tear down.
pub fn run_vm<H: Hypervisor>(hv: H, cfg: &VmConfig) -> Result<RunReport> {
    Coordinator::new(hv, cfg.poll_interval).run(cfg)
}

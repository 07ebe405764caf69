//! Exit dispatch: what a vCPU does after the guest hands control back.
//!
//! The guest talks to the host through four single-word port writes:
//!
//! | port | meaning                                           |
//! |------|---------------------------------------------------|
//! | 1    | wait until the go signal is raised, then resume   |
//! | 2    | raise the go signal, then resume                  |
//! | 3    | halt this vCPU                                    |
//! | 4    | raise the go signal and park forever              |
//!
//! Every other port, and every non-I/O exit, stops the vCPU.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, info, trace, warn};
use serde::Serialize;

use super::hypervisor::GuestExit;


#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Port {
    WaitForGo = 1,
    SignalGo = 2,
    Halt = 3,
    SignalAndPark = 4,
}

impl Port {
    pub fn decode(port: u16) -> Option<Self> {
        match port {
            1 => Some(Port::WaitForGo),
            2 => Some(Port::SignalGo),
            3 => Some(Port::Halt),
            4 => Some(Port::SignalAndPark),
            _ => None,
        }
    }
}


/// Where a vCPU is in its run loop.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VcpuState {
    Created = 0,
    Running = 1,
    Dispatching = 2,
    BlockedWait = 3,
    Terminated = 4,
    /// Raised the go signal via port 4. Never re-enters the guest and its
    /// thread never finishes.
    Parked = 5,
    /// The run loop hit a fatal error.
    Failed = 6,
}

impl VcpuState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => VcpuState::Running,
            2 => VcpuState::Dispatching,
            3 => VcpuState::BlockedWait,
            4 => VcpuState::Terminated,
            5 => VcpuState::Parked,
            6 => VcpuState::Failed,
            _ => VcpuState::Created,
        }
    }

    pub fn is_final(self) -> bool {
        matches!(self, VcpuState::Terminated | VcpuState::Parked | VcpuState::Failed)
    }
}


/// Last published state of one vCPU, readable from any thread.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new() -> Self { Self(AtomicU8::new(VcpuState::Created as u8)) }
    pub fn set(&self, s: VcpuState) { self.0.store(s as u8, Ordering::Release) }
    pub fn get(&self) -> VcpuState { VcpuState::from_u8(self.0.load(Ordering::Acquire)) }
}

impl Default for StateCell {
    fn default() -> Self { Self::new() }
}


/// The one piece of state shared between vCPUs: a monotonic "go" flag.
///
/// Once raised it stays raised. Waiters re-check it every poll interval, and
/// a raise also wakes them right away.
#[derive(Debug)]
pub struct GoSignal {
    raised: AtomicBool,
    lock: Mutex<()>,
    cv: Condvar,
    poll: Duration,
}

impl GoSignal {
    pub fn new(poll: Duration) -> Self {
        Self { raised: AtomicBool::new(false), lock: Mutex::new(()), cv: Condvar::new(), poll }
    }

    pub fn is_raised(&self) -> bool { self.raised.load(Ordering::Acquire) }

    pub fn raise(&self) {
        if !self.raised.swap(true, Ordering::AcqRel) {
            // taken so a waiter between its check and its wait can't miss us
            let _g = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.cv.notify_all();
        }
    }

    /// Block until raised. Returns how many poll ticks elapsed.
    pub fn wait(&self) -> u64 {
        let mut ticks = 0;
        let mut guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !self.is_raised() {
            guard = self
                .cv
                .wait_timeout(guard, self.poll)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
            ticks += 1;
            trace!("go signal poll tick {}", ticks);
        }
        ticks
    }
}


/// What the run loop does next.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExitAction {
    /// Re-enter the guest.
    Continue,
    Terminate,
    /// Stop re-entering the guest, forever.
    Park,
}


/// Interpret one guest exit. Port 1 blocks here until the go signal is up.
pub fn dispatch(id: u8, exit: &GuestExit, signal: &GoSignal, state: &StateCell) -> ExitAction {
    state.set(VcpuState::Dispatching);
    let (port, data) = match *exit {
        GuestExit::IoOut { port, data } => (port, data),
        GuestExit::Unhandled(ref reason) => {
            warn!("#{}: unhandled exit reason: {}", id, reason);
            return ExitAction::Terminate;
        }
    };
    debug!("#{}: out port: {}, data: {}", id, port, data);

    match Port::decode(port) {
        Some(Port::WaitForGo) => {
            state.set(VcpuState::BlockedWait);
            let ticks = signal.wait();
            info!("#{}: loop starting... (after {} polls)", id, ticks);
            ExitAction::Continue
        }
        Some(Port::SignalGo) => {
            signal.raise();
            ExitAction::Continue
        }
        Some(Port::Halt) => ExitAction::Terminate,
        Some(Port::SignalAndPark) => {
            signal.raise();
            ExitAction::Park
        }
        None => {
            warn!("#{}: unhandled exit reason: write to port {}", id, port);
            ExitAction::Terminate
        }
    }
}

//! Minimal KVM harness.
//!
//! Creates a VM with one flat memory region, copies a real-mode image to the
//! code segment and runs several vCPUs, one thread each. The guest drives the
//! host through port writes: wait for go, signal go, halt, signal and park.


pub mod config;
pub mod error;
pub mod types;
pub mod vmm;


pub use config::VmConfig;
pub use error::{Result, VmmError};
pub use types::{Released, RunReport, VcpuReport};
pub use vmm::run::{run_vm, Coordinator};

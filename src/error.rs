use std::io;
use std::path::PathBuf;

use thiserror::Error;
use vmm_sys_util::errno;

#[derive(Error, Debug)]
pub enum VmmError {
    /// /dev/kvm is missing or not accessible to this user.
    #[error("hypervisor unavailable: {0}")]
    Unavailable(#[source] errno::Error),

    #[error("failed to create VM: {0}")]
    CreateVm(#[source] errno::Error),

    #[error("failed to reserve {size} bytes of guest memory: {reason}")]
    Allocation { size: usize, reason: String },

    #[error("failed to install guest memory region: {0}")]
    MemoryInstall(#[source] errno::Error),

    #[error("can not open executable {}: {source}", path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("executable {} does not fit in guest memory (load address {addr:#x}, memory size {size:#x})", path.display())]
    ImageTooLarge { path: PathBuf, addr: u64, size: usize },

    #[error("too many vCPUs requested: {requested} (max {max})")]
    TooManyVcpus { requested: usize, max: usize },

    #[error("failed to create vCPU {id}: {source}")]
    CreateVcpu {
        id: u8,
        #[source]
        source: errno::Error,
    },

    #[error("failed to query vCPU run page size: {0}")]
    QueryRunSize(#[source] errno::Error),

    #[error("failed to map run page of vCPU {id}: {source}")]
    MapRunPage {
        id: u8,
        #[source]
        source: errno::Error,
    },

    #[error("vCPU {id}: {op} failed: {source}")]
    Register {
        id: u8,
        op: &'static str,
        #[source]
        source: errno::Error,
    },

    #[error("vCPU {id}: KVM_RUN failed: {source}")]
    Run {
        id: u8,
        #[source]
        source: errno::Error,
    },

    #[error("can not spawn thread for vCPU {id}: {source}")]
    Spawn {
        id: u8,
        #[source]
        source: io::Error,
    },

    #[error("vCPU {id} thread panicked")]
    VcpuPanicked { id: u8 },
}

impl VmmError {
    /// VM construction failures fall through to an empty run and a clean
    /// teardown instead of failing the process.
    pub fn is_recoverable_setup(&self) -> bool {
        matches!(
            self,
            VmmError::CreateVm(_) | VmmError::Allocation { .. } | VmmError::MemoryInstall(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, VmmError>;

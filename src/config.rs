use std::path::PathBuf;
use std::time::Duration;

use crate::vmm::boot::code_load_address;

/// Upper bound on vCPUs per VM.
pub const MAX_VCPUS: usize = 10;

/// Executable loaded when none is given on the command line.
pub const DEFAULT_EXECUTABLE: &str = "test.bin";

/// Guest RAM (bytes)
pub const DEFAULT_MEMORY_SIZE: usize = 512_000_000;

/// Main configuration for one VM run
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Flat binary image, copied verbatim to the code segment
    pub executable: PathBuf,
    /// Guest memory (bytes), mapped at guest-physical 0
    pub memory_size: usize,
    /// Number of vCPUs, each on its own thread
    pub vcpus: u8,
    /// How often a vCPU blocked on port 1 re-checks the go signal
    pub poll_interval: Duration,
    /// None = join waits forever (a parked vCPU never finishes)
    pub join_timeout: Option<Duration>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from(DEFAULT_EXECUTABLE),
            memory_size: DEFAULT_MEMORY_SIZE,
            vcpus: 2,
            poll_interval: Duration::from_secs(1),
            join_timeout: None,
        }
    }
}

impl VmConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.vcpus == 0 {
            anyhow::bail!("at least one vCPU is required");
        }
        if usize::from(self.vcpus) > MAX_VCPUS {
            anyhow::bail!("at most {} vCPUs are supported, got {}", MAX_VCPUS, self.vcpus);
        }
        let code = code_load_address() as usize;
        if self.memory_size <= code {
            anyhow::bail!(
                "memory size {:#x} does not reach the code segment at {:#x}",
                self.memory_size,
                code
            );
        }
        if self.poll_interval.is_zero() {
            anyhow::bail!("poll interval must be non-zero");
        }
        Ok(())
    }
}

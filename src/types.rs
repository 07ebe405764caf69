use serde::Serialize;

use crate::vmm::event_loop::VcpuState;


/// One resource handed back during teardown, in the order it happened.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "resource", rename_all = "snake_case")]
pub enum Released {
    RunPage { vcpu: u8 },
    VcpuConnection { vcpu: u8 },
    VmConnection,
    GuestMemory { bytes: usize },
    Hypervisor,
}


#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VcpuReport {
    pub id: u8,
    pub state: VcpuState,
}


/// Run result
#[derive(Clone, Debug, Default, Serialize)]
pub struct RunReport {
    pub api_version: i32,
    /// VM construction failure that was reported and run through (exit 0)
    pub setup_error: Option<String>,
    pub vcpus: Vec<VcpuReport>,
    pub released: Vec<Released>,
}

impl RunReport {
    pub fn parked(&self) -> impl Iterator<Item = u8> + '_ {
        self.vcpus.iter().filter(|v| v.state == VcpuState::Parked).map(|v| v.id)
    }
}

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;

use kvm_bindings::{kvm_regs, kvm_segment, kvm_sregs};
use log::{debug, info};
use vm_memory::{Bytes, GuestAddress};

use super::memory::GuestMem;
use crate::error::{Result, VmmError};


/// Real-mode selector of the code, stack and data segments.
pub const CODE_START: u16 = 0x1000;

/// Bit 1 of RFLAGS is reserved and must be set.
pub const RFLAGS_RESERVED: u64 = 0x2;

const LOAD_CHUNK: usize = 4096;


/// Guest-physical address the image lands at: the segment base of
/// `CODE_START`, where execution starts with rip = 0.
pub const fn code_load_address() -> u64 { (CODE_START as u64) * 16 }


/// Copy a flat binary verbatim to the code segment, chunk by chunk.
pub fn load_executable(gm: &GuestMem, path: &Path) -> Result<usize> {
    let load_err = |source| VmmError::Load { path: path.to_path_buf(), source };
    let mut image = File::open(path).map_err(load_err)?;

    let start = code_load_address();
    let mut buf = [0u8; LOAD_CHUNK];
    let mut loaded = 0usize;
    loop {
        let n = match image.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(load_err(e)),
        };
        let addr = start + loaded as u64;
        if addr + n as u64 > gm.size() as u64 {
            return Err(VmmError::ImageTooLarge { path: path.to_path_buf(), addr: start, size: gm.size() });
        }
        gm.mem
            .write_slice(&buf[..n], GuestAddress(addr))
            .map_err(|_| VmmError::ImageTooLarge { path: path.to_path_buf(), addr: start, size: gm.size() })?;
        loaded += n;
    }

    info!("loaded {} bytes from {} at {:#x}", loaded, path.display(), start);
    Ok(loaded)
}


fn real_mode_segment(seg: &mut kvm_segment) {
    seg.selector = CODE_START;
    seg.base = code_load_address();
}

/// Point cs/ss/ds/es/fs/gs at the code segment, keep the rest of `sregs`.
pub fn setup_sregs(sregs: &mut kvm_sregs) {
    for seg in [
        &mut sregs.cs,
        &mut sregs.ss,
        &mut sregs.ds,
        &mut sregs.es,
        &mut sregs.fs,
        &mut sregs.gs,
    ] {
        real_mode_segment(seg);
    }
}

/// Boot registers for vCPU `id`. rax carries the id so the guest knows which
/// CPU it runs on.
pub fn boot_regs(id: u8) -> kvm_regs {
    debug!("#{}: boot regs rax={}", id, id);
    kvm_regs {
        rflags: RFLAGS_RESERVED,
        rip: 0,
        rax: id.into(),
        rsp: 0xffff_ffff,
        rbp: 0,
        ..Default::default()
    }
}

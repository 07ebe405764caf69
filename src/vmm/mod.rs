pub mod hypervisor;
pub mod kvm_ctx;
pub mod memory;
pub mod boot;
pub mod vcpu;
pub mod machine;
pub mod event_loop;
pub mod run;
#[cfg(test)] pub mod fake;

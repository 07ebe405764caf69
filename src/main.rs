use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::{error, info};
use tracing_subscriber::EnvFilter;

use tinyvmm::config::{DEFAULT_EXECUTABLE, DEFAULT_MEMORY_SIZE};
use tinyvmm::vmm::kvm_ctx;
use tinyvmm::{run_vm, VmConfig};


#[derive(clap::Parser, Debug)]
#[clap(about = "Boot a flat real-mode image on KVM vCPUs")]
struct Args {
    /// Flat binary loaded at the code segment
    #[clap(value_name = "EXECUTABLE", default_value = DEFAULT_EXECUTABLE)]
    executable: PathBuf,

    /// Number of vCPUs
    #[clap(long, default_value_t = 2)]
    vcpus: u8,

    /// Guest memory in bytes
    #[clap(long, default_value_t = DEFAULT_MEMORY_SIZE)]
    memory_size: usize,

    /// Poll interval of a vCPU waiting on port 1, in milliseconds
    #[clap(long, default_value_t = 1000)]
    poll_ms: u64,

    /// Stop waiting for vCPUs after this many seconds and report the live ones
    #[clap(long)]
    join_timeout_secs: Option<u64>,

    /// Print the run report as JSON on stdout
    #[clap(long, action)]
    json: bool,
}

impl Args {
    fn config(&self) -> VmConfig {
        VmConfig {
            executable: self.executable.clone(),
            memory_size: self.memory_size,
            vcpus: self.vcpus,
            poll_interval: Duration::from_millis(self.poll_ms),
            join_timeout: self.join_timeout_secs.map(Duration::from_secs),
        }
    }
}


fn set_tracing_subscriber() {
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_line_number(true)
        .init();
}


fn run(args: &Args) -> anyhow::Result<()> {
    let cfg = args.config();
    cfg.validate()?;

    let kvm = kvm_ctx::open().context("kvm init fault")?;
    let report = run_vm(kvm, &cfg).context("VM run failed")?;

    let parked: Vec<u8> = report.parked().collect();
    if !parked.is_empty() {
        info!("vCPUs {:?} parked", parked);
    }
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}


fn main() -> ExitCode {
    set_tracing_subscriber();
    let args = Args::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(1)
        }
    }
}

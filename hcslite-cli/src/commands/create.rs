use std::path::PathBuf;

use clap::Args;
use hcslite::CreateOptions;

use crate::cli::GlobalFlags;

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Container identifier
    pub id: String,

    /// Path to the OCI bundle (defaults to the current directory)
    #[arg(short, long, default_value = ".")]
    pub bundle: PathBuf,

    /// File to write the container shim's pid to
    #[arg(long)]
    pub pid_file: Option<PathBuf>,

    /// Log file for the container shim
    #[arg(long)]
    pub shim_log: Option<PathBuf>,

    /// Log file for the VM shim
    #[arg(long)]
    pub vm_log: Option<PathBuf>,
}

pub async fn execute(args: CreateArgs, global: &GlobalFlags) -> anyhow::Result<i32> {
    let runtime = global.runtime()?;
    runtime
        .create(CreateOptions {
            id: args.id,
            bundle: args.bundle,
            pid_file: args.pid_file,
            shim_log: args.shim_log,
            vm_log: args.vm_log,
        })
        .await?;
    Ok(0)
}

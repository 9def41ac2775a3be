use std::path::PathBuf;

use clap::Args;
use hcslite::shim::container::{self, ContainerShimOptions};
use hcslite::shim::spawn;

use crate::cli::GlobalFlags;

#[derive(Args, Debug)]
pub struct ShimArgs {
    /// Container this shim serves
    #[arg(long)]
    pub container: String,

    /// Exec mode: create one additional process instead of owning init
    #[arg(long, requires = "process")]
    pub exec: bool,

    /// Process document for exec mode
    #[arg(long)]
    pub process: Option<PathBuf>,

    /// Pipe name to dial for the process's stdin
    #[arg(long)]
    pub stdin: Option<String>,

    /// Pipe name to dial for the process's stdout
    #[arg(long)]
    pub stdout: Option<String>,

    /// Pipe name to dial for the process's stderr
    #[arg(long)]
    pub stderr: Option<String>,

    /// Log file (defaults to the runtime log directory)
    #[arg(long)]
    pub log: Option<PathBuf>,
}

pub async fn execute(args: ShimArgs, global: &GlobalFlags) -> anyhow::Result<i32> {
    let runtime = match global.runtime() {
        Ok(runtime) => runtime,
        Err(err) => spawn::fail_parent(&hcslite::HcsliteError::Internal(format!("{:#}", err))),
    };

    let _log_guard = crate::commands::vmshim::init_shim_logging(
        runtime.options(),
        args.log.as_deref(),
        "runhcs-shim.log",
    );
    spawn::watch_parent();

    let options = ContainerShimOptions {
        container_id: args.container,
        exec_process: if args.exec { args.process } else { None },
        stdin: args.stdin,
        stdout: args.stdout,
        stderr: args.stderr,
    };

    match container::run(
        runtime.shim_env(),
        options,
        Box::new(spawn::signal_parent_ready),
    )
    .await
    {
        Ok(exit_code) => Ok(exit_code),
        Err(err) => spawn::fail_parent(&err),
    }
}
